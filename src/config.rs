//! 検出器の実行時設定

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::compiler::{BuildOptions, Precision};
use crate::parser::ModelFormat;

fn default_channels() -> usize {
    3
}

fn default_threshold() -> f32 {
    0.5
}

fn default_workspace() -> usize {
    BuildOptions::default().max_workspace_bytes
}

/// DetectNet検出器の設定 (JSONファイルから読み込む)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// モデル記述の形式
    #[serde(default)]
    pub format: ModelFormat,
    /// モデル記述のパス
    pub model: PathBuf,
    /// 重みファイルのパス
    pub weights: PathBuf,
    /// エンジンキャッシュのパス
    pub cache: PathBuf,
    #[serde(default = "default_channels")]
    pub channels: usize,
    pub width: usize,
    pub height: usize,
    /// 入力から出力グリッドへの縮小率
    pub stride: usize,
    pub classes: usize,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_workspace")]
    pub max_workspace_bytes: usize,
    /// カバレッジの閾値
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// チャネルごとの平均値 (B, G, R の順)
    #[serde(default)]
    pub means: [f32; 3],
}

impl DetectorConfig {
    /// JSONファイルから設定を読み込みます。
    ///
    /// # Args
    /// * `path` - 設定ファイルのパス
    ///
    /// # Return
    /// * 検証済みの設定
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("cannot read config {:?}", path))?;
        let config: Self = serde_json::from_str(&text).with_context(|| format!("invalid config {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// 値の範囲を検証します。
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.threshold),
            "threshold {} is outside [0, 1]",
            self.threshold
        );
        ensure!(self.stride > 0, "stride must be positive");
        ensure!(
            self.width >= self.stride && self.height >= self.stride,
            "input {}x{} is smaller than the stride {}",
            self.width,
            self.height,
            self.stride
        );
        ensure!(self.classes > 0, "at least one class is required");
        Ok(())
    }

    /// 出力グリッドのサイズ (幅, 高さ)
    pub fn grid_size(&self) -> (usize, usize) {
        (self.width / self.stride, self.height / self.stride)
    }

    /// バッチサイズ1でビルドするための設定
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            max_batch_size: 1,
            precision: self.precision,
            max_workspace_bytes: self.max_workspace_bytes,
        }
    }
}
