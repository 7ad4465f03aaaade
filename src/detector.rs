//! DetectNet形式の検出器 (推論エンジン + クラスタリング) をコントロールするモジュール

use image::DynamicImage;
use log::{info, warn};

use crate::binding::Dims;
use crate::config::DetectorConfig;
use crate::detection_result::Detection;
use crate::device::{Device, HostDevice};
use crate::engine::{Engine, InferenceEngine};
use crate::error::{EngineError, Result};
use crate::img_proc::ImagePreprocessor;
use crate::suppressor::ClusteredSuppressor;
use crate::tensor::bytes_to_f32s;

/// 入力バインディングの名前
pub const INPUT_NAME: &str = "data";
/// カバレッジ出力の名前
pub const COVERAGE_NAME: &str = "coverage";
/// バウンディングボックス出力の名前
pub const BBOXES_NAME: &str = "bboxes";

/// 対応している入力チャネル数 (BGR)
const CHANNELS_BGR: usize = 3;

/// 推論エンジンとサプレッサを1つずつ持つ検出器
pub struct Detector {
    engine: InferenceEngine,
    suppressor: ClusteredSuppressor,
    preprocessor: ImagePreprocessor,
    config: DetectorConfig,
}

impl Detector {
    /// ホストデバイスで動作する新しい `Detector` を作成します。
    ///
    /// # Args
    /// * `config` - 検出器の設定
    ///
    /// # Return
    /// * 新たな `Detector` インスタンス
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        Self::with_device(config, Box::new(HostDevice::new()))
    }

    /// デバイスを指定して新しい `Detector` を作成します。
    ///
    /// キャッシュが存在して有効ならそれを読み込み，無い・一致しない場合は
    /// バッチサイズ1でビルドしてキャッシュを保存し直す。精度が設定と違うキャッシュも
    /// 作り直す。
    pub fn with_device(config: &DetectorConfig, device: Box<dyn Device>) -> Result<Self> {
        if config.channels != CHANNELS_BGR {
            return Err(EngineError::UnsupportedInputFormat {
                channels: config.channels,
            });
        }
        config
            .validate()
            .map_err(|e| EngineError::InvalidInput(format!("{:#}", e)))?;

        let (grid_w, grid_h) = config.grid_size();
        let mut engine = InferenceEngine::with_device(config.format, device);
        engine.add_input(INPUT_NAME, Dims::chw(config.channels, config.height, config.width), 4)?;
        engine.add_output(COVERAGE_NAME, Dims::chw(config.classes, grid_h, grid_w), 4)?;
        engine.add_output(BBOXES_NAME, Dims::chw(4, grid_h, grid_w), 4)?;

        let cached = if config.cache.exists() {
            match engine.load_cache(&config.cache, 1) {
                Ok(()) if engine.compiled().map(|c| c.precision()) == Some(config.precision) => true,
                Ok(()) => {
                    warn!(
                        "cache {:?} was built for another precision than {:?}, rebuilding",
                        config.cache, config.precision
                    );
                    engine.unload();
                    false
                }
                Err(e) if e.is_recoverable() => {
                    warn!("{}, rebuilding from {:?}", e, config.model);
                    false
                }
                Err(e) => return Err(e),
            }
        } else {
            false
        };
        if !cached {
            engine.load_model(&config.model, &config.weights, &config.build_options())?;
            engine.save_cache(&config.cache)?;
        }
        info!(
            "detector ready: {}x{} input, {}x{} grid, {} classes",
            config.width, config.height, grid_w, grid_h, config.classes
        );

        let mut suppressor = ClusteredSuppressor::new();
        suppressor.setup_input(config.width, config.height);
        suppressor.setup_grid(grid_w, grid_h);

        Ok(Self {
            engine,
            suppressor,
            preprocessor: ImagePreprocessor::new(config.means),
            config: config.clone(),
        })
    }

    /// 前処理済みの入力から物体を検出します。
    ///
    /// # Args
    /// * `input` - 入力バインディング1サンプル分のバイト列
    /// * `image_width` - 検出結果の座標系となる画像の幅
    /// * `image_height` - 検出結果の座標系となる画像の高さ
    /// * `threshold` - カバレッジの閾値
    ///
    /// # Return
    /// * 物体検出結果
    pub fn detect(
        &mut self,
        input: &[u8],
        image_width: usize,
        image_height: usize,
        threshold: f32,
    ) -> Result<Vec<Detection>> {
        let outputs = self.engine.predict(&[vec![input.to_vec()]])?;
        let sample = outputs
            .first()
            .ok_or_else(|| EngineError::InvalidState("engine returned no outputs".into()))?;
        let coverage = bytes_to_f32s(&sample[0]);
        let bboxes = bytes_to_f32s(&sample[1]);

        self.suppressor.setup_image(image_width, image_height);
        self.suppressor.execute(&coverage, &bboxes, self.config.classes, threshold)
    }

    /// 画像をモデルの入力サイズにリサイズして物体を検出します。
    ///
    /// 検出結果の座標はリサイズ後 (モデル入力) の座標系。
    ///
    /// # Args
    /// * `img` - 入力画像
    /// * `threshold` - カバレッジの閾値
    ///
    /// # Return
    /// * 物体検出結果
    pub fn detect_image(&mut self, img: &DynamicImage, threshold: f32) -> Result<Vec<Detection>> {
        let (w, h) = (self.config.width, self.config.height);
        let input = self
            .preprocessor
            .process(self.engine.device_mut(), img, w as u32, h as u32)?;
        self.detect(&input, w, h, threshold)
    }

    pub fn engine(&self) -> &InferenceEngine {
        &self.engine
    }

    pub fn suppressor(&self) -> &ClusteredSuppressor {
        &self.suppressor
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }
}
