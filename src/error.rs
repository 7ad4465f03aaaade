//! エンジンと検出処理で発生するエラーを定義するモジュール

use std::path::PathBuf;

use thiserror::Error;

use crate::compiler::Precision;

/// 推論エンジンと検出器が返すエラー
#[derive(Error, Debug)]
pub enum EngineError {
    /// モデル記述または重みファイルを解析できなかった
    #[error("failed to parse model {path:?}")]
    ModelParse {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// 登録したバインディングとモデルが一致しない
    #[error("model does not match registered bindings: {0}")]
    ModelMismatch(String),

    /// キャッシュを読み込めなかった (フルビルドにフォールバック可能)
    #[error("cannot load engine cache {path:?}: {reason}")]
    CacheLoad { path: PathBuf, reason: String },

    #[error("batch size {requested} exceeds the compiled maximum {max}")]
    BatchSizeExceeded { requested: usize, max: usize },

    #[error("precision {precision:?} is not supported by device {device}")]
    UnsupportedPrecision { precision: Precision, device: String },

    #[error("only 3 channel BGR inputs are supported, got {channels} channels")]
    UnsupportedInputFormat { channels: usize },

    /// デバイスメモリの確保・転送・実行の失敗 (致命的)
    #[error("device failure: {0}")]
    DeviceMemory(String),

    #[error("engine workspace needs {required} bytes but the limit is {limit} bytes")]
    WorkspaceExceeded { required: usize, limit: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid engine state: {0}")]
    InvalidState(String),

    /// 画像サイズ・入力サイズ・グリッドサイズのいずれかが未設定
    #[error("suppressor is not calibrated (image, input and grid sizes must all be set)")]
    NotCalibrated,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// 呼び出し側で回復できるエラーかどうかを返します。
    ///
    /// # Return
    /// * キャッシュの読み込み失敗のみ `true`
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::CacheLoad { .. })
    }

    pub(crate) fn cache_load<P: Into<PathBuf>, S: ToString>(path: P, reason: S) -> Self {
        EngineError::CacheLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn model_parse<P: Into<PathBuf>>(path: P, source: anyhow::Error) -> Self {
        EngineError::ModelParse {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_cache_errors_are_recoverable() {
        assert!(EngineError::cache_load("engine.cache", "missing").is_recoverable());
        assert!(!EngineError::DeviceMemory("copy failed".into()).is_recoverable());
        assert!(!EngineError::BatchSizeExceeded { requested: 2, max: 1 }.is_recoverable());
    }

    #[test]
    fn parse_error_keeps_source_chain() {
        let err = EngineError::model_parse("net.json", anyhow::anyhow!("unexpected token"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("unexpected token"));
    }
}
