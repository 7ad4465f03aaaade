//! # DetectNet 推論ライブラリ
//!
//! 学習済みネットワークを推論エンジンにビルドし，DetectNet形式の出力
//! (カバレッジとバウンディングボックスのグリッド) を検出結果に変換するRustライブラリです。
//!
//! ## 主な機能
//!
//! 1. **エンジンのビルド**: JSONグラフまたはdarknet形式のモデルを，バッチサイズと精度を固定した実行計画にします。
//! 2. **エンジンキャッシュ**: ビルド済みのエンジンを保存・読み込みし，再ビルドを省きます。
//! 3. **バッチ推論**: デバイスメモリをプールで再利用しながら順伝播を実行します。
//! 4. **クラスタリング**: 重なった候補をクラスごとにまとめ，画像の座標系の矩形を返します。
//!
//! ## Example
//! ```no_run
//! use detectnet_rt::{Detector, DetectorConfig};
//!
//! let config = DetectorConfig::from_json_file("detector.json")?;
//! let mut detector = Detector::new(&config)?;
//! let img = image::open("test.jpg")?;
//! let result = detector.detect_image(&img, config.threshold)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod archive;
pub mod binding;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod detection_result;
pub mod detector;
pub mod device;
pub mod engine;
pub mod error;
pub mod img_proc;
pub mod kernels;
pub mod memory_pool;
pub mod network;
pub mod parser;
pub mod suppressor;
pub mod tensor;

pub use binding::{Dims, NetworkBinding, Role};
pub use compiler::{BuildOptions, CompiledEngine, Precision};
pub use config::DetectorConfig;
pub use detection_result::Detection;
pub use detector::Detector;
pub use device::{Device, DeviceCapabilities, HostDevice};
pub use engine::{Engine, InferenceEngine};
pub use error::{EngineError, Result};
pub use parser::ModelFormat;
pub use suppressor::ClusteredSuppressor;
