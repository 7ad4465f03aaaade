//! ビルド済みエンジンのキャッシュファイルを読み書きするモジュール
//!
//! キャッシュは重みファイルと同じgzip圧縮tarアーカイブで，`manifest.json` と
//! 畳み込みステップごとの `weights{i}` / `biases{i}` (int8 の場合は `scales{i}`) を含む。

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, ensure, Context};
use half::f16;
use log::info;
use serde::{Deserialize, Serialize};

use crate::archive;
use crate::binding::{NetworkBinding, Role};
use crate::compiler::{CompiledEngine, ConvWeights, KernelOp, Precision, Step, TensorInfo, EXECUTABLE_ELEMENT_SIZE};
use crate::error::{EngineError, Result};
use crate::network;
use crate::tensor::f32s_to_bytes;

/// キャッシュ形式のバージョン
pub const CACHE_FORMAT_VERSION: u32 = 1;

const MANIFEST_NAME: &str = "manifest.json";

#[derive(Serialize, Deserialize)]
struct Manifest {
    version: u32,
    max_batch_size: usize,
    precision: Precision,
    bindings: Vec<NetworkBinding>,
    binding_tensors: Vec<usize>,
    tensors: Vec<TensorInfo>,
    steps: Vec<Step>,
    workspace_bytes: usize,
}

/// エンジンをキャッシュファイルに書き出します。
///
/// # Args
/// * `path` - 出力先のパス
/// * `engine` - ビルド済みエンジン
pub fn save<P: AsRef<Path>>(path: P, engine: &CompiledEngine) -> Result<()> {
    let manifest = Manifest {
        version: CACHE_FORMAT_VERSION,
        max_batch_size: engine.max_batch_size,
        precision: engine.precision,
        bindings: engine.bindings.clone(),
        binding_tensors: engine.binding_tensors.clone(),
        tensors: engine.tensors.clone(),
        steps: engine.steps.clone(),
        workspace_bytes: engine.workspace_bytes,
    };
    let json = serde_json::to_vec_pretty(&manifest).map_err(std::io::Error::from)?;

    let mut entries = vec![(MANIFEST_NAME.to_string(), json)];
    for (i, step) in engine.steps.iter().enumerate() {
        if let KernelOp::Convolution(conv) = &step.op {
            let weights = match &conv.weights {
                ConvWeights::F32(w) => f32s_to_bytes(w),
                ConvWeights::F16(w) => w.iter().flat_map(|v| v.to_bits().to_le_bytes()).collect(),
                ConvWeights::Int8 { values, scales } => {
                    entries.push((format!("scales{}", i), f32s_to_bytes(scales)));
                    values.iter().map(|&v| v as u8).collect()
                }
            };
            entries.push((format!("weights{}", i), weights));
            entries.push((format!("biases{}", i), f32s_to_bytes(&conv.biases)));
        }
    }

    archive::write_entries(path.as_ref(), &entries)?;
    info!("saved engine cache to {:?}", path.as_ref());
    Ok(())
}

/// キャッシュファイルからエンジンを読み込みます。
///
/// ファイルが存在しない・壊れている・バッチサイズやバインディングが一致しない
/// 場合は，回復可能な `EngineError::CacheLoad` を返す。
///
/// # Args
/// * `path` - キャッシュファイルのパス
/// * `bindings` - 現在登録されているバインディング (入力 → 出力の順)
/// * `max_batch_size` - 要求する最大バッチサイズ
///
/// # Return
/// * 読み込んだエンジン
pub fn load<P: AsRef<Path>>(path: P, bindings: &[NetworkBinding], max_batch_size: usize) -> Result<CompiledEngine> {
    let path = path.as_ref();
    let engine = read_engine(path).map_err(|e| EngineError::cache_load(path, format!("{:#}", e)))?;
    engine
        .check_compatible(bindings, max_batch_size)
        .map_err(|reason| EngineError::cache_load(path, reason))?;
    info!("loaded engine cache from {:?}", path);
    Ok(engine)
}

fn read_engine(path: &Path) -> anyhow::Result<CompiledEngine> {
    let mut entries: HashMap<String, Vec<u8>> = archive::read_entries(path)?.into_iter().collect();

    let manifest = entries.remove(MANIFEST_NAME).context("manifest is missing")?;
    let manifest: Manifest = serde_json::from_slice(&manifest).context("manifest is not valid")?;
    ensure!(
        manifest.version == CACHE_FORMAT_VERSION,
        "cache version {} is not supported (expected {})",
        manifest.version,
        CACHE_FORMAT_VERSION
    );

    let mut steps = manifest.steps;
    for (i, step) in steps.iter_mut().enumerate() {
        if let KernelOp::Convolution(conv) = &mut step.op {
            let count = [conv.channels, conv.kernel, conv.kernel]
                .iter()
                .try_fold(conv.filters, |acc, &d| acc.checked_mul(d))
                .with_context(|| format!("step {} has too many weights", i))?;
            let raw = entries
                .remove(&format!("weights{}", i))
                .with_context(|| format!("weights of step {} are missing", i))?;
            conv.weights = match manifest.precision {
                Precision::Standard => ConvWeights::F32(archive::decode_f32_le(&raw)?),
                Precision::Half => {
                    ensure!(raw.len() % 2 == 0, "half weights of step {} are truncated", i);
                    ConvWeights::F16(
                        raw.chunks_exact(2)
                            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])))
                            .collect(),
                    )
                }
                Precision::Int8 => {
                    let scales = entries
                        .remove(&format!("scales{}", i))
                        .with_context(|| format!("scales of step {} are missing", i))?;
                    let scales = archive::decode_f32_le(&scales)?;
                    ensure!(scales.len() == conv.filters, "step {} has {} scales", i, scales.len());
                    ConvWeights::Int8 {
                        values: raw.iter().map(|&v| v as i8).collect(),
                        scales,
                    }
                }
            };
            ensure!(
                conv.weights.len() == count,
                "step {} has {} weights, expected {}",
                i,
                conv.weights.len(),
                count
            );

            let biases = entries
                .remove(&format!("biases{}", i))
                .with_context(|| format!("biases of step {} are missing", i))?;
            conv.biases = archive::decode_f32_le(&biases)?;
            ensure!(conv.biases.len() == conv.filters, "step {} has {} biases", i, conv.biases.len());
        }
    }

    let engine = CompiledEngine {
        max_batch_size: manifest.max_batch_size,
        precision: manifest.precision,
        bindings: manifest.bindings,
        binding_tensors: manifest.binding_tensors,
        tensors: manifest.tensors,
        steps,
        workspace_bytes: manifest.workspace_bytes,
    };
    validate(&engine)?;
    Ok(engine)
}

/// 実行時に範囲外アクセスしないよう，マニフェストの整合性を確認します。
///
/// 各ステップは入力バインディングか前のステップの出力だけを読み，その出力次元は
/// ビルド時と同じ規則で入力次元から再計算した値と一致しなければならない。
fn validate(engine: &CompiledEngine) -> anyhow::Result<()> {
    let n = engine.tensors.len();
    for t in &engine.tensors {
        ensure!(t.dims.rank() == 3, "tensor {} is not CHW", t.name);
        let volume = t.dims.as_slice().iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        ensure!(matches!(volume, Some(v) if v > 0), "tensor {} has an invalid size", t.name);
    }
    ensure!(
        engine.binding_tensors.len() == engine.bindings.len(),
        "binding table has {} entries for {} bindings",
        engine.binding_tensors.len(),
        engine.bindings.len()
    );

    let mut produced = vec![false; n];
    for (b, &t) in engine.bindings.iter().zip(&engine.binding_tensors) {
        ensure!(t < n, "binding {} refers to missing tensor {}", b.name, t);
        ensure!(engine.tensors[t].dims == b.dims, "binding {} does not match its tensor", b.name);
        ensure!(
            b.element_size == EXECUTABLE_ELEMENT_SIZE,
            "binding {} uses {} byte elements",
            b.name,
            b.element_size
        );
        if b.role == Role::Input {
            produced[t] = true;
        }
    }

    for step in &engine.steps {
        ensure!(step.output < n, "step {} writes missing tensor {}", step.name, step.output);
        ensure!(!produced[step.output], "step {} overwrites tensor {}", step.name, step.output);
        let mut in_dims = Vec::with_capacity(step.inputs.len());
        for &i in &step.inputs {
            if i >= n || !produced[i] {
                bail!("step {} reads tensor {} before it is produced", step.name, i);
            }
            in_dims.push(engine.tensors[i].dims.clone());
        }

        let expected = network::infer_dims(step.op.shape_rule(), &in_dims)
            .with_context(|| format!("invalid step {}", step.name))?;
        let actual = &engine.tensors[step.output].dims;
        ensure!(
            &expected == actual,
            "step {} produces [{}] but its tensor is [{}]",
            step.name,
            expected,
            actual
        );
        if let KernelOp::Convolution(conv) = &step.op {
            ensure!(
                conv.channels == in_dims[0].as_slice()[0],
                "step {} expects {} channels, input has {}",
                step.name,
                conv.channels,
                in_dims[0]
            );
        }
        produced[step.output] = true;
    }

    for (b, &t) in engine.bindings.iter().zip(&engine.binding_tensors) {
        ensure!(produced[t], "output {} is never produced", b.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Dims;
    use crate::compiler::{BuildOptions, EngineCompiler};
    use crate::device::DeviceCapabilities;
    use crate::network::{Convolution, Layer, LayerOp, NetworkInput, ParsedNetwork};
    use std::path::PathBuf;

    fn bindings() -> Vec<NetworkBinding> {
        vec![
            NetworkBinding::new("data", Dims::chw(2, 3, 3), 4, Role::Input),
            NetworkBinding::new("conv", Dims::chw(2, 3, 3), 4, Role::Output),
        ]
    }

    fn build(precision: Precision) -> CompiledEngine {
        let net = ParsedNetwork {
            source: PathBuf::from("mem"),
            inputs: vec![NetworkInput {
                name: "data".into(),
                dims: Dims::chw(2, 3, 3),
            }],
            layers: vec![Layer {
                name: "conv".into(),
                inputs: vec!["data".into()],
                op: LayerOp::Convolution(Convolution {
                    filters: 2,
                    kernel: 3,
                    stride: 1,
                    pad: 1,
                    weights: (0..36).map(|i| i as f32 / 10. - 1.).collect(),
                    biases: vec![0.25, -0.5],
                }),
            }],
        };
        let options = BuildOptions {
            precision,
            ..BuildOptions::default()
        };
        EngineCompiler::new("test", DeviceCapabilities::default())
            .compile(&net, &bindings(), &options)
            .unwrap()
    }

    #[test]
    fn round_trip_every_precision() {
        let dir = tempfile::tempdir().unwrap();
        for precision in [Precision::Standard, Precision::Half, Precision::Int8] {
            let path = dir.path().join(format!("{:?}.engine", precision));
            let engine = build(precision);
            save(&path, &engine).unwrap();
            let loaded = load(&path, &bindings(), 1).unwrap();
            assert_eq!(loaded, engine);
        }
    }

    #[test]
    fn rejects_other_batch_size_and_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.cache");
        save(&path, &build(Precision::Standard)).unwrap();

        let err = load(&path, &bindings(), 2).unwrap_err();
        assert!(err.is_recoverable());

        let mut other = bindings();
        other[0].dims = Dims::chw(2, 4, 4);
        let err = load(&path, &other, 1).unwrap_err();
        assert!(matches!(err, EngineError::CacheLoad { .. }));
    }

    #[test]
    fn missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.cache");
        assert!(matches!(load(&missing, &bindings(), 1), Err(EngineError::CacheLoad { .. })));

        let corrupt = dir.path().join("corrupt.cache");
        std::fs::write(&corrupt, [0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad]).unwrap();
        assert!(matches!(load(&corrupt, &bindings(), 1), Err(EngineError::CacheLoad { .. })));
    }

    #[test]
    fn inconsistent_steps_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tampered.cache");

        let mut engine = build(Precision::Standard);
        if let KernelOp::Convolution(conv) = &mut engine.steps[0].op {
            conv.stride = 0;
        }
        save(&path, &engine).unwrap();
        let err = load(&path, &bindings(), 1).unwrap_err();
        assert!(matches!(err, EngineError::CacheLoad { .. }));
        assert!(err.to_string().contains("invalid step conv"));

        let mut engine = build(Precision::Standard);
        engine.steps[0].inputs = vec![engine.steps[0].output];
        save(&path, &engine).unwrap();
        let err = load(&path, &bindings(), 1).unwrap_err();
        assert!(err.to_string().contains("before it is produced"));

        let mut engine = build(Precision::Standard);
        engine.tensors[1].dims = Dims::chw(2, 2, 2);
        engine.bindings[1].dims = Dims::chw(2, 2, 2);
        save(&path, &engine).unwrap();
        let mut other = bindings();
        other[1].dims = Dims::chw(2, 2, 2);
        let err = load(&path, &other, 1).unwrap_err();
        assert!(err.to_string().contains("produces [2x3x3] but its tensor is [2x2x2]"));
    }

    #[test]
    fn missing_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.cache");
        let engine = build(Precision::Standard);
        let manifest = Manifest {
            version: CACHE_FORMAT_VERSION,
            max_batch_size: engine.max_batch_size,
            precision: engine.precision,
            bindings: engine.bindings.clone(),
            binding_tensors: engine.binding_tensors.clone(),
            tensors: engine.tensors.clone(),
            steps: engine.steps.clone(),
            workspace_bytes: engine.workspace_bytes,
        };
        let entries = vec![(MANIFEST_NAME.to_string(), serde_json::to_vec(&manifest).unwrap())];
        archive::write_entries(&path, &entries).unwrap();

        let err = load(&path, &bindings(), 1).unwrap_err();
        assert!(err.to_string().contains("weights of step 0 are missing"));
    }
}
