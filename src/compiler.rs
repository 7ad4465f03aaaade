//! 解析済みネットワークから推論エンジンをビルドするモジュール

use std::collections::{HashMap, HashSet};

use half::f16;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::binding::{Dims, NetworkBinding, Role};
use crate::device::DeviceCapabilities;
use crate::error::{EngineError, Result};
use crate::network::{Activation, LayerOp, ParsedNetwork, ShapeRule};

/// 実行バインディングの1要素あたりのバイト数 (f32のみ対応)
pub const EXECUTABLE_ELEMENT_SIZE: usize = 4;

/// 数値精度モード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// f32
    #[default]
    Standard,
    /// 重みをf16で保持
    Half,
    /// 重みをフィルタ毎の対称int8で保持
    Int8,
}

/// ビルド時の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub max_batch_size: usize,
    pub precision: Precision,
    /// 中間テンソルに使ってよい最大のバイト数
    pub max_workspace_bytes: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 1,
            precision: Precision::Standard,
            max_workspace_bytes: 1 << 30,
        }
    }
}

/// 精度モードを適用した畳み込みの重み
#[derive(Debug, Clone, PartialEq)]
pub enum ConvWeights {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Int8 { values: Vec<i8>, scales: Vec<f32> },
}

impl Default for ConvWeights {
    fn default() -> Self {
        ConvWeights::F32(Vec::new())
    }
}

impl ConvWeights {
    /// 精度モードに従って重みを変換します。
    ///
    /// # Args
    /// * `weights` - f32の重み ([filters][channels][k][k])
    /// * `filters` - フィルタ数
    /// * `precision` - 精度モード
    pub fn quantize(weights: &[f32], filters: usize, precision: Precision) -> Self {
        match precision {
            Precision::Standard => ConvWeights::F32(weights.to_vec()),
            Precision::Half => ConvWeights::F16(weights.iter().map(|&w| f16::from_f32(w)).collect()),
            Precision::Int8 => {
                let per_filter = weights.len() / filters.max(1);
                let mut values = Vec::with_capacity(weights.len());
                let mut scales = Vec::with_capacity(filters);
                for chunk in weights.chunks(per_filter.max(1)) {
                    let max_abs = chunk.iter().fold(0f32, |m, w| m.max(w.abs()));
                    let scale = if max_abs > 0. { max_abs / 127. } else { 1. };
                    scales.push(scale);
                    values.extend(chunk.iter().map(|w| (w / scale).round().clamp(-127., 127.) as i8));
                }
                ConvWeights::Int8 { values, scales }
            }
        }
    }

    /// 演算用にf32へ戻します。
    pub fn dequantize(&self) -> Vec<f32> {
        match self {
            ConvWeights::F32(w) => w.clone(),
            ConvWeights::F16(w) => w.iter().map(|w| w.to_f32()).collect(),
            ConvWeights::Int8 { values, scales } => {
                let per_filter = values.len() / scales.len().max(1);
                values
                    .iter()
                    .enumerate()
                    .map(|(i, &q)| q as f32 * scales[i / per_filter.max(1)])
                    .collect()
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ConvWeights::F32(w) => w.len(),
            ConvWeights::F16(w) => w.len(),
            ConvWeights::Int8 { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// ビルド済みの畳み込み
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvKernel {
    pub channels: usize,
    pub filters: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
    /// キャッシュではマニフェストとは別のエントリに保存される
    #[serde(skip)]
    pub weights: ConvWeights,
    #[serde(skip)]
    pub biases: Vec<f32>,
}

/// 実行ステップの演算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelOp {
    Convolution(ConvKernel),
    Activation { function: Activation },
    MaxPool { size: usize, stride: usize },
    Upsample { stride: usize },
    Concat,
}

impl KernelOp {
    /// 出力次元の計算に使う形状パラメータ
    pub fn shape_rule(&self) -> ShapeRule {
        match self {
            KernelOp::Convolution(conv) => ShapeRule::Convolution {
                filters: conv.filters,
                kernel: conv.kernel,
                stride: conv.stride,
                pad: conv.pad,
            },
            KernelOp::Activation { .. } => ShapeRule::Elementwise,
            KernelOp::MaxPool { size, stride } => ShapeRule::MaxPool {
                size: *size,
                stride: *stride,
            },
            KernelOp::Upsample { stride } => ShapeRule::Upsample { stride: *stride },
            KernelOp::Concat => ShapeRule::Concat,
        }
    }
}

/// エンジン内のテンソル
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Dims,
}

/// 実行計画の1ステップ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub op: KernelOp,
    /// 入力テンソルのインデックス
    pub inputs: Vec<usize>,
    /// 出力テンソルのインデックス
    pub output: usize,
}

/// 最大バッチサイズとバインディングに固定された推論エンジン
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledEngine {
    pub(crate) max_batch_size: usize,
    pub(crate) precision: Precision,
    /// 入力 (登録順) → 出力 (登録順)
    pub(crate) bindings: Vec<NetworkBinding>,
    /// `bindings` と同じ順序のテンソルインデックス
    pub(crate) binding_tensors: Vec<usize>,
    pub(crate) tensors: Vec<TensorInfo>,
    pub(crate) steps: Vec<Step>,
    pub(crate) workspace_bytes: usize,
}

impl CompiledEngine {
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn bindings(&self) -> &[NetworkBinding] {
        &self.bindings
    }

    pub fn num_bindings(&self) -> usize {
        self.bindings.len()
    }

    pub fn workspace_bytes(&self) -> usize {
        self.workspace_bytes
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    /// 指定した役割のバインディングを (バインディング番号, バインディング) で列挙します。
    pub fn bindings_of(&self, role: Role) -> impl Iterator<Item = (usize, &NetworkBinding)> {
        self.bindings.iter().enumerate().filter(move |(_, b)| b.role == role)
    }

    /// 役割ごとのデバイスバッファ内での各バインディングの先頭オフセットを返します。
    ///
    /// バインディング `j` のサンプル `b` は `offset_j + b * sample_bytes_j` から始まる。
    ///
    /// # Return
    /// * (バインディング番号, オフセット) のベクタ
    pub fn binding_offsets(&self, role: Role) -> Vec<(usize, usize)> {
        let mut offset = 0;
        self.bindings_of(role)
            .map(|(i, b)| {
                let o = offset;
                offset += b.sample_bytes() * self.max_batch_size;
                (i, o)
            })
            .collect()
    }

    /// 役割ごとに必要なデバイスバッファのバイト数
    pub fn buffer_bytes(&self, role: Role) -> usize {
        self.bindings_of(role)
            .map(|(_, b)| b.sample_bytes() * self.max_batch_size)
            .sum()
    }

    /// エンジンの概要を人間が読める形式で返します。
    pub fn summary(&self) -> String {
        let mut s = format!(
            "engine: max batch {}, precision {:?}, {} steps, workspace {} bytes\n",
            self.max_batch_size,
            self.precision,
            self.steps.len(),
            self.workspace_bytes
        );
        for (i, b) in self.bindings.iter().enumerate() {
            s.push_str(&format!(
                "  binding {}: {:?} {} [{}] x{} bytes\n",
                i, b.role, b.name, b.dims, b.element_size
            ));
        }
        s
    }

    /// 登録済みバインディング・バッチサイズと一致するかを検証します。
    ///
    /// # Return
    /// * 一致しない場合はその理由
    pub fn check_compatible(&self, bindings: &[NetworkBinding], max_batch_size: usize) -> std::result::Result<(), String> {
        if self.max_batch_size != max_batch_size {
            return Err(format!(
                "engine was built for batch size {}, requested {}",
                self.max_batch_size, max_batch_size
            ));
        }
        if self.bindings.len() != bindings.len() {
            return Err(format!(
                "engine has {} bindings, {} registered",
                self.bindings.len(),
                bindings.len()
            ));
        }
        for (built, registered) in self.bindings.iter().zip(bindings) {
            if built != registered {
                return Err(format!(
                    "binding {} [{}] does not match registered {} [{}]",
                    built.name, built.dims, registered.name, registered.dims
                ));
            }
        }
        Ok(())
    }
}

/// 解析済みネットワークとバインディングから `CompiledEngine` を作成するビルダ
pub struct EngineCompiler<'a> {
    caps: DeviceCapabilities,
    device_name: &'a str,
}

impl<'a> EngineCompiler<'a> {
    pub fn new(device_name: &'a str, caps: DeviceCapabilities) -> Self {
        Self { caps, device_name }
    }

    /// 推論エンジンをビルドします。
    ///
    /// # Args
    /// * `network` - モデル形式のアダプタが生成したネットワーク
    /// * `bindings` - 登録済みバインディング (入力 → 出力の順)
    /// * `options` - バッチサイズ・精度・ワークスペース上限
    ///
    /// # Return
    /// * ビルド済みのエンジン
    pub fn compile(
        &self,
        network: &ParsedNetwork,
        bindings: &[NetworkBinding],
        options: &BuildOptions,
    ) -> Result<CompiledEngine> {
        let n_inputs = bindings.iter().filter(|b| b.role == Role::Input).count();
        if n_inputs == 0 || n_inputs == bindings.len() {
            return Err(EngineError::InvalidState(
                "at least one input and one output must be registered before building".into(),
            ));
        }
        if options.max_batch_size == 0 {
            return Err(EngineError::InvalidInput("max batch size must be at least 1".into()));
        }
        if !self.caps.supports(options.precision) {
            return Err(EngineError::UnsupportedPrecision {
                precision: options.precision,
                device: self.device_name.to_string(),
            });
        }

        let shapes = network
            .infer_shapes()
            .map_err(|e| EngineError::model_parse(&network.source, e))?;

        self.verify_bindings(network, &shapes, bindings)?;

        // 出力から辿れないレイヤは計画に含めない
        let live = live_layers(network, bindings);

        let mut tensors: Vec<TensorInfo> = network
            .inputs
            .iter()
            .map(|i| TensorInfo {
                name: i.name.clone(),
                dims: i.dims.clone(),
            })
            .collect();
        let mut index: HashMap<String, usize> =
            tensors.iter().enumerate().map(|(i, t)| (t.name.clone(), i)).collect();

        let mut steps = Vec::new();
        for layer in network.layers.iter().filter(|l| live.contains(l.name.as_str())) {
            let inputs: Vec<usize> = layer.inputs.iter().map(|n| index[n]).collect();
            let output = tensors.len();
            tensors.push(TensorInfo {
                name: layer.name.clone(),
                dims: shapes[&layer.name].clone(),
            });
            index.insert(layer.name.clone(), output);

            let op = match &layer.op {
                LayerOp::Convolution(conv) => KernelOp::Convolution(ConvKernel {
                    channels: tensors[inputs[0]].dims.as_slice()[0],
                    filters: conv.filters,
                    kernel: conv.kernel,
                    stride: conv.stride,
                    pad: conv.pad,
                    weights: ConvWeights::quantize(&conv.weights, conv.filters, options.precision),
                    biases: conv.biases.clone(),
                }),
                LayerOp::Activation(a) => KernelOp::Activation { function: *a },
                LayerOp::MaxPool { size, stride } => KernelOp::MaxPool {
                    size: *size,
                    stride: *stride,
                },
                LayerOp::Upsample { stride } => KernelOp::Upsample { stride: *stride },
                LayerOp::Concat => KernelOp::Concat,
            };
            steps.push(Step {
                name: layer.name.clone(),
                op,
                inputs,
                output,
            });
        }

        let binding_tensors: Vec<usize> = bindings.iter().map(|b| index[&b.name]).collect();
        let bound: HashSet<usize> = binding_tensors.iter().copied().collect();
        let workspace_bytes = tensors
            .iter()
            .enumerate()
            .filter(|(i, _)| !bound.contains(i))
            .map(|(_, t)| t.dims.volume() * EXECUTABLE_ELEMENT_SIZE * options.max_batch_size)
            .sum();
        if workspace_bytes > options.max_workspace_bytes {
            return Err(EngineError::WorkspaceExceeded {
                required: workspace_bytes,
                limit: options.max_workspace_bytes,
            });
        }

        debug!(
            "pruned {} of {} layers",
            network.layers.len() - steps.len(),
            network.layers.len()
        );

        let engine = CompiledEngine {
            max_batch_size: options.max_batch_size,
            precision: options.precision,
            bindings: bindings.to_vec(),
            binding_tensors,
            tensors,
            steps,
            workspace_bytes,
        };
        info!(
            "built engine from {:?} on {}: {} steps, batch {}, {:?}",
            network.source,
            self.device_name,
            engine.steps.len(),
            engine.max_batch_size,
            engine.precision
        );
        Ok(engine)
    }

    fn verify_bindings(
        &self,
        network: &ParsedNetwork,
        shapes: &HashMap<String, Dims>,
        bindings: &[NetworkBinding],
    ) -> Result<()> {
        for b in bindings {
            if b.element_size != EXECUTABLE_ELEMENT_SIZE {
                return Err(EngineError::ModelMismatch(format!(
                    "binding {} uses {} byte elements, only {} byte (f32) elements are supported",
                    b.name, b.element_size, EXECUTABLE_ELEMENT_SIZE
                )));
            }
        }

        for input in &network.inputs {
            if !bindings.iter().any(|b| b.role == Role::Input && b.name == input.name) {
                return Err(EngineError::ModelMismatch(format!(
                    "model input {} is not registered",
                    input.name
                )));
            }
        }

        for b in bindings {
            let parsed = match b.role {
                Role::Input => network
                    .inputs
                    .iter()
                    .find(|i| i.name == b.name)
                    .map(|i| &i.dims),
                Role::Output => shapes.get(&b.name),
            };
            let parsed = parsed.ok_or_else(|| {
                EngineError::ModelMismatch(format!("{:?} binding {} not found in model", b.role, b.name))
            })?;

            if parsed.rank() != b.dims.rank() {
                return Err(EngineError::ModelMismatch(format!(
                    "{} has {} dimensions in the model, {} registered",
                    b.name,
                    parsed.rank(),
                    b.dims.rank()
                )));
            }
            if *parsed != b.dims {
                return Err(EngineError::ModelMismatch(format!(
                    "{} is [{}] in the model, [{}] registered",
                    b.name, parsed, b.dims
                )));
            }
        }
        Ok(())
    }
}

/// 出力バインディングから逆向きに辿れるレイヤ名の集合を返します。
fn live_layers<'n>(network: &'n ParsedNetwork, bindings: &[NetworkBinding]) -> HashSet<&'n str> {
    let producers: HashMap<&str, &crate::network::Layer> =
        network.layers.iter().map(|l| (l.name.as_str(), l)).collect();
    let mut live = HashSet::new();
    let mut stack: Vec<&str> = bindings
        .iter()
        .filter(|b| b.role == Role::Output)
        .filter_map(|b| producers.get(b.name.as_str()).map(|l| l.name.as_str()))
        .collect();

    while let Some(name) = stack.pop() {
        if !live.insert(name) {
            continue;
        }
        if let Some(layer) = producers.get(name) {
            stack.extend(
                layer
                    .inputs
                    .iter()
                    .filter_map(|i| producers.get(i.as_str()).map(|l| l.name.as_str())),
            );
        }
    }
    live
}
