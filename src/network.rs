//! モデル形式に依存しないネットワーク表現 (解析結果) のモジュール

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::binding::Dims;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// 活性化関数の種類を表す列挙型
pub enum Activation {
    Linear,
    Leaky,
    Relu,
    Sigmoid,
}

impl Activation {
    /// 活性化関数を適用します。
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Activation::Linear => x,
            Activation::Leaky => {
                if x > 0. {
                    x
                } else {
                    0.1 * x
                }
            }
            Activation::Relu => x.max(0.),
            Activation::Sigmoid => 1. / (1. + (-x).exp()),
        }
    }
}

/// 畳み込み層のパラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct Convolution {
    pub filters: usize,
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
    /// [filters][channels][kernel][kernel]
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

/// レイヤの演算の種類
#[derive(Debug, Clone, PartialEq)]
pub enum LayerOp {
    Convolution(Convolution),
    Activation(Activation),
    MaxPool { size: usize, stride: usize },
    Upsample { stride: usize },
    /// チャネル方向の結合
    Concat,
}

/// ネットワークの1レイヤ。出力テンソルはレイヤ名で参照される
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub inputs: Vec<String>,
    pub op: LayerOp,
}

/// ネットワークの入力テンソル
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInput {
    pub name: String,
    pub dims: Dims,
}

/// モデル形式のアダプタが生成するネットワーク
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNetwork {
    /// 読み込んだモデル記述のパス
    pub source: PathBuf,
    pub inputs: Vec<NetworkInput>,
    /// トポロジカル順に並んだレイヤ
    pub layers: Vec<Layer>,
}

impl ParsedNetwork {
    /// 全テンソルの次元を推論します。
    ///
    /// # Return
    /// * テンソル名から次元へのマップ
    pub fn infer_shapes(&self) -> Result<HashMap<String, Dims>> {
        let mut shapes: HashMap<String, Dims> = HashMap::new();
        for input in &self.inputs {
            ensure!(input.dims.rank() == 3, "input {} must be CHW, got {}", input.name, input.dims);
            ensure!(input.dims.volume() > 0, "input {} has an empty dimension", input.name);
            shapes.insert(input.name.clone(), input.dims.clone());
        }

        for layer in &self.layers {
            ensure!(!shapes.contains_key(&layer.name), "duplicated tensor name: {}", layer.name);
            let in_dims = layer
                .inputs
                .iter()
                .map(|n| {
                    shapes
                        .get(n)
                        .cloned()
                        .with_context(|| format!("layer {} refers to unknown tensor {}", layer.name, n))
                })
                .collect::<Result<Vec<_>>>()?;
            let out = output_dims(layer, &in_dims)
                .with_context(|| format!("invalid layer {}", layer.name))?;
            shapes.insert(layer.name.clone(), out);
        }
        Ok(shapes)
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }
}

fn single_input(in_dims: &[Dims]) -> Result<(usize, usize, usize)> {
    ensure!(in_dims.len() == 1, "expected exactly one input, got {}", in_dims.len());
    match in_dims[0].as_slice() {
        &[c, h, w] => Ok((c, h, w)),
        _ => bail!("expected CHW input, got {}", in_dims[0]),
    }
}

/// 重みを除いた，出力次元を決めるレイヤのパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeRule {
    Convolution {
        filters: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
    },
    /// 入力と同じ次元 (活性化)
    Elementwise,
    MaxPool {
        size: usize,
        stride: usize,
    },
    Upsample {
        stride: usize,
    },
    Concat,
}

impl LayerOp {
    pub fn shape_rule(&self) -> ShapeRule {
        match self {
            LayerOp::Convolution(conv) => ShapeRule::Convolution {
                filters: conv.filters,
                kernel: conv.kernel,
                stride: conv.stride,
                pad: conv.pad,
            },
            LayerOp::Activation(_) => ShapeRule::Elementwise,
            LayerOp::MaxPool { size, stride } => ShapeRule::MaxPool {
                size: *size,
                stride: *stride,
            },
            LayerOp::Upsample { stride } => ShapeRule::Upsample { stride: *stride },
            LayerOp::Concat => ShapeRule::Concat,
        }
    }
}

/// レイヤの出力次元を計算します。畳み込みは重みとバイアスの数も検証する。
///
/// # Args
/// * `layer` - 対象のレイヤ
/// * `in_dims` - 入力テンソルの次元
///
/// # Return
/// * 出力テンソルの次元
pub fn output_dims(layer: &Layer, in_dims: &[Dims]) -> Result<Dims> {
    let out = infer_dims(layer.op.shape_rule(), in_dims)?;
    if let LayerOp::Convolution(conv) = &layer.op {
        let (c, _, _) = single_input(in_dims)?;
        let expected = conv.filters * c * conv.kernel * conv.kernel;
        ensure!(
            conv.weights.len() == expected,
            "expected {} weights, got {}",
            expected,
            conv.weights.len()
        );
        ensure!(
            conv.biases.len() == conv.filters,
            "expected {} biases, got {}",
            conv.filters,
            conv.biases.len()
        );
    }
    Ok(out)
}

/// 形状の規則と入力次元から出力次元を計算します。
///
/// # Args
/// * `rule` - レイヤの形状パラメータ
/// * `in_dims` - 入力テンソルの次元
///
/// # Return
/// * 出力テンソルの次元
pub fn infer_dims(rule: ShapeRule, in_dims: &[Dims]) -> Result<Dims> {
    match rule {
        ShapeRule::Convolution {
            filters,
            kernel,
            stride,
            pad,
        } => {
            let (_, h, w) = single_input(in_dims)?;
            ensure!(filters > 0, "at least one filter is required");
            ensure!(kernel > 0 && stride > 0, "kernel and stride must be positive");
            let (ph, pw) = pad
                .checked_mul(2)
                .and_then(|p| Some((h.checked_add(p)?, w.checked_add(p)?)))
                .with_context(|| format!("pad {} is too large", pad))?;
            ensure!(
                ph >= kernel && pw >= kernel,
                "kernel {} is larger than padded input {}x{}",
                kernel,
                h,
                w
            );
            let oh = (ph - kernel) / stride + 1;
            let ow = (pw - kernel) / stride + 1;
            Ok(Dims::chw(filters, oh, ow))
        }
        ShapeRule::Elementwise => {
            let (c, h, w) = single_input(in_dims)?;
            Ok(Dims::chw(c, h, w))
        }
        ShapeRule::MaxPool { size, stride } => {
            let (c, h, w) = single_input(in_dims)?;
            ensure!(size > 0 && stride > 0, "size and stride must be positive");
            ensure!(h > 0 && w > 0, "cannot pool an empty {}x{} input", h, w);
            // 窓からはみ出た部分は無視するので，出力は ceil(h / stride)
            Ok(Dims::chw(c, (h - 1) / stride + 1, (w - 1) / stride + 1))
        }
        ShapeRule::Upsample { stride } => {
            let (c, h, w) = single_input(in_dims)?;
            ensure!(stride > 0, "stride must be positive");
            let (oh, ow) = h
                .checked_mul(stride)
                .zip(w.checked_mul(stride))
                .with_context(|| format!("stride {} is too large", stride))?;
            Ok(Dims::chw(c, oh, ow))
        }
        ShapeRule::Concat => {
            ensure!(!in_dims.is_empty(), "concat needs at least one input");
            let mut channels: usize = 0;
            let (_, h, w) = single_input(&in_dims[..1])?;
            for d in in_dims {
                match d.as_slice() {
                    &[c, dh, dw] if dh == h && dw == w => {
                        channels = channels.checked_add(c).context("too many channels to concat")?
                    }
                    _ => bail!("cannot concat {} with {}x{} tensors", d, h, w),
                }
            }
            Ok(Dims::chw(channels, h, w))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(name: &str, input: &str, filters: usize, channels: usize, kernel: usize, pad: usize) -> Layer {
        Layer {
            name: name.into(),
            inputs: vec![input.into()],
            op: LayerOp::Convolution(Convolution {
                filters,
                kernel,
                stride: 1,
                pad,
                weights: vec![0.; filters * channels * kernel * kernel],
                biases: vec![0.; filters],
            }),
        }
    }

    fn network(layers: Vec<Layer>) -> ParsedNetwork {
        ParsedNetwork {
            source: PathBuf::from("test.json"),
            inputs: vec![NetworkInput {
                name: "data".into(),
                dims: Dims::chw(3, 13, 13),
            }],
            layers,
        }
    }

    #[test]
    fn shapes_follow_layers() {
        let net = network(vec![
            conv("c1", "data", 8, 3, 3, 1),
            Layer {
                name: "p1".into(),
                inputs: vec!["c1".into()],
                op: LayerOp::MaxPool { size: 2, stride: 2 },
            },
            Layer {
                name: "u1".into(),
                inputs: vec!["p1".into()],
                op: LayerOp::Upsample { stride: 2 },
            },
        ]);
        let shapes = net.infer_shapes().unwrap();
        assert_eq!(shapes["c1"], Dims::chw(8, 13, 13));
        assert_eq!(shapes["p1"], Dims::chw(8, 7, 7));
        assert_eq!(shapes["u1"], Dims::chw(8, 14, 14));
    }

    #[test]
    fn pool_stride_one_keeps_size() {
        let net = network(vec![Layer {
            name: "p".into(),
            inputs: vec!["data".into()],
            op: LayerOp::MaxPool { size: 2, stride: 1 },
        }]);
        assert_eq!(net.infer_shapes().unwrap()["p"], Dims::chw(3, 13, 13));
    }

    #[test]
    fn concat_requires_same_spatial_size() {
        let net = network(vec![
            Layer {
                name: "p".into(),
                inputs: vec!["data".into()],
                op: LayerOp::MaxPool { size: 2, stride: 2 },
            },
            Layer {
                name: "cat".into(),
                inputs: vec!["data".into(), "p".into()],
                op: LayerOp::Concat,
            },
        ]);
        assert!(net.infer_shapes().is_err());
    }

    #[test]
    fn unknown_tensor_is_rejected() {
        let net = network(vec![conv("c1", "nope", 1, 3, 1, 0)]);
        let err = net.infer_shapes().unwrap_err();
        assert!(err.to_string().contains("unknown tensor"));
    }

    #[test]
    fn wrong_weight_count_is_rejected() {
        let net = network(vec![conv("c1", "data", 2, 1, 3, 1)]);
        assert!(net.infer_shapes().is_err());
    }

    #[test]
    fn zero_strides_are_rejected() {
        let d = [Dims::chw(2, 4, 4)];
        assert!(infer_dims(ShapeRule::Upsample { stride: 0 }, &d).is_err());
        assert!(infer_dims(ShapeRule::MaxPool { size: 0, stride: 1 }, &d).is_err());
        let conv = ShapeRule::Convolution {
            filters: 1,
            kernel: 3,
            stride: 0,
            pad: 1,
        };
        assert!(infer_dims(conv, &d).is_err());
        assert_eq!(infer_dims(ShapeRule::Upsample { stride: 2 }, &d).unwrap(), Dims::chw(2, 8, 8));
    }

    #[test]
    fn activations() {
        assert_eq!(Activation::Leaky.apply(-1.), -0.1);
        assert_eq!(Activation::Relu.apply(-1.), 0.);
        assert_eq!(Activation::Sigmoid.apply(0.), 0.5);
        assert_eq!(Activation::Linear.apply(-3.), -3.);
    }
}
