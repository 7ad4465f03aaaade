//! モデル記述と重みファイルを解析し，`ParsedNetwork` を生成するアダプタ群
//!
//! * `GraphParser` - JSONのグラフ記述 + gzip圧縮tarの重みアーカイブ
//! * `DarknetParser` - darknetの `.cfg` + `.weights`

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::archive;
use crate::binding::Dims;
use crate::error::{EngineError, Result};
use crate::network::{output_dims, Activation, Convolution, Layer, LayerOp, NetworkInput, ParsedNetwork};

/// モデル記述の形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    #[default]
    Graph,
    Darknet,
}

impl ModelFormat {
    /// 形式に対応するアダプタを返します。
    pub fn parser(self) -> Box<dyn ModelParser> {
        match self {
            ModelFormat::Graph => Box::new(GraphParser),
            ModelFormat::Darknet => Box::new(DarknetParser),
        }
    }
}

/// モデル形式ごとのアダプタが実装する共通インタフェース
pub trait ModelParser {
    fn format(&self) -> ModelFormat;

    /// モデル記述と重みを読み込みます。
    ///
    /// # Args
    /// * `model` - トポロジを記述したファイル
    /// * `weights` - パラメータを格納したファイル
    ///
    /// # Return
    /// * 解析済みのネットワーク (失敗時は `EngineError::ModelParse`)
    fn parse(&self, model: &Path, weights: &Path) -> Result<ParsedNetwork>;
}

/// 完成したネットワークの形状を確認し，エラーをモデル記述のパスに結び付けます。
fn checked(network: ParsedNetwork) -> Result<ParsedNetwork> {
    match network.infer_shapes() {
        Ok(_) => Ok(network),
        Err(e) => Err(EngineError::model_parse(&network.source, e)),
    }
}

// ---------------------------------------------------------------------------
// JSON グラフ形式

/// 重みアーカイブ内の数値表現
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum WeightEncoding {
    /// リトルエンディアンのf32
    #[default]
    #[serde(rename = "f32")]
    F32,
    /// 符号ありの8.8固定小数点数 (リトルエンディアンのi16)
    #[serde(rename = "fixed8_8")]
    Fixed8_8,
}

#[derive(Debug, Deserialize)]
struct GraphFile {
    #[serde(default)]
    name: String,
    inputs: Vec<GraphInput>,
    #[serde(default)]
    weight_encoding: WeightEncoding,
    layers: Vec<GraphLayer>,
}

#[derive(Debug, Deserialize)]
struct GraphInput {
    name: String,
    dims: Dims,
}

#[derive(Debug, Deserialize)]
struct GraphLayer {
    name: String,
    #[serde(flatten)]
    kind: GraphLayerKind,
}

fn one() -> usize {
    1
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GraphLayerKind {
    Convolution {
        input: String,
        filters: usize,
        kernel: usize,
        #[serde(default = "one")]
        stride: usize,
        #[serde(default)]
        pad: usize,
    },
    Activation {
        input: String,
        function: Activation,
    },
    MaxPool {
        input: String,
        size: usize,
        stride: usize,
    },
    Upsample {
        input: String,
        stride: usize,
    },
    Concat {
        inputs: Vec<String>,
    },
}

/// JSONのグラフ記述と重みアーカイブを読み込むアダプタ
///
/// 畳み込み層 `<name>` の重みはアーカイブ内の `weights.<name>`，
/// バイアスは `biases.<name>` から読み込まれる。
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphParser;

impl GraphParser {
    fn read_graph(path: &Path) -> anyhow::Result<GraphFile> {
        let text = fs::read_to_string(path).with_context(|| format!("cannot read {:?}", path))?;
        serde_json::from_str(&text).context("invalid graph description")
    }

    /// 重みアーカイブを (種類, レイヤ名) → 値 のマップとして読み込みます。
    fn read_weights(path: &Path, encoding: WeightEncoding) -> anyhow::Result<HashMap<(String, String), Vec<f32>>> {
        let mut params = HashMap::new();
        for (name, data) in archive::read_entries(path)? {
            let (kind, layer) = match name.split_once('.') {
                Some((kind @ ("weights" | "biases"), layer)) if !layer.is_empty() => (kind, layer),
                _ => {
                    warn!("ignoring unexpected entry {} in {:?}", name, path);
                    continue;
                }
            };
            let values = match encoding {
                WeightEncoding::F32 => archive::decode_f32_le(&data),
                WeightEncoding::Fixed8_8 => archive::decode_fixed8_8(&data),
            }
            .with_context(|| format!("entry {} is malformed", name))?;
            params.insert((kind.to_string(), layer.to_string()), values);
        }
        Ok(params)
    }

    fn build(graph: GraphFile, mut params: HashMap<(String, String), Vec<f32>>, source: &Path) -> anyhow::Result<ParsedNetwork> {
        let inputs = graph
            .inputs
            .into_iter()
            .map(|i| NetworkInput { name: i.name, dims: i.dims })
            .collect();

        let mut layers = Vec::with_capacity(graph.layers.len());
        for layer in graph.layers {
            let (inputs, op) = match layer.kind {
                GraphLayerKind::Convolution {
                    input,
                    filters,
                    kernel,
                    stride,
                    pad,
                } => {
                    let mut take = |kind: &str| {
                        params
                            .remove(&(kind.to_string(), layer.name.clone()))
                            .with_context(|| format!("{}.{} is missing in the weights archive", kind, layer.name))
                    };
                    let weights = take("weights")?;
                    let biases = take("biases")?;
                    let conv = Convolution {
                        filters,
                        kernel,
                        stride,
                        pad,
                        weights,
                        biases,
                    };
                    (vec![input], LayerOp::Convolution(conv))
                }
                GraphLayerKind::Activation { input, function } => (vec![input], LayerOp::Activation(function)),
                GraphLayerKind::MaxPool { input, size, stride } => (vec![input], LayerOp::MaxPool { size, stride }),
                GraphLayerKind::Upsample { input, stride } => (vec![input], LayerOp::Upsample { stride }),
                GraphLayerKind::Concat { inputs } => (inputs, LayerOp::Concat),
            };
            layers.push(Layer {
                name: layer.name,
                inputs,
                op,
            });
        }

        for (kind, layer) in params.keys() {
            warn!("{}.{} does not belong to any convolution layer, ignored", kind, layer);
        }
        debug!("parsed graph {:?} with {} layers", graph.name, layers.len());

        Ok(ParsedNetwork {
            source: source.to_path_buf(),
            inputs,
            layers,
        })
    }
}

impl ModelParser for GraphParser {
    fn format(&self) -> ModelFormat {
        ModelFormat::Graph
    }

    fn parse(&self, model: &Path, weights: &Path) -> Result<ParsedNetwork> {
        let graph = Self::read_graph(model).map_err(|e| EngineError::model_parse(model, e))?;
        let params = Self::read_weights(weights, graph.weight_encoding).map_err(|e| EngineError::model_parse(weights, e))?;
        let network = Self::build(graph, params, model).map_err(|e| EngineError::model_parse(model, e))?;
        checked(network)
    }
}

// ---------------------------------------------------------------------------
// darknet 形式

/// バッチ正規化の畳み込みへの畳み込み時に分散に足す値
const BATCH_NORM_EPSILON: f32 = 0.00001;

/// darknetのcfgのセクション
#[derive(Debug)]
struct Section {
    kind: String,
    line: usize,
    options: HashMap<String, String>,
}

impl Section {
    fn get<T: std::str::FromStr>(&self, key: &str, default: T) -> anyhow::Result<T> {
        match self.options.get(key) {
            Some(v) => v
                .parse()
                .ok()
                .with_context(|| format!("[{}] at line {}: invalid {}={}", self.kind, self.line, key, v)),
            None => Ok(default),
        }
    }

    fn require<T: std::str::FromStr>(&self, key: &str) -> anyhow::Result<T> {
        let v = self
            .options
            .get(key)
            .with_context(|| format!("[{}] at line {}: {} is required", self.kind, self.line, key))?;
        v.parse()
            .ok()
            .with_context(|| format!("[{}] at line {}: invalid {}={}", self.kind, self.line, key, v))
    }
}

fn parse_cfg(text: &str) -> anyhow::Result<Vec<Section>> {
    let mut sections: Vec<Section> = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(kind) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push(Section {
                kind: kind.trim().to_string(),
                line: i + 1,
                options: HashMap::new(),
            });
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected key=value, got {:?}", i + 1, line))?;
        let section = sections
            .last_mut()
            .with_context(|| format!("line {}: option outside of a section", i + 1))?;
        section.options.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(sections)
}

fn darknet_activation(name: &str) -> anyhow::Result<Activation> {
    Ok(match name {
        "linear" => Activation::Linear,
        "leaky" => Activation::Leaky,
        "relu" => Activation::Relu,
        "logistic" => Activation::Sigmoid,
        other => bail!("unsupported activation {}", other),
    })
}

/// darknetの重みファイルを先頭から順に読み出すリーダ
struct WeightReader {
    data: Vec<u8>,
    pos: usize,
}

impl WeightReader {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read(path).with_context(|| format!("cannot read {:?}", path))?;
        let mut reader = Self { data, pos: 0 };

        let header = reader.take(12).context("weights header is truncated")?;
        let version: Vec<i32> = header
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let (major, minor) = (version[0], version[1]);
        // seen はバージョン0.2以降で64bit
        let seen_len = if major * 10 + minor >= 2 && major < 1000 && minor < 1000 { 8 } else { 4 };
        reader.take(seen_len).context("weights header is truncated")?;
        debug!("darknet weights version {}.{}.{}", major, minor, version[2]);
        Ok(reader)
    }

    fn take(&mut self, n: usize) -> anyhow::Result<&[u8]> {
        ensure!(
            self.pos + n <= self.data.len(),
            "weights file ends at byte {}, {} more bytes needed at {}",
            self.data.len(),
            n,
            self.pos
        );
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn floats(&mut self, n: usize) -> anyhow::Result<Vec<f32>> {
        let bytes = self.take(n * 4)?;
        archive::decode_f32_le(bytes)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// darknetの `.cfg` と `.weights` を読み込むアダプタ
///
/// `[net]`, `[convolutional]`, `[maxpool]`, `[upsample]`, `[route]` に対応する。
/// 各レイヤの出力テンソル名はレイヤ番号 (`"0"`, `"1"`, ...) で，入力テンソルは `data`。
/// バッチ正規化は読み込み時に畳み込みの重みとバイアスに畳み込まれる。
#[derive(Debug, Clone, Copy, Default)]
pub struct DarknetParser;

/// 入力テンソルの名前
pub const DARKNET_INPUT_NAME: &str = "data";

impl DarknetParser {
    fn build(cfg: &str, weights: &mut WeightReader, source: &Path) -> anyhow::Result<ParsedNetwork> {
        let sections = parse_cfg(cfg)?;
        let (net, body) = sections.split_first().context("cfg has no sections")?;
        ensure!(
            net.kind == "net" || net.kind == "network",
            "first section must be [net], got [{}]",
            net.kind
        );
        let input = NetworkInput {
            name: DARKNET_INPUT_NAME.to_string(),
            dims: Dims::chw(net.require("channels")?, net.require("height")?, net.require("width")?),
        };

        let mut layers: Vec<Layer> = Vec::new();
        let mut shapes: HashMap<String, Dims> = HashMap::new();
        shapes.insert(input.name.clone(), input.dims.clone());
        // darknetレイヤ番号ごとの出力テンソル名
        let mut outputs: Vec<String> = Vec::with_capacity(body.len());

        for (index, section) in body.iter().enumerate() {
            let name = index.to_string();
            let prev = outputs.last().unwrap_or(&input.name).clone();
            let channels = shapes[&prev].as_slice()[0];

            let new_layers = match section.kind.as_str() {
                "convolutional" | "conv" => {
                    let activation = darknet_activation(&section.get("activation", "logistic".to_string())?)?;
                    let conv = Self::convolution(section, channels, weights)?;
                    if activation == Activation::Linear {
                        vec![Layer {
                            name: name.clone(),
                            inputs: vec![prev],
                            op: LayerOp::Convolution(conv),
                        }]
                    } else {
                        let conv_name = format!("{}_conv", name);
                        vec![
                            Layer {
                                name: conv_name.clone(),
                                inputs: vec![prev],
                                op: LayerOp::Convolution(conv),
                            },
                            Layer {
                                name: name.clone(),
                                inputs: vec![conv_name],
                                op: LayerOp::Activation(activation),
                            },
                        ]
                    }
                }
                "maxpool" | "max" => {
                    let stride = section.get("stride", 1)?;
                    let size = section.get("size", stride)?;
                    vec![Layer {
                        name: name.clone(),
                        inputs: vec![prev],
                        op: LayerOp::MaxPool { size, stride },
                    }]
                }
                "upsample" => vec![Layer {
                    name: name.clone(),
                    inputs: vec![prev],
                    op: LayerOp::Upsample {
                        stride: section.get("stride", 2)?,
                    },
                }],
                "route" => {
                    let refs: String = section.require("layers")?;
                    let inputs = refs
                        .split(',')
                        .map(|r| -> anyhow::Result<String> {
                            let r: i64 = r.trim().parse().with_context(|| format!("invalid route {:?}", r))?;
                            let target = if r < 0 { index as i64 + r } else { r };
                            ensure!(
                                (0..index as i64).contains(&target),
                                "route of layer {} points to layer {}",
                                index,
                                target
                            );
                            Ok(outputs[target as usize].clone())
                        })
                        .collect::<anyhow::Result<Vec<_>>>()?;
                    vec![Layer {
                        name: name.clone(),
                        inputs,
                        op: LayerOp::Concat,
                    }]
                }
                other => bail!("unsupported section [{}] at line {}", other, section.line),
            };

            // 次のレイヤの入力チャネル数を知るため，ここで次元を求めておく
            for layer in new_layers {
                let in_dims: Vec<Dims> = layer.inputs.iter().map(|n| shapes[n].clone()).collect();
                let dims = output_dims(&layer, &in_dims)
                    .with_context(|| format!("invalid layer {} (line {})", index, section.line))?;
                shapes.insert(layer.name.clone(), dims);
                layers.push(layer);
            }
            outputs.push(name);
        }

        if weights.remaining() > 0 {
            warn!("{} bytes left unread in the weights file", weights.remaining());
        }

        Ok(ParsedNetwork {
            source: source.to_path_buf(),
            inputs: vec![input],
            layers,
        })
    }

    fn convolution(section: &Section, channels: usize, weights: &mut WeightReader) -> anyhow::Result<Convolution> {
        let filters: usize = section.get("filters", 1)?;
        let kernel: usize = section.get("size", 1)?;
        let stride: usize = section.get("stride", 1)?;
        let pad = if section.get("pad", 0)? != 0 {
            kernel / 2
        } else {
            section.get("padding", 0)?
        };
        let batch_normalize = section.get("batch_normalize", 0)? != 0;

        let mut biases = weights.floats(filters)?;
        let norm = if batch_normalize {
            let scales = weights.floats(filters)?;
            let mean = weights.floats(filters)?;
            let variance = weights.floats(filters)?;
            Some((scales, mean, variance))
        } else {
            None
        };
        let mut w = weights.floats(filters * channels * kernel * kernel)?;

        if let Some((scales, mean, variance)) = norm {
            let per_filter = channels * kernel * kernel;
            for f in 0..filters {
                let k = scales[f] / (variance[f] + BATCH_NORM_EPSILON).sqrt();
                for v in &mut w[f * per_filter..(f + 1) * per_filter] {
                    *v *= k;
                }
                biases[f] -= mean[f] * k;
            }
        }

        Ok(Convolution {
            filters,
            kernel,
            stride,
            pad,
            weights: w,
            biases,
        })
    }
}

impl ModelParser for DarknetParser {
    fn format(&self) -> ModelFormat {
        ModelFormat::Darknet
    }

    fn parse(&self, model: &Path, weights: &Path) -> Result<ParsedNetwork> {
        let cfg = fs::read_to_string(model)
            .with_context(|| format!("cannot read {:?}", model))
            .map_err(|e| EngineError::model_parse(model, e))?;
        let mut reader = WeightReader::open(weights).map_err(|e| EngineError::model_parse(weights, e))?;
        let network = Self::build(&cfg, &mut reader, model).map_err(|e| EngineError::model_parse(model, e))?;
        checked(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::f32s_to_bytes;
    use std::path::PathBuf;

    fn write_graph(dir: &Path, json: &str, entries: &[(&str, Vec<u8>)]) -> (PathBuf, PathBuf) {
        let model = dir.join("net.json");
        let weights = dir.join("net.tar.gz");
        fs::write(&model, json).unwrap();
        let entries: Vec<(String, Vec<u8>)> = entries.iter().map(|(n, d)| (n.to_string(), d.clone())).collect();
        archive::write_entries(&weights, &entries).unwrap();
        (model, weights)
    }

    const GRAPH: &str = r#"{
        "name": "tiny",
        "inputs": [{ "name": "data", "dims": [1, 2, 2] }],
        "weight_encoding": "fixed8_8",
        "layers": [
            { "name": "conv", "type": "convolution", "input": "data", "filters": 2, "kernel": 1 },
            { "name": "act", "type": "activation", "input": "conv", "function": "leaky" },
            { "name": "pool", "type": "max_pool", "input": "act", "size": 2, "stride": 2 },
            { "name": "up", "type": "upsample", "input": "pool", "stride": 2 },
            { "name": "cat", "type": "concat", "inputs": ["up", "act"] }
        ]
    }"#;

    fn fixed(values: &[i16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn graph_with_fixed_point_weights() {
        let dir = tempfile::tempdir().unwrap();
        let (model, weights) = write_graph(
            dir.path(),
            GRAPH,
            &[
                ("weights.conv", fixed(&[256, -128])),
                ("biases.conv", fixed(&[64, 0])),
                ("README", b"ignored".to_vec()),
            ],
        );

        let net = ModelFormat::Graph.parser().parse(&model, &weights).unwrap();
        assert_eq!(net.source, model);
        assert_eq!(net.layers.len(), 5);
        match &net.layer("conv").unwrap().op {
            LayerOp::Convolution(c) => {
                assert_eq!(c.weights, vec![1.0, -0.5]);
                assert_eq!(c.biases, vec![0.25, 0.0]);
                assert_eq!((c.stride, c.pad), (1, 0));
            }
            other => panic!("unexpected {:?}", other),
        }
        let shapes = net.infer_shapes().unwrap();
        assert_eq!(shapes["cat"], Dims::chw(4, 2, 2));
    }

    #[test]
    fn missing_weights_are_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let (model, weights) = write_graph(dir.path(), GRAPH, &[("weights.conv", fixed(&[256, 256]))]);
        let err = GraphParser.parse(&model, &weights).unwrap_err();
        match err {
            EngineError::ModelParse { path, source } => {
                assert_eq!(path, model);
                assert!(format!("{:#}", source).contains("biases.conv"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wrong_weight_count_and_unknown_layer() {
        let dir = tempfile::tempdir().unwrap();
        let (model, weights) = write_graph(
            dir.path(),
            GRAPH,
            &[("weights.conv", fixed(&[256])), ("biases.conv", fixed(&[0, 0]))],
        );
        assert!(matches!(GraphParser.parse(&model, &weights), Err(EngineError::ModelParse { .. })));

        let json = r#"{ "inputs": [{ "name": "data", "dims": [1, 2, 2] }],
            "layers": [{ "name": "x", "type": "softmax", "input": "data" }] }"#;
        let (model, weights) = write_graph(dir.path(), json, &[]);
        assert!(matches!(GraphParser.parse(&model, &weights), Err(EngineError::ModelParse { .. })));
    }

    #[test]
    fn unreadable_weights_point_at_the_weights_file() {
        let dir = tempfile::tempdir().unwrap();
        let (model, _) = write_graph(dir.path(), GRAPH, &[]);
        let missing = dir.path().join("missing.tar.gz");
        match GraphParser.parse(&model, &missing) {
            Err(EngineError::ModelParse { path, .. }) => assert_eq!(path, missing),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn darknet_weights(dir: &Path, values: &[f32]) -> PathBuf {
        let path = dir.join("net.weights");
        let mut data: Vec<u8> = [0i32, 2, 0].iter().flat_map(|v| v.to_le_bytes()).collect();
        data.extend(0u64.to_le_bytes());
        data.extend(f32s_to_bytes(values));
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn darknet_batch_norm_is_folded() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("net.cfg");
        fs::write(
            &cfg,
            "[net]\n# comment\nwidth=2\nheight=2\nchannels=1\n\n\
             [convolutional]\nbatch_normalize=1\nfilters=1\nsize=1\nstride=1\npad=1\nactivation=linear\n\n\
             [maxpool]\nsize=2\nstride=2\n",
        )
        .unwrap();
        // bias, scale, mean, variance, weight
        let weights = darknet_weights(dir.path(), &[0.5, 2.0, 1.0, 4.0, 3.0]);

        let net = DarknetParser.parse(&cfg, &weights).unwrap();
        assert_eq!(net.inputs[0].name, DARKNET_INPUT_NAME);
        let names: Vec<_> = net.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["0", "1"]);
        match &net.layers[0].op {
            LayerOp::Convolution(c) => {
                // k = 2 / sqrt(4 + eps)
                assert!((c.weights[0] - 3.0).abs() < 1e-4);
                assert!((c.biases[0] + 0.5).abs() < 1e-4);
                assert_eq!(c.pad, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(net.infer_shapes().unwrap()["1"], Dims::chw(1, 1, 1));
    }

    #[test]
    fn darknet_route_and_activation() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("net.cfg");
        fs::write(
            &cfg,
            "[net]\nwidth=2\nheight=2\nchannels=1\n\
             [convolutional]\nfilters=2\nsize=1\nactivation=leaky\n\
             [maxpool]\nsize=2\nstride=1\n\
             [route]\nlayers=-1, 0\n",
        )
        .unwrap();
        let weights = darknet_weights(dir.path(), &[0., 0., 1., -1.]);

        let net = DarknetParser.parse(&cfg, &weights).unwrap();
        let names: Vec<_> = net.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, ["0_conv", "0", "1", "2"]);
        assert_eq!(net.layer("2").unwrap().inputs, vec!["1".to_string(), "0".to_string()]);
        assert_eq!(net.infer_shapes().unwrap()["2"], Dims::chw(4, 2, 2));
    }

    #[test]
    fn darknet_truncated_weights_and_bad_sections() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("net.cfg");
        fs::write(&cfg, "[net]\nwidth=2\nheight=2\nchannels=1\n[convolutional]\nfilters=2\nsize=1\n").unwrap();
        let weights = darknet_weights(dir.path(), &[0., 0., 1.]);
        assert!(matches!(DarknetParser.parse(&cfg, &weights), Err(EngineError::ModelParse { .. })));

        fs::write(&cfg, "[net]\nwidth=2\nheight=2\nchannels=1\n[yolo]\nclasses=1\n").unwrap();
        assert!(matches!(DarknetParser.parse(&cfg, &weights), Err(EngineError::ModelParse { .. })));

        fs::write(&cfg, "width=2\n").unwrap();
        assert!(matches!(DarknetParser.parse(&cfg, &weights), Err(EngineError::ModelParse { .. })));
    }
}
