//! 結合テスト用のモデル・重みファイルを生成するヘルパ

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use detectnet_rt::archive;
use detectnet_rt::tensor::f32s_to_bytes;
use detectnet_rt::{DetectorConfig, ModelFormat, Precision};

/// グラフ記述と重みアーカイブを書き出します。
pub fn write_graph(dir: &Path, name: &str, json: &str, params: &[(&str, &[f32])]) -> (PathBuf, PathBuf) {
    let model = dir.join(format!("{}.json", name));
    let weights = dir.join(format!("{}.tar.gz", name));
    fs::write(&model, json).unwrap();
    let entries: Vec<(String, Vec<u8>)> = params
        .iter()
        .map(|(n, v)| (n.to_string(), f32s_to_bytes(v)))
        .collect();
    archive::write_entries(&weights, &entries).unwrap();
    (model, weights)
}

/// 16px セルの DetectNet 風モデル (入力 3 x size x size, 1クラス)
///
/// * `coverage` - 各セル内の B チャネルの最大値 / 255
/// * `bboxes` - 全セルで (0, 0, 16, 16)
pub fn detectnet_model(dir: &Path, size: usize) -> (PathBuf, PathBuf) {
    let json = format!(
        r#"{{
            "name": "detectnet-{size}",
            "inputs": [{{ "name": "data", "dims": [3, {size}, {size}] }}],
            "layers": [
                {{ "name": "pool", "type": "max_pool", "input": "data", "size": 16, "stride": 16 }},
                {{ "name": "coverage", "type": "convolution", "input": "pool", "filters": 1, "kernel": 1 }},
                {{ "name": "bboxes", "type": "convolution", "input": "pool", "filters": 4, "kernel": 1 }}
            ]
        }}"#,
        size = size
    );
    write_graph(
        dir,
        &format!("detectnet-{}", size),
        &json,
        &[
            ("weights.coverage", &[1. / 255., 0., 0.][..]),
            ("biases.coverage", &[0.][..]),
            ("weights.bboxes", &[0.; 12][..]),
            ("biases.bboxes", &[0., 0., 16., 16.][..]),
        ],
    )
}

pub fn detector_config(dir: &Path, size: usize) -> DetectorConfig {
    let (model, weights) = detectnet_model(dir, size);
    DetectorConfig {
        format: ModelFormat::Graph,
        model,
        weights,
        cache: dir.join("detectnet.engine"),
        channels: 3,
        width: size,
        height: size,
        stride: 16,
        classes: 1,
        precision: Precision::Standard,
        max_workspace_bytes: 1 << 24,
        threshold: 0.5,
        means: [0.; 3],
    }
}

/// 入力 (3 x size x size, f32) を作ります。`hot` に含まれるセル (x, y) の B チャネルを 255 にする
pub fn detectnet_input(size: usize, hot: &[(usize, usize)]) -> Vec<u8> {
    let mut values = vec![0f32; 3 * size * size];
    for &(cx, cy) in hot {
        for y in cy * 16..(cy + 1) * 16 {
            for x in cx * 16..(cx + 1) * 16 {
                values[y * size + x] = 255.;
            }
        }
    }
    f32s_to_bytes(&values)
}

/// 3x3 畳み込み 2段と 1x1 畳み込みを持つ小さなモデル (入力 2 x 6 x 6)
pub fn conv_model(dir: &Path) -> (PathBuf, PathBuf) {
    let json = r#"{
        "inputs": [{ "name": "data", "dims": [2, 6, 6] }],
        "layers": [
            { "name": "conv1", "type": "convolution", "input": "data", "filters": 4, "kernel": 3, "pad": 1 },
            { "name": "act1", "type": "activation", "input": "conv1", "function": "leaky" },
            { "name": "pool", "type": "max_pool", "input": "act1", "size": 2, "stride": 2 },
            { "name": "up", "type": "upsample", "input": "pool", "stride": 2 },
            { "name": "cat", "type": "concat", "inputs": ["up", "act1"] },
            { "name": "conv2", "type": "convolution", "input": "cat", "filters": 2, "kernel": 1 },
            { "name": "out", "type": "activation", "input": "conv2", "function": "sigmoid" }
        ]
    }"#;
    let w1: Vec<f32> = (0..4 * 2 * 9).map(|i| ((i * 7 % 11) as f32 - 5.) / 10.).collect();
    let w2: Vec<f32> = (0..2 * 8).map(|i| ((i * 5 % 9) as f32 - 4.) / 8.).collect();
    write_graph(
        dir,
        "conv",
        json,
        &[
            ("weights.conv1", w1.as_slice()),
            ("biases.conv1", &[0.1, -0.2, 0.0, 0.3][..]),
            ("weights.conv2", w2.as_slice()),
            ("biases.conv2", &[0.05, -0.05][..]),
        ],
    )
}

/// `conv_model` 用の入力 1サンプル分
pub fn conv_input(seed: usize) -> Vec<u8> {
    let values: Vec<f32> = (0..2 * 6 * 6).map(|i| (((i + seed) * 13 % 17) as f32 - 8.) / 4.).collect();
    f32s_to_bytes(&values)
}
