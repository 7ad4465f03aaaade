//! CPUで実行するカーネル (順伝播と前処理)

use crate::binding::Role;
use crate::compiler::{CompiledEngine, ConvKernel, KernelOp, Step};
use crate::error::{EngineError, Result};
use crate::network::Activation;
use crate::tensor::{bytes_to_f32s, f32s_to_bytes};

/// 前処理カーネルの種類
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PreprocessKernel {
    /// 8bit RGB (HWC) を f32 BGR (CHW) に並べ替える
    Planarize { width: usize, height: usize },
    /// f32 (CHW) の各チャネルから平均値を引く
    SubtractMean {
        width: usize,
        height: usize,
        means: [f32; 3],
    },
}

fn short_buffer(what: &str, have: usize, need: usize) -> EngineError {
    EngineError::DeviceMemory(format!("{} buffer holds {} bytes, {} needed", what, have, need))
}

/// 前処理カーネルを実行します。
///
/// # Args
/// * `kernel` - カーネルの種類
/// * `src` - 入力バッファ
/// * `dst` - 出力バッファ
pub fn run_preprocess(kernel: &PreprocessKernel, src: &[u8], dst: &mut [u8]) -> Result<()> {
    match *kernel {
        PreprocessKernel::Planarize { width, height } => {
            let plane = width * height;
            if src.len() < plane * 3 {
                return Err(short_buffer("source", src.len(), plane * 3));
            }
            if dst.len() < plane * 3 * 4 {
                return Err(short_buffer("destination", dst.len(), plane * 3 * 4));
            }
            for (i, px) in src[..plane * 3].chunks_exact(3).enumerate() {
                for (c, &v) in px.iter().enumerate() {
                    // RGB -> BGR
                    let base = ((2 - c) * plane + i) * 4;
                    dst[base..base + 4].copy_from_slice(&(v as f32).to_le_bytes());
                }
            }
        }
        PreprocessKernel::SubtractMean { width, height, means } => {
            let plane = width * height;
            let need = plane * 3 * 4;
            if src.len() < need {
                return Err(short_buffer("source", src.len(), need));
            }
            if dst.len() < need {
                return Err(short_buffer("destination", dst.len(), need));
            }
            let values = bytes_to_f32s(&src[..need]);
            let shifted: Vec<f32> = values
                .iter()
                .enumerate()
                .map(|(i, v)| v - means[i / plane])
                .collect();
            dst[..need].copy_from_slice(&f32s_to_bytes(&shifted));
        }
    }
    Ok(())
}

/// ビルド済みエンジンの順伝播を実行します。
///
/// # Args
/// * `engine` - ビルド済みエンジン
/// * `batch` - サンプル数
/// * `input` - 入力バインディングを格納したバイト列
/// * `output` - 出力バインディングを書き込むバイト列
pub fn run_engine(engine: &CompiledEngine, batch: usize, input: &[u8], output: &mut [u8]) -> Result<()> {
    if batch > engine.max_batch_size {
        return Err(EngineError::BatchSizeExceeded {
            requested: batch,
            max: engine.max_batch_size,
        });
    }
    let need_in = engine.buffer_bytes(Role::Input);
    let need_out = engine.buffer_bytes(Role::Output);
    if input.len() < need_in {
        return Err(short_buffer("input", input.len(), need_in));
    }
    if output.len() < need_out {
        return Err(short_buffer("output", output.len(), need_out));
    }

    // 精度モードの重みは呼び出しごとに一度だけf32に戻す
    let weights: Vec<Option<Vec<f32>>> = engine
        .steps
        .iter()
        .map(|s| match &s.op {
            KernelOp::Convolution(conv) => Some(conv.weights.dequantize()),
            _ => None,
        })
        .collect();

    let in_offsets = engine.binding_offsets(Role::Input);
    let out_offsets = engine.binding_offsets(Role::Output);

    for b in 0..batch {
        let mut acts: Vec<Vec<f32>> = vec![Vec::new(); engine.tensors.len()];

        for &(j, offset) in &in_offsets {
            let n = engine.bindings[j].sample_bytes();
            let start = offset + b * n;
            acts[engine.binding_tensors[j]] = bytes_to_f32s(&input[start..start + n]);
        }

        for (step, w) in engine.steps.iter().zip(&weights) {
            let out = run_step(engine, step, w.as_deref(), &acts);
            acts[step.output] = out;
        }

        for &(j, offset) in &out_offsets {
            let n = engine.bindings[j].sample_bytes();
            let start = offset + b * n;
            output[start..start + n].copy_from_slice(&f32s_to_bytes(&acts[engine.binding_tensors[j]]));
        }
    }
    Ok(())
}

fn chw(engine: &CompiledEngine, tensor: usize) -> (usize, usize, usize) {
    let d = engine.tensors[tensor].dims.as_slice();
    (d[0], d[1], d[2])
}

fn run_step(engine: &CompiledEngine, step: &Step, weights: Option<&[f32]>, acts: &[Vec<f32>]) -> Vec<f32> {
    let x = &acts[step.inputs[0]];
    let in_dims = chw(engine, step.inputs[0]);
    let out_dims = chw(engine, step.output);

    match &step.op {
        KernelOp::Convolution(conv) => convolution(conv, weights.unwrap_or(&[]), x, in_dims, out_dims),
        KernelOp::Activation { function } => activation(*function, x),
        KernelOp::MaxPool { size, stride } => max_pool(x, in_dims, out_dims, *size, *stride),
        KernelOp::Upsample { stride } => upsample(x, in_dims, out_dims, *stride),
        KernelOp::Concat => step
            .inputs
            .iter()
            .flat_map(|&i| acts[i].iter().copied())
            .collect(),
    }
}

fn convolution(
    conv: &ConvKernel,
    w: &[f32],
    x: &[f32],
    (c, h, wd): (usize, usize, usize),
    (_, oh, ow): (usize, usize, usize),
) -> Vec<f32> {
    let k = conv.kernel;
    let pad = conv.pad as isize;
    let mut y = vec![0.; conv.filters * oh * ow];

    for f in 0..conv.filters {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut sum = conv.biases[f];
                for ch in 0..c {
                    for ky in 0..k {
                        let iy = (oy * conv.stride + ky) as isize - pad;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for kx in 0..k {
                            let ix = (ox * conv.stride + kx) as isize - pad;
                            if ix < 0 || ix >= wd as isize {
                                continue;
                            }
                            let wi = ((f * c + ch) * k + ky) * k + kx;
                            let xi = (ch * h + iy as usize) * wd + ix as usize;
                            sum += w[wi] * x[xi];
                        }
                    }
                }
                y[(f * oh + oy) * ow + ox] = sum;
            }
        }
    }
    y
}

fn activation(function: Activation, x: &[f32]) -> Vec<f32> {
    x.iter().map(|&v| function.apply(v)).collect()
}

fn max_pool(
    x: &[f32],
    (c, h, w): (usize, usize, usize),
    (_, oh, ow): (usize, usize, usize),
    size: usize,
    stride: usize,
) -> Vec<f32> {
    // 窓の中心合わせ (size=2 ではずらさない)
    let offset = ((size - 1) / 2) as isize;
    let mut y = vec![0.; c * oh * ow];
    for ch in 0..c {
        for oy in 0..oh {
            for ox in 0..ow {
                let mut m = f32::NEG_INFINITY;
                for ky in 0..size {
                    let iy = (oy * stride + ky) as isize - offset;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for kx in 0..size {
                        let ix = (ox * stride + kx) as isize - offset;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        m = m.max(x[(ch * h + iy as usize) * w + ix as usize]);
                    }
                }
                y[(ch * oh + oy) * ow + ox] = m;
            }
        }
    }
    y
}

fn upsample(
    x: &[f32],
    (c, h, w): (usize, usize, usize),
    (_, oh, ow): (usize, usize, usize),
    stride: usize,
) -> Vec<f32> {
    let mut y = vec![0.; c * oh * ow];
    for ch in 0..c {
        for oy in 0..oh {
            for ox in 0..ow {
                y[(ch * oh + oy) * ow + ox] = x[(ch * h + oy / stride) * w + ox / stride];
            }
        }
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ConvWeights;

    fn kernel(filters: usize, kernel: usize, pad: usize, biases: Vec<f32>) -> ConvKernel {
        ConvKernel {
            channels: 1,
            filters,
            kernel,
            stride: 1,
            pad,
            weights: ConvWeights::default(),
            biases,
        }
    }

    #[test]
    fn conv_3x3_box_filter_with_padding() {
        let x = vec![1.; 9];
        let y = convolution(&kernel(1, 3, 1, vec![0.5]), &[1.; 9], &x, (1, 3, 3), (1, 3, 3));
        // 角は4画素，辺は6画素，中央は9画素を合計する
        assert_eq!(y, vec![4.5, 6.5, 4.5, 6.5, 9.5, 6.5, 4.5, 6.5, 4.5]);
    }

    #[test]
    fn conv_1x1_scales_per_filter() {
        let x = vec![1., 2., 3., 4.];
        let y = convolution(&kernel(2, 1, 0, vec![0., 1.]), &[2., -1.], &x, (1, 2, 2), (2, 2, 2));
        assert_eq!(y, vec![2., 4., 6., 8., 0., -1., -2., -3.]);
    }

    #[test]
    fn max_pool_stride_2() {
        #[rustfmt::skip]
        let x = vec![
            1., 2., 5., 0.,
            3., 4., 1., 1.,
            0., 0., 9., 8.,
            0., 7., 6., 5.,
        ];
        assert_eq!(max_pool(&x, (1, 4, 4), (1, 2, 2), 2, 2), vec![4., 5., 7., 9.]);
    }

    #[test]
    fn max_pool_stride_1_keeps_edges() {
        let x = vec![1., 3., 2., 0.];
        assert_eq!(max_pool(&x, (1, 2, 2), (1, 2, 2), 2, 1), vec![3., 3., 2., 0.]);
    }

    #[test]
    fn upsample_nearest() {
        let x = vec![1., 2.];
        assert_eq!(upsample(&x, (1, 1, 2), (1, 2, 4), 2), vec![1., 1., 2., 2., 1., 1., 2., 2.]);
    }

    #[test]
    fn planarize_swaps_to_bgr() {
        let src = [10u8, 20, 30, 40, 50, 60];
        let mut dst = vec![0u8; 6 * 4];
        run_preprocess(&PreprocessKernel::Planarize { width: 2, height: 1 }, &src, &mut dst).unwrap();
        assert_eq!(bytes_to_f32s(&dst), vec![30., 60., 20., 50., 10., 40.]);
    }

    #[test]
    fn subtract_mean_per_channel() {
        let src = f32s_to_bytes(&[10., 10., 20., 20., 30., 30.]);
        let mut dst = vec![0u8; src.len()];
        let kernel = PreprocessKernel::SubtractMean {
            width: 2,
            height: 1,
            means: [1., 2., 3.],
        };
        run_preprocess(&kernel, &src, &mut dst).unwrap();
        assert_eq!(bytes_to_f32s(&dst), vec![9., 9., 18., 18., 27., 27.]);
    }

    #[test]
    fn short_buffers_fail() {
        let mut dst = vec![0u8; 4];
        let err = run_preprocess(&PreprocessKernel::Planarize { width: 2, height: 2 }, &[0; 12], &mut dst);
        assert!(matches!(err, Err(EngineError::DeviceMemory(_))));
    }
}
