use anyhow::Result;
use std::time::Instant;

use detectnet_rt::detector::{BBOXES_NAME, COVERAGE_NAME, INPUT_NAME};
use detectnet_rt::{BuildOptions, DetectorConfig, Dims, Engine, InferenceEngine};

fn main() -> Result<()> {
    // 使い方: benchmark [設定ファイル] [バッチサイズ] [繰り返し回数]
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "demos/detector.json".to_string());
    let batch_size: usize = args.next().map(|a| a.parse()).transpose()?.unwrap_or(2);
    let iterations: usize = args.next().map(|a| a.parse()).transpose()?.unwrap_or(20);

    let config = DetectorConfig::from_json_file(&config_path)?;
    let (grid_w, grid_h) = config.grid_size();

    // 検出器と同じバインディングで，指定したバッチサイズのエンジンをビルド
    let mut engine = InferenceEngine::new(config.format);
    engine.add_input(INPUT_NAME, Dims::chw(config.channels, config.height, config.width), 4)?;
    engine.add_output(COVERAGE_NAME, Dims::chw(config.classes, grid_h, grid_w), 4)?;
    engine.add_output(BBOXES_NAME, Dims::chw(4, grid_h, grid_w), 4)?;
    let options = BuildOptions {
        max_batch_size: batch_size,
        ..config.build_options()
    };
    engine.load_model(&config.model, &config.weights, &options)?;
    println!("{}", engine.summary());

    let sample_bytes = config.channels * config.width * config.height * 4;
    let batch = vec![vec![vec![0u8; sample_bytes]]; batch_size];

    // 1回目はバッファ確保を含むので除外
    engine.predict(&batch)?;

    let start = Instant::now();
    for _ in 0..iterations {
        engine.predict(&batch)?;
    }
    let t = start.elapsed().as_secs_f64() * 1000.0 / iterations.max(1) as f64;
    println!(
        "batch {}: {:.03}ms per batch, {:.03}ms per sample",
        batch_size,
        t,
        t / batch_size as f64
    );

    Ok(())
}
