//! gzip圧縮したtarアーカイブ (重みファイル・エンジンキャッシュ) を扱うモジュール

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{ensure, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::tensor;

/// エントリ読み込み時に先に確保する最大バイト数
const PREALLOCATE_LIMIT: u64 = 1 << 20;

/// アーカイブ内の全ファイルを読み込みます。
///
/// # Args
/// * `path` - gzip圧縮されたtarアーカイブへのパス
///
/// # Return
/// * (ファイル名, データ) のベクタ (アーカイブ内の順序)
pub fn read_entries<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Vec<u8>)>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("cannot open {:?}", path))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut entries = Vec::new();
    for entry in archive.entries().context("not a tar.gz archive")? {
        let mut entry = entry.context("broken archive entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .context("invalid entry path")?
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .context("entry without a file name")?;
        // ヘッダのサイズは信用せず，確保は上限付き
        let mut buf = Vec::with_capacity(entry.size().min(PREALLOCATE_LIMIT) as usize);
        entry
            .read_to_end(&mut buf)
            .with_context(|| format!("cannot read entry {}", name))?;
        entries.push((name, buf));
    }
    Ok(entries)
}

/// ファイル群をアーカイブとして書き出します。
///
/// # Args
/// * `path` - 出力先のパス
/// * `entries` - (ファイル名, データ) のスライス
pub fn write_entries<P: AsRef<Path>>(path: P, entries: &[(String, Vec<u8>)]) -> std::io::Result<()> {
    let file = File::create(path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, data.as_slice())?;
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?.flush()
}

/// 符号あり[8bits].[8bits]の固定小数点数をf32型の浮動小数点数に変換します
fn fix2float(input: i16) -> f32 {
    input as f32 / 2f32.powi(8)
}

/// リトルエンディアンのf32列をデコードします。
pub fn decode_f32_le(bytes: &[u8]) -> Result<Vec<f32>> {
    ensure!(bytes.len() % 4 == 0, "length {} is not a multiple of 4", bytes.len());
    Ok(tensor::bytes_to_f32s(bytes))
}

/// リトルエンディアンの8.8固定小数点数列をf32にデコードします。
pub fn decode_fixed8_8(bytes: &[u8]) -> Result<Vec<f32>> {
    ensure!(bytes.len() % 2 == 0, "length {} is not a multiple of 2", bytes.len());
    Ok(bytes
        .chunks_exact(2)
        .map(|c| fix2float(i16::from_le_bytes([c[0], c[1]])))
        .collect())
}
