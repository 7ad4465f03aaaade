//! ホストバッファ (バイト列) とf32テンソルの変換

/// f32のスライスをリトルエンディアンのバイト列に変換します。
pub fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// リトルエンディアンのバイト列をf32のベクタに変換します。端数のバイトは無視される
pub fn bytes_to_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
