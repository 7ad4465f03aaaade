//! 推論を実行するデバイスとデバイスメモリを抽象化するモジュール

use log::info;

use crate::compiler::{CompiledEngine, Precision};
use crate::error::{EngineError, Result};
use crate::kernels::{self, PreprocessKernel};

/// デバイスが対応している低精度モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub half: bool,
    pub int8: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self { half: true, int8: true }
    }
}

impl DeviceCapabilities {
    pub fn supports(&self, precision: Precision) -> bool {
        match precision {
            Precision::Standard => true,
            Precision::Half => self.half,
            Precision::Int8 => self.int8,
        }
    }
}

/// デバイス上に確保されたメモリ領域
#[derive(Debug)]
pub struct DeviceBuffer {
    id: u64,
    data: Vec<u8>,
}

impl DeviceBuffer {
    /// バッファの識別子 (確保ごとに一意)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 確保済みのバイト数
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// 推論エンジンを実行するデバイス
///
/// 全ての操作は完了するまで呼び出し元をブロックする。
pub trait Device {
    fn name(&self) -> &str;

    fn capabilities(&self) -> DeviceCapabilities;

    /// `size` バイトのデバイスメモリを確保します。
    fn allocate(&mut self, size: usize) -> Result<DeviceBuffer>;

    /// ホストのデータをデバイスバッファの `offset` 以降にコピーします。
    fn upload(&mut self, src: &[u8], dst: &mut DeviceBuffer, offset: usize) -> Result<()>;

    /// デバイスバッファの `offset` 以降をホストのバッファにコピーします。
    fn download(&mut self, src: &DeviceBuffer, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// ビルド済みエンジンの順伝播を `batch` サンプル分実行します。
    ///
    /// # Args
    /// * `engine` - ビルド済みエンジン
    /// * `batch` - サンプル数 (最大バッチサイズ以下)
    /// * `input` - 全入力バインディングを格納したバッファ
    /// * `output` - 全出力バインディングを格納するバッファ
    fn execute(
        &mut self,
        engine: &CompiledEngine,
        batch: usize,
        input: &DeviceBuffer,
        output: &mut DeviceBuffer,
    ) -> Result<()>;

    /// 前処理カーネルを実行します。
    fn run_kernel(&mut self, kernel: &PreprocessKernel, src: &DeviceBuffer, dst: &mut DeviceBuffer) -> Result<()>;
}

/// メモリをホストのRAM上に置き，CPUでカーネルを実行するデバイス
#[derive(Debug)]
pub struct HostDevice {
    name: String,
    caps: DeviceCapabilities,
    /// 1回の確保で許可する最大バイト数
    max_allocation: Option<usize>,
    next_id: u64,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities::default())
    }

    pub fn with_capabilities(caps: DeviceCapabilities) -> Self {
        info!("using host device (half: {}, int8: {})", caps.half, caps.int8);
        Self {
            name: "host".to_string(),
            caps,
            max_allocation: None,
            next_id: 0,
        }
    }

    /// 1回の確保の上限を設定します。上限を超える確保はメモリ不足として失敗する
    pub fn with_allocation_limit(mut self, bytes: usize) -> Self {
        self.max_allocation = Some(bytes);
        self
    }
}

fn check_range(what: &str, offset: usize, len: usize, capacity: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(EngineError::DeviceMemory(format!(
            "{} of {} bytes at offset {} exceeds buffer of {} bytes",
            what, len, offset, capacity
        ))),
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps
    }

    fn allocate(&mut self, size: usize) -> Result<DeviceBuffer> {
        if let Some(limit) = self.max_allocation {
            if size > limit {
                return Err(EngineError::DeviceMemory(format!(
                    "out of memory: requested {} bytes, limit {} bytes",
                    size, limit
                )));
            }
        }
        self.next_id += 1;
        Ok(DeviceBuffer {
            id: self.next_id,
            data: vec![0; size],
        })
    }

    fn upload(&mut self, src: &[u8], dst: &mut DeviceBuffer, offset: usize) -> Result<()> {
        check_range("upload", offset, src.len(), dst.capacity())?;
        dst.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn download(&mut self, src: &DeviceBuffer, offset: usize, dst: &mut [u8]) -> Result<()> {
        check_range("download", offset, dst.len(), src.capacity())?;
        dst.copy_from_slice(&src.data[offset..offset + dst.len()]);
        Ok(())
    }

    fn execute(
        &mut self,
        engine: &CompiledEngine,
        batch: usize,
        input: &DeviceBuffer,
        output: &mut DeviceBuffer,
    ) -> Result<()> {
        kernels::run_engine(engine, batch, input.bytes(), output.bytes_mut())
    }

    fn run_kernel(&mut self, kernel: &PreprocessKernel, src: &DeviceBuffer, dst: &mut DeviceBuffer) -> Result<()> {
        kernels::run_preprocess(kernel, src.bytes(), dst.bytes_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let mut dev = HostDevice::new();
        let a = dev.allocate(8).unwrap();
        let b = dev.allocate(8).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.capacity(), 8);
    }

    #[test]
    fn copies_are_bounds_checked() {
        let mut dev = HostDevice::new();
        let mut buf = dev.allocate(4).unwrap();
        dev.upload(&[1, 2], &mut buf, 2).unwrap();
        let mut out = [0u8; 4];
        dev.download(&buf, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 1, 2]);

        let err = dev.upload(&[1, 2, 3], &mut buf, 2).unwrap_err();
        assert!(matches!(err, EngineError::DeviceMemory(_)));
        let mut big = [0u8; 5];
        assert!(dev.download(&buf, 0, &mut big).is_err());
    }

    #[test]
    fn allocation_limit() {
        let mut dev = HostDevice::new().with_allocation_limit(16);
        assert!(dev.allocate(16).is_ok());
        assert!(matches!(dev.allocate(17), Err(EngineError::DeviceMemory(_))));
    }

    #[test]
    fn precision_support() {
        let caps = DeviceCapabilities { half: true, int8: false };
        assert!(caps.supports(Precision::Standard));
        assert!(caps.supports(Precision::Half));
        assert!(!caps.supports(Precision::Int8));
    }
}
