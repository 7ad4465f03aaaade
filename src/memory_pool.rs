//! 役割ごとに再利用されるデバイスメモリのプール

use log::debug;

use crate::binding::Role;
use crate::device::{Device, DeviceBuffer};
use crate::error::Result;

/// 入力・出力の役割ごとにデバイスバッファを保持するプール
///
/// 容量は要求された最大サイズまで単調に増え，縮小はしない。
/// 排他制御は行わないため，同じプールを複数の呼び出し元から同時に使ってはならない。
#[derive(Debug, Default)]
pub struct DeviceMemoryPool {
    buffers: [Option<DeviceBuffer>; 2],
    allocations: usize,
}

impl DeviceMemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 役割に対応する `size` バイト以上のバッファを返します。
    ///
    /// 容量が足りていれば既存のバッファを再利用し，足りなければ解放して
    /// ちょうど `size` バイトのバッファを確保し直す。
    ///
    /// # Args
    /// * `device` - 確保に使うデバイス
    /// * `role` - 論理的な役割
    /// * `size` - 必要なバイト数
    pub fn acquire(&mut self, device: &mut dyn Device, role: Role, size: usize) -> Result<&mut DeviceBuffer> {
        let slot = &mut self.buffers[role.index()];
        let buf = match slot.take() {
            Some(buf) if buf.capacity() >= size => buf,
            old => {
                let old = old.map(|b| b.capacity()).unwrap_or(0);
                debug!("growing {:?} buffer from {} to {} bytes", role, old, size);
                let buf = device.allocate(size)?;
                self.allocations += 1;
                buf
            }
        };
        Ok(slot.insert(buf))
    }

    /// 2つの役割のバッファをコピーせずに入れ替えます。
    pub fn swap(&mut self, a: Role, b: Role) {
        self.buffers.swap(a.index(), b.index());
    }

    pub fn get(&self, role: Role) -> Option<&DeviceBuffer> {
        self.buffers[role.index()].as_ref()
    }

    pub fn get_mut(&mut self, role: Role) -> Option<&mut DeviceBuffer> {
        self.buffers[role.index()].as_mut()
    }

    /// 入力バッファを読み取り用，出力バッファを書き込み用に同時に借用します。
    pub fn split_mut(&mut self) -> (Option<&DeviceBuffer>, Option<&mut DeviceBuffer>) {
        let [input, output] = &mut self.buffers;
        (input.as_ref(), output.as_mut())
    }

    /// 役割の現在の容量 (未確保なら0)
    pub fn capacity(&self, role: Role) -> usize {
        self.get(role).map(|b| b.capacity()).unwrap_or(0)
    }

    /// これまでに行ったデバイスメモリの確保回数
    pub fn allocations(&self) -> usize {
        self.allocations
    }
}
