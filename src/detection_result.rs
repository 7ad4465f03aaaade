//! 物体検出の結果を保持するモジュール

use serde::{Deserialize, Serialize};

/// クラスタリング後の検出結果
///
/// 座標は `setup_image` で設定した画像の画素座標。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// クラス
    pub class_id: u32,
    /// コンフィデンス (クラスタの最初の候補の値)
    pub confidence: f32,
    /// バウンディングボックス左上のx
    pub x: u32,
    /// バウンディングボックス左上のy
    pub y: u32,
    /// バウンディングボックスの幅
    pub w: u32,
    /// バウンディングボックスの高さ
    pub h: u32,
}

impl Detection {
    /// バウンディングボックス右下の座標 (x2, y2)
    pub fn bottom_right(&self) -> (u32, u32) {
        (self.x.saturating_add(self.w), self.y.saturating_add(self.h))
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}
