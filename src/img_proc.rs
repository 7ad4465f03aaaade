//! 検出器の入力を作る画像処理と，検出結果の描画を行うモジュール

use image::imageops::FilterType;
use image::{DynamicImage, Pixel, Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use log::debug;

use crate::binding::Role;
use crate::detection_result::Detection;
use crate::device::Device;
use crate::error::{EngineError, Result};
use crate::kernels::PreprocessKernel;
use crate::memory_pool::DeviceMemoryPool;

/// 画像をモデル入力 (平均を引いたf32のBGR, CHW) に変換する前処理器
///
/// 入力・出力の2つのバッファを `swap` しながら，並べ替えと平均の減算を
/// デバイス上で順に実行する。
#[derive(Debug)]
pub struct ImagePreprocessor {
    pool: DeviceMemoryPool,
    /// B, G, R の順
    means: [f32; 3],
}

impl ImagePreprocessor {
    /// 新しい `ImagePreprocessor` を作成します。
    ///
    /// # Args
    /// * `means` - チャネルごとに引く平均値 (B, G, R の順)
    pub fn new(means: [f32; 3]) -> Self {
        Self {
            pool: DeviceMemoryPool::new(),
            means,
        }
    }

    pub fn means(&self) -> [f32; 3] {
        self.means
    }

    pub fn pool(&self) -> &DeviceMemoryPool {
        &self.pool
    }

    /// 画像をリサイズし，モデルの入力バッファを生成します。
    ///
    /// # Args
    /// * `device` - カーネルを実行するデバイス
    /// * `img` - 入力画像
    /// * `width` - モデル入力の幅
    /// * `height` - モデル入力の高さ
    ///
    /// # Return
    /// * f32 (リトルエンディアン) のBGR平面を並べたバイト列
    pub fn process(&mut self, device: &mut dyn Device, img: &DynamicImage, width: u32, height: u32) -> Result<Vec<u8>> {
        if width == 0 || height == 0 || img.width() == 0 || img.height() == 0 {
            return Err(EngineError::InvalidInput(format!(
                "cannot resize a {}x{} image to {}x{}",
                img.width(),
                img.height(),
                width,
                height
            )));
        }
        let rgb = if img.width() == width && img.height() == height {
            img.to_rgb8()
        } else {
            img.resize_exact(width, height, FilterType::Triangle).to_rgb8()
        };

        let (w, h) = (width as usize, height as usize);
        let planar_bytes = w * h * 3 * 4;

        let src = self.pool.acquire(device, Role::Input, rgb.as_raw().len())?;
        device.upload(rgb.as_raw(), src, 0)?;

        self.pool.acquire(device, Role::Output, planar_bytes)?;
        self.run(device, &PreprocessKernel::Planarize { width: w, height: h })?;
        self.pool.swap(Role::Input, Role::Output);

        self.pool.acquire(device, Role::Output, planar_bytes)?;
        let subtract = PreprocessKernel::SubtractMean {
            width: w,
            height: h,
            means: self.means,
        };
        self.run(device, &subtract)?;
        self.pool.swap(Role::Input, Role::Output);

        let result = self
            .pool
            .get(Role::Input)
            .ok_or_else(|| EngineError::InvalidState("preprocessed buffer is missing".into()))?;
        let mut host = vec![0u8; planar_bytes];
        device.download(result, 0, &mut host)?;
        debug!("preprocessed {}x{} image into {}x{}", img.width(), img.height(), width, height);
        Ok(host)
    }

    fn run(&mut self, device: &mut dyn Device, kernel: &PreprocessKernel) -> Result<()> {
        match self.pool.split_mut() {
            (Some(src), Some(dst)) => device.run_kernel(kernel, src, dst),
            _ => Err(EngineError::InvalidState("preprocess buffers are not allocated".into())),
        }
    }
}

const COLORS: [[u8; 3]; 10] = [
    [255, 0, 0],
    [255, 255, 0],
    [0, 0, 255],
    [14, 23, 50],
    [28, 105, 80],
    [190, 159, 53],
    [46, 194, 148],
    [242, 30, 131],
    [97, 101, 198],
    [115, 11, 87],
];

/// 画像上に水平または垂直の線を描画します。
///
/// # Args
/// * `img` - 線を描画する画像 (in-place)
/// * `x1`, `y1`, `x2`, `y2` - 線の始点と終点の座標
/// * `thickness` - 線の太さ
/// * `color` - 線の色
fn draw_line(img: &mut RgbImage, x1: i32, y1: i32, x2: i32, y2: i32, thickness: u32, color: Rgb<u8>) {
    let half = (thickness / 2) as i32;
    let (w, h) = if x1 == x2 {
        (thickness, y2.abs_diff(y1) + thickness)
    } else {
        (x2.abs_diff(x1) + thickness, thickness)
    };
    let rect = Rect::at(x1.min(x2) - half, y1.min(y2) - half).of_size(w, h);
    draw_filled_rect_mut(img, rect, color);
}

/// 画像上に検出結果の矩形を描画します。
///
/// コンフィデンスの低い順に描くので，重なった部分では高いものが上になる。
///
/// # Args
/// * `img` - 矩形を描画する画像 (in-place)
/// * `detections` - 検出結果
/// * `thickness` - 線の太さ (0なら1として扱う)
pub fn draw_detections(img: &mut RgbImage, detections: &[Detection], thickness: u32) {
    let thickness = thickness.max(1);
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    for d in &sorted {
        let color = *Rgb::from_slice(&COLORS[d.class_id as usize % COLORS.len()]);
        let (x2, y2) = d.bottom_right();
        let (x1, y1, x2, y2) = (d.x as i32, d.y as i32, x2 as i32, y2 as i32);

        draw_line(img, x1, y1, x1, y2, thickness, color);
        draw_line(img, x1, y2, x2, y2, thickness, color);
        draw_line(img, x1, y1, x2, y1, thickness, color);
        draw_line(img, x2, y1, x2, y2, thickness, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;
    use crate::tensor::bytes_to_f32s;

    #[test]
    fn converts_to_mean_subtracted_bgr_planes() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([10, 20, 30]));
        img.put_pixel(1, 0, Rgb([40, 50, 60]));

        let mut dev = HostDevice::new();
        let mut pre = ImagePreprocessor::new([1., 2., 3.]);
        let out = pre.process(&mut dev, &DynamicImage::ImageRgb8(img), 2, 1).unwrap();
        assert_eq!(bytes_to_f32s(&out), vec![29., 59., 18., 48., 7., 37.]);
    }

    #[test]
    fn resizes_and_stops_allocating() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([100, 100, 100])));
        let mut dev = HostDevice::new();
        let mut pre = ImagePreprocessor::new([100., 100., 100.]);

        let out = pre.process(&mut dev, &img, 4, 4).unwrap();
        assert_eq!(out.len(), 4 * 4 * 3 * 4);
        assert!(bytes_to_f32s(&out).iter().all(|v| v.abs() < 1e-3));

        let allocations = pre.pool().allocations();
        pre.process(&mut dev, &img, 4, 4).unwrap();
        assert_eq!(pre.pool().allocations(), allocations);
    }

    #[test]
    fn empty_target_is_rejected() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        let mut dev = HostDevice::new();
        let err = ImagePreprocessor::new([0.; 3]).process(&mut dev, &img, 0, 2).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn draws_box_outline() {
        let mut img = RgbImage::new(10, 10);
        let d = Detection {
            class_id: 0,
            confidence: 0.9,
            x: 2,
            y: 2,
            w: 5,
            h: 5,
        };
        draw_detections(&mut img, &[d], 1);
        let red = Rgb([255, 0, 0]);
        assert_eq!(*img.get_pixel(2, 2), red);
        assert_eq!(*img.get_pixel(7, 7), red);
        assert_eq!(*img.get_pixel(4, 2), red);
        // 内側は塗らない
        assert_eq!(*img.get_pixel(4, 4), Rgb([0, 0, 0]));
    }
}
