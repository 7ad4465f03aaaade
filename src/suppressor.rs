//! DetectNetのカバレッジ・バウンディングボックス出力をクラスタリングするモジュール

use crate::detection_result::Detection;
use crate::error::{EngineError, Result};

/// 画像・モデル入力・グリッドのサイズから求めた変換係数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Calibration {
    scale_x: usize,
    scale_y: usize,
    cell_w: usize,
    cell_h: usize,
    grid_w: usize,
    grid_h: usize,
}

/// クラスタ中の矩形 (x1, y1) - (x2, y2)
#[derive(Debug, Clone, Copy, PartialEq)]
struct Rect {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    confidence: f32,
}

impl Rect {
    fn overlaps(&self, other: &Rect) -> bool {
        !(other.x1 > self.x2 || other.x2 < self.x1 || other.y1 > self.y2 || other.y2 < self.y1)
    }
}

/// 重なっている最初の矩形に候補を統合します。重なる矩形がなければ末尾に追加する。
///
/// 統合後のコンフィデンスは既存の矩形のものを保つ。
fn merge_rect(rects: &mut Vec<Rect>, rect: Rect) {
    match rects.iter_mut().find(|r| r.overlaps(&rect)) {
        Some(r) => {
            r.x1 = r.x1.min(rect.x1);
            r.y1 = r.y1.min(rect.y1);
            r.x2 = r.x2.max(rect.x2);
            r.y2 = r.y2.max(rect.y2);
        }
        None => rects.push(rect),
    }
}

/// グリッド状の予測を，クラスごとに重なりでまとめた検出結果に変換する構造体
///
/// 画像サイズ・モデル入力サイズ・グリッドサイズの3つを設定すると変換係数が決まる。
/// どれかを設定し直すたびに係数は再計算される。
#[derive(Debug, Clone, Default)]
pub struct ClusteredSuppressor {
    image: Option<(usize, usize)>,
    input: Option<(usize, usize)>,
    grid: Option<(usize, usize)>,
    calibration: Option<Calibration>,
}

impl ClusteredSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 検出結果の座標系となる画像サイズを設定します。
    pub fn setup_image(&mut self, width: usize, height: usize) {
        self.image = Some((width, height));
        self.recalculate();
    }

    /// モデル入力のサイズを設定します。
    pub fn setup_input(&mut self, width: usize, height: usize) {
        self.input = Some((width, height));
        self.recalculate();
    }

    /// 出力グリッドのセル数を設定します。
    pub fn setup_grid(&mut self, width: usize, height: usize) {
        self.grid = Some((width, height));
        self.recalculate();
    }

    fn recalculate(&mut self) {
        self.calibration = match (self.image, self.input, self.grid) {
            (Some((iw, ih)), Some((mw, mh)), Some((gw, gh)))
                if iw > 0 && ih > 0 && mw > 0 && mh > 0 && gw > 0 && gh > 0 =>
            {
                // 整数の切り捨て除算 (モデル入力より大きい画像では0になる)
                Some(Calibration {
                    scale_x: mw / iw,
                    scale_y: mh / ih,
                    cell_w: mw / gw,
                    cell_h: mh / gh,
                    grid_w: gw,
                    grid_h: gh,
                })
            }
            _ => None,
        };
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    /// 現在の倍率 (scale_x, scale_y)
    pub fn scale(&self) -> Option<(usize, usize)> {
        self.calibration.map(|c| (c.scale_x, c.scale_y))
    }

    /// モデル入力上でのセルの大きさ (幅, 高さ)
    pub fn cell_size(&self) -> Option<(usize, usize)> {
        self.calibration.map(|c| (c.cell_w, c.cell_h))
    }

    /// グリッドの予測をクラスタリングして検出結果を返します。
    ///
    /// # Args
    /// * `coverage` - カバレッジ `[class][y][x]`
    /// * `bboxes` - 各セルからの矩形オフセット `[4][y][x]` (x1, y1, x2, y2 の順)
    /// * `nb_classes` - クラス数
    /// * `threshold` - カバレッジの閾値 (0以上1以下)
    ///
    /// # Return
    /// * クラス順，各クラス内ではクラスタの生成順に並んだ検出結果
    pub fn execute(&self, coverage: &[f32], bboxes: &[f32], nb_classes: usize, threshold: f32) -> Result<Vec<Detection>> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(EngineError::InvalidInput(format!(
                "coverage threshold {} is outside [0, 1]",
                threshold
            )));
        }
        let cal = self.calibration.ok_or(EngineError::NotCalibrated)?;

        let too_large = || {
            EngineError::InvalidInput(format!(
                "{} classes on a {}x{} grid is too large",
                nb_classes, cal.grid_w, cal.grid_h
            ))
        };
        let grid_size = cal.grid_w.checked_mul(cal.grid_h).ok_or_else(too_large)?;
        let needed = nb_classes.checked_mul(grid_size).ok_or_else(too_large)?;
        let needed_bboxes = grid_size.checked_mul(4).ok_or_else(too_large)?;
        if coverage.len() < needed {
            return Err(EngineError::InvalidInput(format!(
                "coverage has {} values, {} classes x {} cells needed",
                coverage.len(),
                nb_classes,
                grid_size
            )));
        }
        if bboxes.len() < needed_bboxes {
            return Err(EngineError::InvalidInput(format!(
                "bboxes has {} values, 4 x {} cells needed",
                bboxes.len(),
                grid_size
            )));
        }

        let (sx, sy) = (cal.scale_x as f32, cal.scale_y as f32);
        let mut clusters: Vec<Vec<Rect>> = vec![Vec::new(); nb_classes];
        for (c, rects) in clusters.iter_mut().enumerate() {
            for y in 0..cal.grid_h {
                for x in 0..cal.grid_w {
                    let cell = y * cal.grid_w + x;
                    let cvg = coverage[c * grid_size + cell];
                    if cvg <= threshold {
                        continue;
                    }
                    let mx = (x * cal.cell_w) as f32;
                    let my = (y * cal.cell_h) as f32;
                    merge_rect(
                        rects,
                        Rect {
                            x1: (bboxes[cell] + mx) * sx,
                            y1: (bboxes[grid_size + cell] + my) * sy,
                            x2: (bboxes[2 * grid_size + cell] + mx) * sx,
                            y2: (bboxes[3 * grid_size + cell] + my) * sy,
                            confidence: cvg,
                        },
                    );
                }
            }
        }

        let detections = clusters
            .iter()
            .enumerate()
            .flat_map(|(c, rects)| rects.iter().map(move |r| (c, r)))
            .take(grid_size * nb_classes)
            .map(|(c, r)| {
                // f32 -> u32 は負数とNaNを0に飽和させる
                let (x1, y1, x2, y2) = (r.x1 as u32, r.y1 as u32, r.x2 as u32, r.y2 as u32);
                Detection {
                    class_id: c as u32,
                    confidence: r.confidence,
                    x: x1,
                    y: y1,
                    w: x2.saturating_sub(x1),
                    h: y2.saturating_sub(y1),
                }
            })
            .collect();
        Ok(detections)
    }
}
