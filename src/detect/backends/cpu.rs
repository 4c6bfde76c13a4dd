use anyhow::Result;
use image::{GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::HashMap;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{BoundingBox, Detection, DetectionResult};

pub const DEFAULT_MOTION_THRESHOLD: u8 = 25;
pub const DEFAULT_MOTION_CELL: u32 = 16;

/// CPU backend for motion detection by frame differencing.
///
/// The grayscale frame is split into square cells; a cell is "changed" when its
/// mean absolute difference against the previous frame exceeds the threshold.
/// Touching changed cells are merged into one box. Keeps the previous frame, so
/// every stream needs its own instance.
pub struct CpuMotionBackend {
    threshold: u8,
    cell: u32,
    previous: Option<GrayImage>,
}

impl CpuMotionBackend {
    pub fn new(threshold: u8, cell: u32) -> Self {
        Self {
            threshold,
            cell: cell.max(1),
            previous: None,
        }
    }

    fn changed_cells(&self, prev: &GrayImage, current: &GrayImage) -> GrayImage {
        let (w, h) = current.dimensions();
        let cols = w.div_ceil(self.cell);
        let rows = h.div_ceil(self.cell);
        let mut mask = GrayImage::new(cols, rows);
        for row in 0..rows {
            for col in 0..cols {
                let x0 = col * self.cell;
                let y0 = row * self.cell;
                let x1 = (x0 + self.cell).min(w);
                let y1 = (y0 + self.cell).min(h);
                let mut total: u64 = 0;
                for y in y0..y1 {
                    for x in x0..x1 {
                        let a = prev.get_pixel(x, y)[0];
                        let b = current.get_pixel(x, y)[0];
                        total += a.abs_diff(b) as u64;
                    }
                }
                let count = ((x1 - x0) * (y1 - y0)) as u64;
                if count > 0 && total / count > self.threshold as u64 {
                    mask.put_pixel(col, row, Luma([255]));
                }
            }
        }
        mask
    }

    fn boxes_from_mask(&self, mask: &GrayImage, width: u32, height: u32) -> Vec<Detection> {
        let labeled = connected_components(mask, Connectivity::Eight, Luma([0]));

        let mut regions: HashMap<u32, (u32, u32, u32, u32)> = HashMap::new();
        for (x, y, label) in labeled.enumerate_pixels() {
            let label = label[0];
            if label == 0 {
                continue;
            }
            regions
                .entry(label)
                .and_modify(|(min_x, min_y, max_x, max_y)| {
                    *min_x = (*min_x).min(x);
                    *min_y = (*min_y).min(y);
                    *max_x = (*max_x).max(x);
                    *max_y = (*max_y).max(y);
                })
                .or_insert((x, y, x, y));
        }

        let mut labels: Vec<u32> = regions.keys().copied().collect();
        labels.sort_unstable();
        labels
            .into_iter()
            .map(|label| {
                let (min_x, min_y, max_x, max_y) = regions[&label];
                Detection::bare(BoundingBox::new(
                    (min_x * self.cell) as f32,
                    (min_y * self.cell) as f32,
                    ((max_x + 1) * self.cell).min(width) as f32,
                    ((max_y + 1) * self.cell).min(height) as f32,
                ))
            })
            .collect()
    }
}

impl Default for CpuMotionBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MOTION_THRESHOLD, DEFAULT_MOTION_CELL)
    }
}

impl DetectorBackend for CpuMotionBackend {
    fn name(&self) -> &'static str {
        "cpu-motion"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::Motion)
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<DetectionResult> {
        let current = image::imageops::grayscale(frame);
        let (w, h) = current.dimensions();

        let detections = match self.previous.as_ref() {
            Some(prev) if prev.dimensions() == (w, h) => {
                let mask = self.changed_cells(prev, &current);
                self.boxes_from_mask(&mask, w, h)
            }
            // first frame, or the output size changed
            _ => Vec::new(),
        };

        self.previous = Some(current);
        Ok(DetectionResult::new(detections))
    }
}
