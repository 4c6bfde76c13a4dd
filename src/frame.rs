//! Frames and the latest-frame slot.
//!
//! - `Frame`: one decoded RGB image plus its capture sequence number.
//! - `FrameSlot`: single-slot, last-writer-wins hand-off from a reader thread to
//!   a consumer thread. No queue and no backpressure: a frame that is not picked
//!   up before the next one arrives is dropped.

use image::imageops::FilterType;
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::lock_recover;

/// A captured frame. Pixel layout is H×W×3 RGB.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Monotonic per-source sequence number, starting at 1.
    pub seq: u64,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Single-slot buffer holding the newest frame.
///
/// The internal lock only guards an `Arc` swap, so the reader never waits on
/// analysis and the consumer never sees a partially written frame.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Arc<Frame>>>,
    published: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame.
    pub fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        *lock_recover(&self.latest) = Some(frame);
        self.published.fetch_add(1, Ordering::Release);
    }

    /// Newest frame, if any was published since the last `clear`.
    /// Repeated calls may return the same frame.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        lock_recover(&self.latest).clone()
    }

    /// Number of frames published over the slot's lifetime.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        *lock_recover(&self.latest) = None;
    }
}

/// Largest size with the source aspect ratio that fits inside the display box.
///
/// Returns `None` when either size is degenerate.
pub fn fit_within(src_w: u32, src_h: u32, box_w: u32, box_h: u32) -> Option<(u32, u32)> {
    if src_w == 0 || src_h == 0 || box_w == 0 || box_h == 0 {
        return None;
    }
    let ratio_w = box_w as f64 / src_w as f64;
    let ratio_h = box_h as f64 / src_h as f64;
    let ratio = ratio_w.min(ratio_h);
    let w = ((src_w as f64 * ratio) as u32).max(1);
    let h = ((src_h as f64 * ratio) as u32).max(1);
    Some((w, h))
}

/// Resize to exactly `width`×`height`; returns a copy when already that size.
pub fn resize(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    image::imageops::resize(image, width, height, FilterType::Triangle)
}
