use anyhow::Result;
use image::RgbImage;

use crate::detect::result::DetectionResult;

/// Detection capabilities a backend may offer.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DetectionCapability {
    Motion,
    ObjectDetection,
}

/// Detector backend trait.
///
/// Backends are invoked synchronously from camera consumer threads and from the
/// presence monitor. They are shared behind a `Mutex`, so `detect` may keep
/// per-stream state (e.g. the previous frame for motion).
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a frame. Box coordinates are in `frame` pixels.
    fn detect(&mut self, frame: &RgbImage) -> Result<DetectionResult>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
