//! Frame ingestion sources.
//!
//! This module provides the capture sources a camera reader thread pulls from:
//! - Synthetic `stub://` scenes (tests, demos)
//! - Local video files, network stream URLs and camera devices via FFmpeg
//!   (feature: ingest-ffmpeg)
//!
//! A source is exclusively owned by one reader thread. `read` distinguishes a
//! transient miss (`Ok(None)`) from a source that is gone for good (`Err`).

#[cfg(feature = "ingest-ffmpeg")]
pub(crate) mod ffmpeg;
pub mod synthetic;

use anyhow::Result;
use std::fmt;
use std::path::PathBuf;

use crate::frame::Frame;
use crate::PipelineError;

pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Capture source capability consumed by the reader loops.
pub trait CaptureSource: Send {
    /// Pull the next frame, blocking until one is available.
    ///
    /// `Ok(None)` is a transient miss; `Err` means the source cannot recover.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying handle. Called once by the owning reader.
    fn release(&mut self);

    /// Native frame rate, when the source knows it.
    fn fps(&self) -> Option<f64> {
        None
    }

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Owns a capture source and releases it when dropped, panics included.
pub(crate) struct OwnedSource(pub(crate) Box<dyn CaptureSource>);

impl Drop for OwnedSource {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Where a camera's frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// Local capture device by index (e.g. `0` → `/dev/video0`).
    Device(u32),
    /// Network stream (`rtsp://`, `http://`, ...).
    Url(String),
    /// Local video file.
    File(PathBuf),
    /// Synthetic scene (`stub://name?fps=..&frames=..`).
    Synthetic(String),
}

impl SourceDescriptor {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PipelineError::config("capture source is empty").into());
        }
        if raw.starts_with("stub://") {
            return Ok(SourceDescriptor::Synthetic(raw.to_string()));
        }
        if let Ok(index) = raw.parse::<u32>() {
            return Ok(SourceDescriptor::Device(index));
        }
        if raw.contains("://") {
            return Ok(SourceDescriptor::Url(raw.to_string()));
        }
        Ok(SourceDescriptor::File(PathBuf::from(raw)))
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Device(index) => write!(f, "device:{}", index),
            SourceDescriptor::Url(url) => write!(f, "{}", url),
            SourceDescriptor::File(path) => write!(f, "{}", path.display()),
            SourceDescriptor::Synthetic(url) => write!(f, "{}", url),
        }
    }
}

/// Opens capture sources. Workers re-open through this on every start.
pub trait SourceOpener: Send + Sync {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn CaptureSource>>;
}

/// Opens synthetic sources directly and everything else through FFmpeg.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultOpener;

impl SourceOpener for DefaultOpener {
    fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn CaptureSource>> {
        match descriptor {
            SourceDescriptor::Synthetic(url) => {
                let config = SyntheticConfig::from_url(url)?;
                Ok(Box::new(SyntheticSource::new(config)))
            }
            #[cfg(feature = "ingest-ffmpeg")]
            other => Ok(Box::new(ffmpeg::FfmpegSource::open(other)?)),
            #[cfg(not(feature = "ingest-ffmpeg"))]
            other => anyhow::bail!(
                "capture source {} requires the ingest-ffmpeg feature",
                other
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_source_descriptors() {
        assert_eq!(
            SourceDescriptor::parse("0").unwrap(),
            SourceDescriptor::Device(0)
        );
        assert_eq!(
            SourceDescriptor::parse("rtsp://192.168.1.203:554/stream").unwrap(),
            SourceDescriptor::Url("rtsp://192.168.1.203:554/stream".to_string())
        );
        assert_eq!(
            SourceDescriptor::parse("../people.mp4").unwrap(),
            SourceDescriptor::File(PathBuf::from("../people.mp4"))
        );
        assert_eq!(
            SourceDescriptor::parse(" stub://front ").unwrap(),
            SourceDescriptor::Synthetic("stub://front".to_string())
        );
        assert!(SourceDescriptor::parse("  ").is_err());
    }

    #[test]
    fn default_opener_opens_synthetic_sources() {
        let descriptor = SourceDescriptor::parse("stub://yard?fps=5&width=32&height=24").unwrap();
        let mut source = DefaultOpener.open(&descriptor).unwrap();
        assert_eq!(source.fps(), Some(5.0));
        let frame = source.read().unwrap().expect("synthetic frame");
        assert_eq!(frame.image.dimensions(), (32, 24));
        source.release();
    }
}
