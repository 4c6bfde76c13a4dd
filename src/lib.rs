//! Watchpost multi-camera analysis pipeline.
//!
//! Each configured camera is driven by a [`StreamWorker`]: a reader thread that keeps
//! the newest captured frame in a single-slot buffer, and a consumer thread that ticks
//! the camera's [`CameraStream`] at a fixed period. Every `P`-th tick the stream runs
//! the detection backend selected by its mode; the cached [`Overlay`] is redrawn on
//! every tick. A separate [`PresenceMonitor`] samples a dedicated security source in
//! bursts and appends a line to the event log whenever presence flips.
//!
//! # Module Structure
//!
//! - `region`: named polygon regions and containment tests
//! - `frame`: frames, the latest-frame slot, aspect-preserving resize
//! - `detect`: detector backend capability, registry, labels, built-in backends
//! - `ingest`: capture sources (synthetic `stub://`, FFmpeg)
//! - `camera` / `render`: per-tick mode dispatch and overlay drawing
//! - `worker` / `presence`: background loops
//! - `supervisor`: composition root and control surface

use anyhow::{anyhow, Result};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

pub mod camera;
pub mod config;
pub mod detect;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod presence;
pub mod region;
pub mod render;
pub mod signal;
pub mod supervisor;
pub mod worker;

pub use camera::{
    AnnotatedFrame, CameraReconfig, CameraStream, Detectors, Mode, StreamSettings,
    DEFAULT_ANALYSIS_PERIOD,
};
pub use detect::{
    BackendRegistry, BoundingBox, ClassAllowList, Detection, DetectionCapability,
    DetectionResult, DetectorBackend, LabelMap, SharedDetector,
};
pub use events::{EventLog, EventLogEntry};
pub use frame::{Frame, FrameSlot};
pub use ingest::{CaptureSource, DefaultOpener, SourceDescriptor, SourceOpener};
pub use presence::{PresenceMonitor, PresenceSettings, PresenceState, PresenceTracker};
pub use region::{Point, Region, RegionSet};
pub use render::{Annotation, ColorPolicy, Overlay, Palette};
pub use supervisor::{BorderState, CameraStatus, Fault, FrameSink, Supervisor};
pub use worker::{StreamWorker, WorkerSettings};

// -------------------- Pipeline Errors --------------------

/// Error taxonomy shared by the loops and the supervisor.
///
/// Carried inside `anyhow::Error`; callers that need to branch on the kind use
/// `err.downcast_ref::<PipelineError>()`.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineError {
    /// A single read or detection failed. The tick or cycle is abandoned.
    TransientFrame { camera: usize, reason: String },
    /// The capture source cannot produce frames any more.
    SourceUnrecoverable { camera: usize, reason: String },
    /// A mutation request was rejected before touching any state.
    Configuration(String),
    /// A stop request did not observe loop exit in time.
    ShutdownTimeout {
        component: String,
        waited: Duration,
    },
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Configuration(message.into())
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::TransientFrame { camera, reason } => {
                write!(f, "camera {}: transient frame error: {}", camera, reason)
            }
            PipelineError::SourceUnrecoverable { camera, reason } => {
                write!(f, "camera {}: source unrecoverable: {}", camera, reason)
            }
            PipelineError::Configuration(message) => {
                write!(f, "configuration rejected: {}", message)
            }
            PipelineError::ShutdownTimeout { component, waited } => write!(
                f,
                "{} did not stop within {}ms",
                component,
                waited.as_millis()
            ),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Returns the pipeline error kind carried by `err`, if any.
pub fn pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    err.downcast_ref::<PipelineError>()
}

// -------------------- Region Name Discipline --------------------

/// A region name is a local identifier: `zone:` followed by 1..64 of `[a-z0-9_-]`.
pub fn validate_region_name(name: &str) -> Result<()> {
    static REGION_NAME_RE: OnceLock<std::result::Result<regex::Regex, regex::Error>> =
        OnceLock::new();
    let re = REGION_NAME_RE
        .get_or_init(|| regex::Regex::new(r"^zone:[a-z0-9_-]{1,64}$"))
        .as_ref()
        .map_err(|e| anyhow!("region name pattern failed to compile: {}", e))?;

    if !re.is_match(&name.to_lowercase()) {
        return Err(PipelineError::config(format!(
            "region name '{}' must match ^zone:[a-z0-9_-]{{1,64}}$",
            name
        ))
        .into());
    }
    Ok(())
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// A panicking tick must not leave its camera permanently unusable for the
/// supervisor or a restarted worker.
pub(crate) fn lock_recover<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
