mod backend;
pub mod backends;
mod labels;
mod registry;
mod result;

pub use backend::{DetectionCapability, DetectorBackend};
pub use backends::{CpuMotionBackend, StubBackend};
pub use labels::{ClassAllowList, LabelMap, PERSON_CLASS_ID};
pub use registry::{BackendRegistry, SharedDetector};
pub use result::{BoundingBox, Detection, DetectionResult};
