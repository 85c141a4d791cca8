mod backend;
mod backends;
mod filter;
mod registry;
mod result;

pub use backend::{CapturedImage, DetectorBackend};
pub use backends::{StubBackend, TractConfig};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use filter::{filter_detections, non_max_suppression, FilterConfig};
pub use registry::{BackendFactory, BackendRegistry};
pub use result::{BoundingBox, Detection, DetectionResult, DetectionSummary};
