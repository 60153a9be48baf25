mod backend;
mod backends;
mod labels;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{MotionBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::{TractBackend, YoloParams};
pub use labels::LabelMap;
pub use registry::{BackendRegistry, SharedBackend};
pub use result::{Detection, DetectionResult};
