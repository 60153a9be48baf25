use anyhow::Result;

use crate::frame::Frame;
use crate::detect::result::DetectionResult;

/// Detector backend trait.
///
/// A backend wraps one object-detection model. The stream loop hands it each
/// decoded frame and burns the returned boxes into the feed, so `detect` must
/// return boxes in the pixel coordinates of the frame it was given.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Fresh instance for a single stream session.
    ///
    /// Backends whose output depends on the previous frame return one so that
    /// concurrent sessions do not see each other's frames. `None` means the
    /// shared instance serves every session.
    fn session_instance(&self) -> Option<Box<dyn DetectorBackend>> {
        None
    }
}
