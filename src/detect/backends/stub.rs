use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};
use crate::frame::Frame;

/// Scripted backend for tests and demos.
///
/// Replays a fixed list of per-frame detections, wrapping around at the end.
/// With an empty script every frame comes back without detections.
pub struct StubBackend {
    script: Vec<Vec<Detection>>,
    cursor: usize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Vec<Detection>>) -> Self {
        Self { script, cursor: 0 }
    }

    /// Every frame yields the same detections.
    pub fn constant(detections: Vec<Detection>) -> Self {
        Self::scripted(vec![detections])
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<DetectionResult> {
        if self.script.is_empty() {
            return Ok(DetectionResult::default());
        }
        let detections = self.script[self.cursor % self.script.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        Ok(DetectionResult { detections })
    }
}
