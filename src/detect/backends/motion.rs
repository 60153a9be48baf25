use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, DetectionResult};
use crate::frame::Frame;

const MOTION_CONFIDENCE: f32 = 0.85;

/// Model-free backend: reports one full-frame "motion" box whenever the frame
/// content differs from the previous frame.
#[derive(Default)]
pub struct MotionBackend {
    last_hash: Option<[u8; 32]>,
}

impl MotionBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn session_instance(&self) -> Option<Box<dyn DetectorBackend>> {
        Some(Box::new(Self::new()))
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();

        let motion = self.last_hash.is_some_and(|prev| prev != current_hash);

        self.last_hash = Some(current_hash);

        if motion {
            Ok(DetectionResult {
                detections: vec![Detection {
                    x1: 0.0,
                    y1: 0.0,
                    x2: frame.width.saturating_sub(1) as f32,
                    y2: frame.height.saturating_sub(1) as f32,
                    confidence: Some(MOTION_CONFIDENCE),
                    class_id: 0,
                    label: "motion".to_string(),
                }],
            })
        } else {
            Ok(DetectionResult::default())
        }
    }
}
