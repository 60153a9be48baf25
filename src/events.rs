//! Detection events and the bounded in-memory log that holds them.

use serde::Serialize;
use std::collections::VecDeque;

use crate::geo::LocationRecord;

/// One sampled detection frame with the location it was attributed to.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub detection_count: u32,
    /// Per-box confidences in model order; empty when the model exposes none.
    pub confidence_scores: Vec<f32>,
    pub location: LocationRecord,
    pub timestamp: String,
}

/// Insertion-ordered log that evicts its oldest entry once full.
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<DetectionEvent>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: DetectionEvent) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<DetectionEvent> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
