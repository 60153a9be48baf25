//! binwatch
//!
//! Streams a video source through an object detector, overlays the boxes for a
//! browser, and logs sampled detection events with an approximate location.
//!
//! # Module Structure
//!
//! - `frame`: RGB frames, annotation and JPEG encoding
//! - `ingest`: capture handles (camera, files, MJPEG feeds, synthetic)
//! - `detect`: detector backends and the backend registry
//! - `geo`: location records and the IP / reverse-geocoding resolver
//! - `events`: detection events and the bounded event log
//! - `dashboard`: forwarding events to the external dashboard
//! - `logger`: the detection logger (location policy + log + forwarding)
//! - `stream`: per-session frame stream loop and the session registry
//! - `api`: the HTTP surface
//! - `config`: file + environment configuration

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{SecondsFormat, Utc};

pub mod api;
pub mod config;
pub mod dashboard;
pub mod detect;
pub mod events;
pub mod frame;
pub mod geo;
pub mod ingest;
pub mod logger;
pub mod stream;

pub use api::{ApiHandle, ApiServer};
pub use dashboard::{DashboardClient, DashboardSink, DashboardStatus};
pub use detect::{BackendRegistry, Detection, DetectionResult, DetectorBackend};
pub use events::{DetectionEvent, EventLog};
pub use frame::{Annotator, Frame};
pub use geo::{GpsSlot, HttpLocationResolver, LocationProvider, LocationRecord, LocationSource};
pub use ingest::{Capture, IngestSettings, SourceSelector};
pub use logger::{DetectionLogger, DetectionRecorder};
pub use stream::{
    SessionContext, SessionGuard, SessionRegistry, SessionSummary, StreamLoop, StreamState,
};

/// Multipart boundary used by the video feed.
pub const FRAME_BOUNDARY: &str = "frame";

/// Current time as an ISO-8601 string (UTC, millisecond precision).
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Everything a request handler needs, owned in one place.
///
/// There are no process-wide singletons: the GPS slot, the event log and the
/// stream sessions all hang off this context.
pub struct AppContext {
    pub config: config::BinwatchConfig,
    pub logger: Arc<DetectionLogger>,
    pub locator: Arc<dyn LocationProvider>,
    pub dashboard: Arc<dyn DashboardSink>,
    pub detectors: Arc<BackendRegistry>,
    pub sessions: SessionRegistry,
    pub annotator: Arc<Annotator>,
}

impl AppContext {
    /// Wire the application from its external collaborators.
    pub fn new(
        config: config::BinwatchConfig,
        locator: Arc<dyn LocationProvider>,
        dashboard: Arc<dyn DashboardSink>,
        detectors: BackendRegistry,
    ) -> Result<Self> {
        let annotator = Annotator::from_settings(&config.render)?;
        let logger = DetectionLogger::new(
            config.stream.log_capacity,
            Arc::new(GpsSlot::default()),
            locator.clone(),
            dashboard.clone(),
        );
        Ok(Self {
            config,
            logger: Arc::new(logger),
            locator,
            dashboard,
            detectors: Arc::new(detectors),
            sessions: SessionRegistry::new(),
            annotator: Arc::new(annotator),
        })
    }

    /// Build a stream loop for one session, bound to the default detector.
    pub fn stream_loop(&self) -> Result<StreamLoop> {
        let detector = self
            .detectors
            .default_backend()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        Ok(StreamLoop::new(
            detector,
            self.logger.clone(),
            self.annotator.clone(),
            self.config.ingest.clone(),
            self.config.stream.sample_every,
        ))
    }
}
