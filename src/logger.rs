//! Detection logger: attaches a location to sampled detections, keeps them in
//! the bounded event log and forwards each one to the dashboard.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dashboard::DashboardSink;
use crate::events::{DetectionEvent, EventLog};
use crate::geo::{local_ip, GpsSlot, LocationProvider, LocationRecord, LocationSource};

/// Sink for sampled detection frames.
pub trait DetectionRecorder: Send + Sync {
    fn record(
        &self,
        detection_count: u32,
        confidence_scores: Vec<f32>,
        client_ip: Option<IpAddr>,
    ) -> Option<DetectionEvent>;
}

pub struct DetectionLogger {
    log: Mutex<EventLog>,
    gps: Arc<GpsSlot>,
    locator: Arc<dyn LocationProvider>,
    dashboard: Arc<dyn DashboardSink>,
}

impl DetectionLogger {
    pub fn new(
        capacity: usize,
        gps: Arc<GpsSlot>,
        locator: Arc<dyn LocationProvider>,
        dashboard: Arc<dyn DashboardSink>,
    ) -> Self {
        Self {
            log: Mutex::new(EventLog::new(capacity)),
            gps,
            locator,
            dashboard,
        }
    }

    /// Log one sampled detection frame.
    ///
    /// A stored GPS fix wins over the client address. When neither yields a
    /// location the event is dropped and nothing is forwarded.
    pub fn record(
        &self,
        detection_count: u32,
        confidence_scores: Vec<f32>,
        client_ip: Option<IpAddr>,
    ) -> Option<DetectionEvent> {
        let location = match self.gps.get() {
            Some(mut fix) => {
                fix.source = LocationSource::Gps;
                fix
            }
            None => {
                let ip = client_ip.unwrap_or_else(local_ip);
                match self.locator.resolve_from_ip(ip) {
                    Some(record) => record,
                    None => {
                        log::warn!(
                            "dropping detection event ({} objects): no location for {}",
                            detection_count,
                            ip
                        );
                        return None;
                    }
                }
            }
        };

        let event = DetectionEvent {
            detection_count,
            confidence_scores,
            location,
            timestamp: crate::now_iso8601(),
        };
        self.lock_log().push(event.clone());
        log::info!(
            "logged detection event: {} objects via {:?}",
            event.detection_count,
            event.location.source
        );

        if let Err(err) = self.dashboard.forward(&event) {
            log::warn!("dashboard upload failed: {:#}", err);
        }
        Some(event)
    }

    /// Snapshot of the event log, oldest first.
    pub fn events(&self) -> Vec<DetectionEvent> {
        self.lock_log().snapshot()
    }

    pub fn set_gps(&self, record: LocationRecord) {
        self.gps.set(record);
    }

    pub fn gps(&self) -> Option<LocationRecord> {
        self.gps.get()
    }

    pub fn gps_slot(&self) -> &Arc<GpsSlot> {
        &self.gps
    }

    fn lock_log(&self) -> MutexGuard<'_, EventLog> {
        match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DetectionRecorder for DetectionLogger {
    fn record(
        &self,
        detection_count: u32,
        confidence_scores: Vec<f32>,
        client_ip: Option<IpAddr>,
    ) -> Option<DetectionEvent> {
        DetectionLogger::record(self, detection_count, confidence_scores, client_ip)
    }
}
