//! Forwarding detection events to the remote dashboard.
//!
//! The dashboard exposes a single upload endpoint that accepts either one
//! event object or an array of them. Uploads are fire-and-forget: callers log
//! failures and nothing is retried.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::config::DashboardSettings;
use crate::events::DetectionEvent;
use crate::geo::{LocationRecord, LocationSource};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);
const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Reachability of the dashboard, as reported by `/firebase_status`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DashboardStatus {
    Connected {
        dashboard_url: String,
        endpoint: String,
        response_code: u16,
    },
    Disconnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_code: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        dashboard_url: String,
    },
}

impl DashboardStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

pub trait DashboardSink: Send + Sync {
    /// Upload a single event.
    fn forward(&self, event: &DetectionEvent) -> Result<()>;

    /// Upload a batch; returns the `details` object of the dashboard's reply.
    fn forward_batch(&self, events: &[DetectionEvent]) -> Result<Value>;

    fn probe(&self) -> DashboardStatus;
}

pub struct DashboardClient {
    settings: DashboardSettings,
    endpoint: String,
    probe_agent: ureq::Agent,
    upload_agent: ureq::Agent,
    batch_agent: ureq::Agent,
}

impl DashboardClient {
    pub fn new(settings: DashboardSettings) -> Self {
        let agent = |timeout: Duration| ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            endpoint: settings.upload_endpoint(),
            settings,
            probe_agent: agent(PROBE_TIMEOUT),
            upload_agent: agent(UPLOAD_TIMEOUT),
            batch_agent: agent(BATCH_TIMEOUT),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post(&self, agent: &ureq::Agent, body: Value) -> Result<Value> {
        let mut request = agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.settings.api_key {
            request = request.set("Authorization", &format!("Bearer {}", key));
        }
        let response = request
            .send_json(body)
            .with_context(|| format!("post to {}", self.endpoint))?;
        if response.status() != 200 {
            return Err(anyhow!(
                "dashboard answered {} {}",
                response.status(),
                response.status_text()
            ));
        }
        response.into_json().context("decode dashboard reply")
    }
}

impl DashboardSink for DashboardClient {
    fn forward(&self, event: &DetectionEvent) -> Result<()> {
        let reply = self.post(
            &self.upload_agent,
            upload_payload(event, &self.settings.model_version),
        )?;
        log::info!(
            "uploaded detection to dashboard: {}",
            reply
                .get("documentId")
                .and_then(Value::as_str)
                .unwrap_or("N/A")
        );
        Ok(())
    }

    fn forward_batch(&self, events: &[DetectionEvent]) -> Result<Value> {
        let batch = events
            .iter()
            .map(|event| upload_payload(event, &self.settings.model_version))
            .collect();
        let reply = self.post(&self.batch_agent, Value::Array(batch))?;
        log::info!(
            "batch upload of {} events: {}",
            events.len(),
            reply.get("message").and_then(Value::as_str).unwrap_or("N/A")
        );
        Ok(reply
            .get("details")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    fn probe(&self) -> DashboardStatus {
        let code = match self.probe_agent.get(&self.endpoint).call() {
            Ok(response) => response.status(),
            Err(ureq::Error::Status(code, _)) => code,
            Err(err) => {
                return DashboardStatus::Disconnected {
                    endpoint: None,
                    response_code: None,
                    error: Some(err.to_string()),
                    dashboard_url: self.settings.url.clone(),
                }
            }
        };
        // GET on an upload-only route answering 404 still proves reachability
        if code == 200 || code == 404 {
            DashboardStatus::Connected {
                dashboard_url: self.settings.url.clone(),
                endpoint: self.endpoint.clone(),
                response_code: code,
            }
        } else {
            DashboardStatus::Disconnected {
                endpoint: Some(self.endpoint.clone()),
                response_code: Some(code),
                error: None,
                dashboard_url: self.settings.url.clone(),
            }
        }
    }
}

/// Wire form of one event.
pub fn upload_payload(event: &DetectionEvent, model_version: &str) -> Value {
    json!({
        "detection_count": event.detection_count,
        "confidence_scores": event.confidence_scores,
        "location": location_payload(&event.location),
        "timestamp": event.timestamp,
        "model_version": model_version,
    })
}

fn location_payload(location: &LocationRecord) -> Value {
    let source = match location.source {
        LocationSource::Gps => "GPS",
        LocationSource::Ip => "IP",
    };
    let mut payload = json!({
        "source": source,
        "latitude": location.latitude.unwrap_or(0.0),
        "longitude": location.longitude.unwrap_or(0.0),
        "accuracy": location.accuracy,
        "address": location.address.as_deref().unwrap_or("Unknown"),
        "timestamp": location.timestamp.clone().unwrap_or_else(crate::now_iso8601),
    });
    if let Value::Object(fields) = &mut payload {
        for (key, value) in [
            ("city", &location.city),
            ("region", &location.region),
            ("country", &location.country),
            ("ip", &location.ip),
        ] {
            if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                fields.insert(key.to_string(), Value::String(value.clone()));
            }
        }
    }
    payload
}
