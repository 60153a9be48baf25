#![allow(dead_code)]

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use binwatch::config::BinwatchConfig;
use binwatch::detect::{Detection, StubBackend};
use binwatch::{
    ApiHandle, ApiServer, AppContext, BackendRegistry, DashboardSink, DashboardStatus,
    DetectionEvent, LocationProvider, LocationRecord, LocationSource,
};

pub struct FakeLocator {
    pub ip_record: Option<LocationRecord>,
    pub address: Option<String>,
}

impl FakeLocator {
    pub fn resolving() -> Self {
        Self {
            ip_record: Some(LocationRecord {
                source: LocationSource::Ip,
                latitude: Some(52.52),
                longitude: Some(13.40),
                accuracy: "City-level (~10km)".to_string(),
                address: None,
                city: Some("Berlin".to_string()),
                region: Some("Berlin".to_string()),
                country: Some("Germany".to_string()),
                ip: Some("203.0.113.20".to_string()),
                timestamp: Some("2024-05-01T10:00:00.000Z".to_string()),
            }),
            address: Some("1 Main St".to_string()),
        }
    }

    pub fn offline() -> Self {
        Self {
            ip_record: None,
            address: None,
        }
    }
}

impl LocationProvider for FakeLocator {
    fn resolve_from_ip(&self, _ip: IpAddr) -> Option<LocationRecord> {
        self.ip_record.clone()
    }

    fn resolve_address(&self, _latitude: f64, _longitude: f64) -> Option<String> {
        self.address.clone()
    }
}

#[derive(Default)]
pub struct FakeDashboard {
    pub forwarded: AtomicUsize,
    pub batches: AtomicUsize,
    pub fail_batch: bool,
}

impl DashboardSink for FakeDashboard {
    fn forward(&self, _event: &DetectionEvent) -> Result<()> {
        self.forwarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn forward_batch(&self, events: &[DetectionEvent]) -> Result<Value> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.fail_batch {
            return Err(anyhow!("dashboard offline"));
        }
        Ok(serde_json::json!({ "uploaded": events.len() }))
    }

    fn probe(&self) -> DashboardStatus {
        DashboardStatus::Disconnected {
            endpoint: None,
            response_code: None,
            error: Some("fake".to_string()),
            dashboard_url: "http://dashboard.invalid".to_string(),
        }
    }
}

pub struct TestApi {
    pub dir: tempfile::TempDir,
    pub ctx: Arc<AppContext>,
    handle: Option<ApiHandle>,
}

impl TestApi {
    pub fn start(locator: FakeLocator, dashboard: Arc<dyn DashboardSink>) -> Result<Self> {
        Self::start_with(locator, dashboard, StubBackend::new())
    }

    pub fn start_with(
        locator: FakeLocator,
        dashboard: Arc<dyn DashboardSink>,
        backend: StubBackend,
    ) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut config = BinwatchConfig::default();
        config.api_addr = "127.0.0.1:0".to_string();
        config.upload_dir = dir.path().join("uploads");
        config.ingest.camera_device = "stub://camera?frames=2".to_string();

        let mut detectors = BackendRegistry::new();
        detectors.register(backend);

        let ctx = Arc::new(AppContext::new(
            config,
            Arc::new(locator),
            dashboard,
            detectors,
        )?);
        let handle = ApiServer::new(ctx.clone()).spawn()?;
        Ok(Self {
            dir,
            ctx,
            handle: Some(handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle
            .as_ref()
            .map(|handle| handle.addr)
            .expect("api running")
    }

    pub fn get(&self, path: &str) -> Result<HttpResponse> {
        self.request("GET", path, &[], b"")
    }

    pub fn post_json(&self, path: &str, body: &str) -> Result<HttpResponse> {
        self.request(
            "POST",
            path,
            &[("Content-Type", "application/json")],
            body.as_bytes(),
        )
    }

    pub fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse> {
        let mut stream = TcpStream::connect(self.addr())?;
        stream.set_read_timeout(Some(Duration::from_secs(20)))?;
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n",
            method,
            path,
            body.len()
        );
        for (name, value) in headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        stream.write_all(head.as_bytes())?;
        stream.write_all(body)?;
        read_response(&mut stream)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.stop();
        }
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json body")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

pub fn read_response(stream: &mut TcpStream) -> Result<HttpResponse> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response without header terminator"))?;
    let headers = String::from_utf8_lossy(&raw[..split]).into_owned();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| anyhow!("response without status"))?;
    Ok(HttpResponse {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    })
}

pub fn count_parts(body: &[u8]) -> usize {
    let marker = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    body.windows(marker.len()).filter(|w| *w == marker).count()
}

pub fn overflow_box() -> Detection {
    Detection {
        x1: 4.0,
        y1: 4.0,
        x2: 30.0,
        y2: 30.0,
        confidence: Some(0.8),
        class_id: 0,
        label: "overflow".to_string(),
    }
}
