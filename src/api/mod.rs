//! HTTP surface.
//!
//! A small blocking HTTP/1.1 server, one thread per connection, so a
//! long-running `/video_feed` stream never blocks other requests. All
//! handlers work against the shared `AppContext`.

mod http;
mod page;

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::geo::{client_ip, LocationRecord};
use crate::ingest::CAMERA_SELECTOR;
use crate::{AppContext, FRAME_BOUNDARY};
use http::{read_request, status_line, HttpRequest, RequestError, Response};

/// Form flag (and remote alias) for the phone feed.
const REMOTE_FORM_FLAG: &str = "ngrok";
const STOP_MESSAGE: &str = "Process has been Terminated";
const READ_TIMEOUT: Duration = Duration::from_secs(10);

const ROUTES: [(&str, &[&str]); 11] = [
    ("/", &["GET", "POST"]),
    ("/video_feed", &["GET"]),
    ("/location_logs", &["GET"]),
    ("/current_location", &["GET"]),
    ("/save_gps_location", &["POST"]),
    ("/gps_status", &["GET"]),
    ("/sync_to_firebase", &["POST"]),
    ("/firebase_status", &["GET"]),
    ("/stop", &["POST"]),
    ("/sessions", &["GET"]),
    ("/health", &["GET"]),
];

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Streams already running end on their own.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    ctx: Arc<AppContext>,
}

impl ApiServer {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.ctx.config.api_addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;
        std::fs::create_dir_all(&self.ctx.config.upload_dir)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = self.ctx;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, ctx, shutdown_thread) {
                log::error!("api server stopped: {}", err);
            }
        });
        log::info!("api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: Arc<AppContext>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, peer, &ctx) {
                        log::warn!("request from {} failed: {:#}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: &AppContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let request = match read_request(&mut stream, peer, ctx.config.max_request_bytes) {
        Ok(request) => request,
        Err(RequestError::TooLarge(size)) => {
            return Response::error(413, &format!("request of {} bytes is too large", size))
                .write_to(&mut stream);
        }
        Err(RequestError::Malformed(err)) => {
            Response::error(400, "malformed request").write_to(&mut stream)?;
            return Err(err);
        }
    };
    log::debug!("{} {} from {}", request.method, request.path, peer);

    if request.method == "GET" && request.path == "/video_feed" {
        return video_feed(stream, &request, ctx);
    }

    let response = route(&request, ctx);
    response.write_to(&mut stream)
}

fn route(request: &HttpRequest, ctx: &AppContext) -> Response {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => Response::html(page::render_index(None)),
        ("POST", "/") => index_post(request, ctx),
        ("GET", "/location_logs") => Response::json(200, &ctx.logger.events()),
        ("GET", "/current_location") => current_location(request, ctx),
        ("POST", "/save_gps_location") => save_gps_location(request, ctx),
        ("GET", "/gps_status") => gps_status(ctx),
        ("POST", "/sync_to_firebase") => sync_to_dashboard(ctx),
        ("GET", "/firebase_status") => Response::json(200, &ctx.dashboard.probe()),
        ("POST", "/stop") => stop(request, ctx),
        ("GET", "/sessions") => Response::json(200, &ctx.sessions.active()),
        ("GET", "/health") => Response::json(200, &json!({ "status": "ok" })),
        (method, path) => {
            let allowed = ROUTES
                .iter()
                .find(|(route, _)| *route == path)
                .map(|(_, methods)| methods.contains(&method));
            match allowed {
                Some(false) => Response::error(405, "method not allowed"),
                _ => Response::error(404, "not found"),
            }
        }
    }
}

fn requester_ip(request: &HttpRequest) -> IpAddr {
    client_ip(&request.headers, request.peer.ip())
}

fn index_post(request: &HttpRequest, ctx: &AppContext) -> Response {
    let form = match request.form() {
        Ok(form) => form,
        Err(err) => {
            log::warn!("unreadable form: {:#}", err);
            return Response::error(400, "invalid form");
        }
    };
    let flag = |name: &str| {
        form.iter()
            .any(|part| part.filename.is_none() && part.name == name && part.text() == "true")
    };

    let selector = if flag("camera") {
        Some(CAMERA_SELECTOR.to_string())
    } else if flag(REMOTE_FORM_FLAG) {
        Some(REMOTE_FORM_FLAG.to_string())
    } else if let Some(upload) = form
        .iter()
        .find(|part| part.name == "file" && part.filename.is_some())
    {
        let filename = upload.filename.as_deref().unwrap_or_default();
        match save_upload(&ctx.config.upload_dir, filename, &upload.data) {
            Ok(path) => Some(path.display().to_string()),
            Err(err) => {
                log::warn!("failed to save upload '{}': {:#}", filename, err);
                return Response::error(400, "invalid upload");
            }
        }
    } else {
        None
    };
    Response::html(page::render_index(selector.as_deref()))
}

/// Store an upload under `dir`, keeping only the base name of the client's file name.
fn save_upload(dir: &Path, filename: &str, data: &[u8]) -> Result<PathBuf> {
    let base = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(anyhow!("upload has no usable file name"));
    }
    let path = dir.join(base);
    std::fs::write(&path, data)?;
    log::info!("saved upload {} ({} bytes)", path.display(), data.len());
    Ok(path)
}

fn video_feed(mut stream: TcpStream, request: &HttpRequest, ctx: &AppContext) -> Result<()> {
    let Some(selector) = request.query_param("file").filter(|s| !s.trim().is_empty()) else {
        return Response::error(400, "missing file parameter").write_to(&mut stream);
    };
    let stream_loop = match ctx.stream_loop() {
        Ok(stream_loop) => stream_loop,
        Err(err) => {
            Response::error(500, "no detector available").write_to(&mut stream)?;
            return Err(err);
        }
    };

    let guard = ctx.sessions.open(selector);
    let session = guard.session();
    let header = format!(
        "{}\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nX-Stream-Session: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line(200),
        FRAME_BOUNDARY,
        session.id()
    );
    std::io::Write::write_all(&mut stream, header.as_bytes())?;

    let state = stream_loop.run(session, Some(requester_ip(request)), &mut stream);
    log::info!(
        "session {} ended in state {:?} after {} frames",
        session.id(),
        state,
        session.frames_emitted()
    );
    Ok(())
}

fn current_location(request: &HttpRequest, ctx: &AppContext) -> Response {
    if let Some(fix) = ctx.logger.gps() {
        return Response::json(200, &fix);
    }
    match ctx.locator.resolve_from_ip(requester_ip(request)) {
        Some(record) => Response::json(200, &record),
        None => Response::json(200, &json!({ "error": "Location not found" })),
    }
}

fn save_gps_location(request: &HttpRequest, ctx: &AppContext) -> Response {
    let body: Value = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(err) => {
            log::warn!("error saving GPS location: {}", err);
            return Response::error(500, "Failed to save location");
        }
    };
    let coordinate = |key: &str, limit: f64| {
        body.get(key)
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite() && v.abs() <= limit)
    };
    let (Some(latitude), Some(longitude)) = (coordinate("latitude", 90.0), coordinate("longitude", 180.0))
    else {
        return Response::error(400, "Invalid coordinates");
    };
    let accuracy = body.get("accuracy").and_then(Value::as_f64);
    let timestamp = match body.get("timestamp") {
        Some(Value::String(ts)) => ts.clone(),
        Some(Value::Number(ts)) => ts.to_string(),
        _ => crate::now_iso8601(),
    };

    let address = ctx.locator.resolve_address(latitude, longitude);
    ctx.logger.set_gps(LocationRecord::gps(
        latitude,
        longitude,
        accuracy,
        address.clone(),
        timestamp,
    ));
    log::info!(
        "GPS location saved: {}, {} ({})",
        latitude,
        longitude,
        accuracy.map_or_else(|| "accuracy unknown".to_string(), |m| format!("±{:.0}m", m))
    );
    Response::json(
        200,
        &json!({
            "status": "success",
            "message": "GPS location saved",
            "address": address,
        }),
    )
}

#[derive(Serialize)]
struct GpsStatus {
    has_gps: bool,
    location: Option<LocationRecord>,
}

fn gps_status(ctx: &AppContext) -> Response {
    let location = ctx.logger.gps();
    Response::json(
        200,
        &GpsStatus {
            has_gps: location.is_some(),
            location,
        },
    )
}

fn sync_to_dashboard(ctx: &AppContext) -> Response {
    let events = ctx.logger.events();
    if events.is_empty() {
        return Response::error(400, "No detections to sync");
    }
    match ctx.dashboard.forward_batch(&events) {
        Ok(details) => Response::json(
            200,
            &json!({
                "success": true,
                "message": "Detections synced to Firebase",
                "details": details,
            }),
        ),
        Err(err) => {
            log::warn!("batch sync of {} events failed: {:#}", events.len(), err);
            Response::json(
                500,
                &json!({ "success": false, "error": "Failed to sync detections" }),
            )
        }
    }
}

fn stop(request: &HttpRequest, ctx: &AppContext) -> Response {
    match request.query_param("session") {
        Some(id) => {
            if !ctx.sessions.stop(id) {
                return Response::error(404, "session not found");
            }
            log::info!("stop requested for session {}", id);
        }
        None => {
            let count = ctx.sessions.stop_all();
            log::info!("stop requested for {} active sessions", count);
        }
    }
    Response::text(200, STOP_MESSAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_keeps_only_base_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = save_upload(dir.path(), "../../etc/clip.mp4", b"data")?;
        assert_eq!(path, dir.path().join("clip.mp4"));
        let path = save_upload(dir.path(), "C:\\Users\\me\\bin.jpg", b"data")?;
        assert_eq!(path, dir.path().join("bin.jpg"));
        assert!(save_upload(dir.path(), "..", b"data").is_err());
        assert!(save_upload(dir.path(), "", b"data").is_err());
        Ok(())
    }
}
