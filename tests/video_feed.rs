mod common;

use anyhow::Result;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use binwatch::detect::StubBackend;
use common::{count_parts, overflow_box, read_response, FakeDashboard, FakeLocator, TestApi};

fn open_feed(api: &TestApi, selector: &str) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(api.addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(20)))?;
    write!(
        stream,
        "GET /video_feed?file={} HTTP/1.1\r\nHost: localhost\r\n\r\n",
        selector
    )?;
    Ok(stream)
}

#[test]
fn feed_streams_multipart_parts_until_source_ends() -> Result<()> {
    let api = TestApi::start(FakeLocator::resolving(), Arc::new(FakeDashboard::default()))?;
    let mut stream = open_feed(&api, "stub%3A%2F%2Fclip%3Fframes%3D3")?;
    let response = read_response(&mut stream)?;

    assert_eq!(response.status, 200);
    assert_eq!(
        response.header("content-type").as_deref(),
        Some("multipart/x-mixed-replace; boundary=frame")
    );
    assert_eq!(
        response.header("x-stream-session").map(|id| id.len()),
        Some(16)
    );
    assert_eq!(count_parts(&response.body), 3);
    // the session is gone once the stream ends
    assert!(api.ctx.sessions.is_empty());
    Ok(())
}

#[test]
fn camera_selector_uses_configured_device() -> Result<()> {
    let api = TestApi::start(FakeLocator::resolving(), Arc::new(FakeDashboard::default()))?;
    let mut stream = open_feed(&api, "camera")?;
    let response = read_response(&mut stream)?;
    assert_eq!(count_parts(&response.body), 2);
    Ok(())
}

#[test]
fn unopenable_source_ends_without_parts() -> Result<()> {
    let api = TestApi::start(FakeLocator::resolving(), Arc::new(FakeDashboard::default()))?;
    let mut stream = open_feed(&api, "%2Fdefinitely%2Fmissing.jpg")?;
    let response = read_response(&mut stream)?;
    assert_eq!(response.status, 200);
    assert_eq!(count_parts(&response.body), 0);

    // the server keeps serving
    assert_eq!(api.get("/health")?.status, 200);
    Ok(())
}

#[test]
fn missing_file_parameter_is_rejected() -> Result<()> {
    let api = TestApi::start(FakeLocator::resolving(), Arc::new(FakeDashboard::default()))?;
    assert_eq!(api.get("/video_feed")?.status, 400);
    Ok(())
}

#[test]
fn detections_are_sampled_into_the_log() -> Result<()> {
    let dashboard = Arc::new(FakeDashboard::default());
    let api = TestApi::start_with(
        FakeLocator::resolving(),
        dashboard,
        StubBackend::constant(vec![overflow_box()]),
    )?;
    let mut stream = open_feed(&api, "stub%3A%2F%2Fbin%3Fframes%3D61")?;
    let response = read_response(&mut stream)?;
    assert_eq!(count_parts(&response.body), 61);

    let logs = api.get("/location_logs")?.json();
    let logs = logs.as_array().cloned().unwrap_or_default();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0]["detection_count"], 1);
    assert_eq!(logs[0]["confidence_scores"][0].as_f64().map(|c| (c * 10.0).round()), Some(8.0));
    Ok(())
}

#[test]
fn stop_ends_only_the_named_session() -> Result<()> {
    let api = TestApi::start(FakeLocator::resolving(), Arc::new(FakeDashboard::default()))?;
    let addr = api.addr();

    let first = thread::spawn(move || -> Result<usize> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(20)))?;
        write!(stream, "GET /video_feed?file=stub%3A%2F%2Fone HTTP/1.1\r\n\r\n")?;
        Ok(count_parts(&read_response(&mut stream)?.body))
    });
    let second = thread::spawn(move || -> Result<usize> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(20)))?;
        write!(stream, "GET /video_feed?file=stub%3A%2F%2Ftwo HTTP/1.1\r\n\r\n")?;
        Ok(count_parts(&read_response(&mut stream)?.body))
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    let sessions = loop {
        let sessions = api.get("/sessions")?.json();
        if sessions.as_array().map(Vec::len) == Some(2) {
            break sessions;
        }
        assert!(Instant::now() < deadline, "sessions never started");
        thread::sleep(Duration::from_millis(20));
    };
    let first_id = sessions
        .as_array()
        .and_then(|all| all.iter().find(|s| s["source"] == "stub://one"))
        .and_then(|s| s["id"].as_str())
        .expect("first session")
        .to_string();

    let stopped = api.request("POST", &format!("/stop?session={}", first_id), &[], b"")?;
    assert_eq!(stopped.status, 200);
    assert_eq!(stopped.text(), "Process has been Terminated");
    assert!(first.join().expect("first stream thread")? >= 1);

    let remaining = api.get("/sessions")?.json();
    assert_eq!(remaining.as_array().map(Vec::len), Some(1));
    assert_eq!(remaining[0]["source"], "stub://two");
    assert_eq!(remaining[0]["state"], "streaming");

    assert_eq!(api.request("POST", "/stop", &[], b"")?.status, 200);
    assert!(second.join().expect("second stream thread")? >= 1);
    assert_eq!(
        api.request("POST", "/stop?session=unknown", &[], b"")?.status,
        404
    );
    Ok(())
}
