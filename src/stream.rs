//! Frame stream sessions.
//!
//! Each `/video_feed` request runs one `StreamLoop` on its connection thread:
//! open the selected source, run detection on every frame, sample frames with
//! detections into the detection logger, and write annotated JPEGs as
//! `multipart/x-mixed-replace` parts.
//!
//! Sessions are tracked in the `SessionRegistry`. Every session owns its stop
//! flag and counters, so stopping or sampling one stream never affects another.

use rand::RngCore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::detect::{DetectionResult, DetectorBackend, SharedBackend};
use crate::frame::{Annotator, Frame};
use crate::ingest::{IngestSettings, SourceSelector};
use crate::logger::DetectionRecorder;
use crate::FRAME_BOUNDARY;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Opening,
    Streaming,
    Closed,
    Failed,
}

/// Per-session state shared between the stream thread and control requests.
#[derive(Debug)]
pub struct SessionContext {
    id: String,
    source: String,
    stop: AtomicBool,
    detection_frames: AtomicU64,
    frames_emitted: AtomicU64,
    state: Mutex<StreamState>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub source: String,
    pub state: StreamState,
    pub frames_emitted: u64,
    pub detection_frames: u64,
}

impl SessionContext {
    pub fn new(id: String, source: &str) -> Self {
        Self {
            id,
            source: source.to_string(),
            stop: AtomicBool::new(false),
            detection_frames: AtomicU64::new(0),
            frames_emitted: AtomicU64::new(0),
            state: Mutex::new(StreamState::Opening),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The raw selector the session was started with.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> StreamState {
        *self.lock_state()
    }

    fn set_state(&self, state: StreamState) {
        *self.lock_state() = state;
    }

    /// Frames that carried at least one detection.
    pub fn detection_frames(&self) -> u64 {
        self.detection_frames.load(Ordering::SeqCst)
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            source: self.source.clone(),
            state: self.state(),
            frames_emitted: self.frames_emitted(),
            detection_frames: self.detection_frames(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Active stream sessions keyed by session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<String, Arc<SessionContext>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: &str) -> Arc<SessionContext> {
        let mut sessions = self.lock();
        let id = loop {
            let id = new_session_id();
            if !sessions.contains_key(&id) {
                break id;
            }
        };
        let session = Arc::new(SessionContext::new(id.clone(), source));
        sessions.insert(id, session.clone());
        session
    }

    /// Register a session that unregisters itself when the guard drops.
    pub fn open(&self, source: &str) -> SessionGuard<'_> {
        SessionGuard {
            session: self.register(source),
            registry: self,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionContext>> {
        self.lock().get(id).cloned()
    }

    /// Ask one session to stop. Returns false for unknown ids.
    pub fn stop(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                session.request_stop();
                true
            }
            None => false,
        }
    }

    /// Ask every active session to stop; returns how many were signalled.
    pub fn stop_all(&self) -> usize {
        let sessions = self.lock();
        for session in sessions.values() {
            session.request_stop();
        }
        sessions.len()
    }

    pub fn active(&self) -> Vec<SessionSummary> {
        self.lock().values().map(|s| s.summary()).collect()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SessionContext>> {
        self.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<SessionContext>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct SessionGuard<'a> {
    session: Arc<SessionContext>,
    registry: &'a SessionRegistry,
}

impl SessionGuard<'_> {
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.session.id());
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Write one multipart part carrying a JPEG.
pub fn write_part<W: Write>(out: &mut W, jpeg: &[u8]) -> io::Result<()> {
    write!(
        out,
        "--{}\r\nContent-Type: image/jpeg\r\n\r\n",
        FRAME_BOUNDARY
    )?;
    out.write_all(jpeg)?;
    out.write_all(b"\r\n")?;
    out.flush()
}

pub struct StreamLoop {
    detector: SharedBackend,
    recorder: Arc<dyn DetectionRecorder>,
    annotator: Arc<Annotator>,
    ingest: IngestSettings,
    sample_every: u64,
}

impl StreamLoop {
    pub fn new(
        detector: SharedBackend,
        recorder: Arc<dyn DetectionRecorder>,
        annotator: Arc<Annotator>,
        ingest: IngestSettings,
        sample_every: u64,
    ) -> Self {
        Self {
            detector,
            recorder,
            annotator,
            ingest,
            sample_every: sample_every.max(1),
        }
    }

    /// Stream `session`'s source into `out` until the source ends, the
    /// session is stopped or the client goes away. Returns the final state.
    pub fn run<W: Write>(
        &self,
        session: &SessionContext,
        client_ip: Option<IpAddr>,
        out: &mut W,
    ) -> StreamState {
        let selector = SourceSelector::parse(session.source(), &self.ingest);
        let mut capture = match selector.open() {
            Ok(capture) => capture,
            Err(err) => {
                log::warn!("session {}: cannot open {}: {:#}", session.id(), selector, err);
                session.set_state(StreamState::Failed);
                return StreamState::Failed;
            }
        };
        session.set_state(StreamState::Streaming);
        log::info!("session {}: streaming {}", session.id(), selector);
        let mut own_detector = self.session_detector();

        while capture.is_open() {
            let frame = match capture.read_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    log::info!("session {}: source ended: {:#}", session.id(), err);
                    break;
                }
            };

            let result = self.detect(session, own_detector.as_mut(), &frame);
            if !result.is_empty() {
                self.sample(session, &result, client_ip);
            }

            match self.annotator.render(&frame, &result) {
                Ok(jpeg) => {
                    if let Err(err) = write_part(out, &jpeg) {
                        log::info!("session {}: client disconnected: {}", session.id(), err);
                        break;
                    }
                    session.frames_emitted.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    log::warn!("session {}: failed to render frame: {:#}", session.id(), err);
                }
            }

            if session.stop_requested() {
                log::info!("session {}: stop requested", session.id());
                break;
            }
        }

        let stats = capture.stats();
        log::info!(
            "session {}: closed after {} frames from {}",
            session.id(),
            stats.frames_captured,
            stats.source
        );
        session.set_state(StreamState::Closed);
        StreamState::Closed
    }

    /// A private backend instance when the shared one keeps per-stream state.
    fn session_detector(&self) -> Option<Box<dyn DetectorBackend>> {
        match self.detector.lock() {
            Ok(backend) => backend.session_instance(),
            Err(poisoned) => poisoned.into_inner().session_instance(),
        }
    }

    fn detect(
        &self,
        session: &SessionContext,
        own: Option<&mut Box<dyn DetectorBackend>>,
        frame: &Frame,
    ) -> DetectionResult {
        let outcome = match own {
            Some(backend) => backend.detect(frame),
            None => match self.detector.lock() {
                Ok(mut backend) => backend.detect(frame),
                Err(_) => Err(anyhow::anyhow!("detector lock poisoned")),
            },
        };
        outcome.unwrap_or_else(|err| {
            log::warn!("session {}: detection failed: {:#}", session.id(), err);
            DetectionResult::default()
        })
    }

    /// Only frames with detections advance the counter; every Nth one is recorded.
    fn sample(&self, session: &SessionContext, result: &DetectionResult, client_ip: Option<IpAddr>) {
        let counter = session.detection_frames.fetch_add(1, Ordering::SeqCst) + 1;
        if counter % self.sample_every == 0 {
            let count = u32::try_from(result.count()).unwrap_or(u32::MAX);
            self.recorder
                .record(count, result.confidence_scores(), client_ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, MotionBackend, StubBackend};
    use crate::events::DetectionEvent;
    use anyhow::Result;

    #[derive(Default)]
    struct CountingRecorder {
        calls: Mutex<Vec<(u32, Vec<f32>)>>,
    }

    impl DetectionRecorder for CountingRecorder {
        fn record(
            &self,
            detection_count: u32,
            confidence_scores: Vec<f32>,
            _client_ip: Option<IpAddr>,
        ) -> Option<DetectionEvent> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((detection_count, confidence_scores));
            None
        }
    }

    struct FailingBackend;

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<DetectionResult> {
            Err(anyhow::anyhow!("model crashed"))
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn hit() -> Detection {
        Detection {
            x1: 2.0,
            y1: 2.0,
            x2: 20.0,
            y2: 20.0,
            confidence: Some(0.9),
            class_id: 0,
            label: "overflow".to_string(),
        }
    }

    fn stream_loop(
        backend: impl DetectorBackend + 'static,
        recorder: Arc<CountingRecorder>,
    ) -> StreamLoop {
        let detector: SharedBackend = Arc::new(Mutex::new(backend));
        StreamLoop::new(
            detector,
            recorder,
            Arc::new(Annotator::new(70)),
            IngestSettings::default(),
            30,
        )
    }

    fn count_parts(bytes: &[u8]) -> usize {
        let marker = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        bytes.windows(marker.len()).filter(|w| *w == marker).count()
    }

    #[test]
    fn records_every_thirtieth_detection_frame() {
        let recorder = Arc::new(CountingRecorder::default());
        let stream = stream_loop(StubBackend::constant(vec![hit(), hit()]), recorder.clone());
        let session = SessionContext::new("s1".to_string(), "stub://cam?frames=65");
        let mut out = Vec::new();

        assert_eq!(stream.run(&session, None, &mut out), StreamState::Closed);
        assert_eq!(session.frames_emitted(), 65);
        assert_eq!(session.detection_frames(), 65);
        let calls = recorder.calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (2, vec![0.9, 0.9]));
        assert_eq!(count_parts(&out), 65);
    }

    #[test]
    fn frames_without_detections_do_not_advance_the_counter() {
        let recorder = Arc::new(CountingRecorder::default());
        // detections on every other frame: 59 frames -> 30 detection frames
        let backend = StubBackend::scripted(vec![vec![hit()], vec![]]);
        let stream = stream_loop(backend, recorder.clone());
        let session = SessionContext::new("s2".to_string(), "stub://cam?frames=59");
        stream.run(&session, None, &mut Vec::new());

        assert_eq!(session.detection_frames(), 30);
        assert_eq!(recorder.calls.lock().expect("calls lock").len(), 1);
    }

    #[test]
    fn parts_are_framed_as_multipart_jpeg() {
        let recorder = Arc::new(CountingRecorder::default());
        let stream = stream_loop(StubBackend::new(), recorder);
        let session = SessionContext::new("s3".to_string(), "stub://cam?frames=1");
        let mut out = Vec::new();
        stream.run(&session, None, &mut out);

        let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        assert!(out.starts_with(header));
        assert_eq!(&out[header.len()..header.len() + 2], &[0xFF, 0xD8]);
        assert!(out.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }

    #[test]
    fn stop_flag_ends_stream_after_current_frame() {
        let recorder = Arc::new(CountingRecorder::default());
        let stream = stream_loop(StubBackend::new(), recorder);
        let session = SessionContext::new("s4".to_string(), "stub://endless");
        session.request_stop();
        let mut out = Vec::new();

        assert_eq!(stream.run(&session, None, &mut out), StreamState::Closed);
        assert_eq!(count_parts(&out), 1);
    }

    #[test]
    fn stop_flag_is_honoured_when_frames_fail_to_render() {
        let recorder = Arc::new(CountingRecorder::default());
        let stream = stream_loop(StubBackend::new(), recorder);
        // wider than a JPEG can encode, so every frame is dropped
        let session = SessionContext::new("s8".to_string(), "stub://wide?width=70000&height=1");
        session.request_stop();
        let mut out = Vec::new();

        assert_eq!(stream.run(&session, None, &mut out), StreamState::Closed);
        assert!(out.is_empty());
        assert_eq!(session.frames_emitted(), 0);
    }

    #[test]
    fn motion_history_is_kept_per_session() {
        let recorder = Arc::new(CountingRecorder::default());
        let stream = stream_loop(MotionBackend::new(), recorder);
        let first = SessionContext::new("m1".to_string(), "stub://a?frames=3");
        let second = SessionContext::new("m2".to_string(), "stub://b?frames=3");

        stream.run(&first, None, &mut Vec::new());
        stream.run(&second, None, &mut Vec::new());

        // the opening frame of each session has nothing to compare against
        assert_eq!(first.detection_frames(), 2);
        assert_eq!(second.detection_frames(), 2);
    }

    #[test]
    fn unopenable_source_fails_without_output() {
        let recorder = Arc::new(CountingRecorder::default());
        let stream = stream_loop(StubBackend::new(), recorder);
        let session = SessionContext::new("s5".to_string(), "stub://cam?offline=true");
        let mut out = Vec::new();

        assert_eq!(stream.run(&session, None, &mut out), StreamState::Failed);
        assert_eq!(session.state(), StreamState::Failed);
        assert!(out.is_empty());
    }

    #[test]
    fn detector_errors_emit_plain_frames() {
        let recorder = Arc::new(CountingRecorder::default());
        let stream = stream_loop(FailingBackend, recorder.clone());
        let session = SessionContext::new("s6".to_string(), "stub://cam?frames=3");
        let mut out = Vec::new();
        stream.run(&session, None, &mut out);

        assert_eq!(count_parts(&out), 3);
        assert_eq!(session.detection_frames(), 0);
        assert!(recorder.calls.lock().expect("calls lock").is_empty());
    }

    #[test]
    fn client_disconnect_closes_stream() {
        let recorder = Arc::new(CountingRecorder::default());
        let stream = stream_loop(StubBackend::new(), recorder);
        let session = SessionContext::new("s7".to_string(), "stub://endless");
        assert_eq!(stream.run(&session, None, &mut BrokenPipe), StreamState::Closed);
        assert_eq!(session.frames_emitted(), 0);
    }

    #[test]
    fn registry_stops_single_and_all_sessions() {
        let registry = SessionRegistry::new();
        let a = registry.register("camera");
        let b = registry.register("ngrok");
        assert_eq!(a.id().len(), 16);
        assert_ne!(a.id(), b.id());

        assert!(registry.stop(a.id()));
        assert!(a.stop_requested());
        assert!(!b.stop_requested());
        assert!(!registry.stop("missing"));

        assert_eq!(registry.stop_all(), 2);
        assert!(b.stop_requested());
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let registry = SessionRegistry::new();
        {
            let guard = registry.open("camera");
            assert!(registry.get(guard.session().id()).is_some());
            assert_eq!(registry.active().len(), 1);
        }
        assert!(registry.is_empty());
    }
}
