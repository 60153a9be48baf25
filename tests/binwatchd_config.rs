use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use binwatch::config::BinwatchConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "BINWATCH_CONFIG",
        "BINWATCH_API_ADDR",
        "BINWATCH_UPLOAD_DIR",
        "BINWATCH_DASHBOARD_URL",
        "BINWATCH_DASHBOARD_API_KEY",
        "BINWATCH_CAMERA_DEVICE",
        "BINWATCH_DETECTOR",
        "BINWATCH_MODEL_PATH",
        "BINWATCH_LABELS_PATH",
        "BINWATCH_FONT_PATH",
        "BINWATCH_SAMPLE_EVERY",
        "BINWATCH_LOG_CAPACITY",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "api": { "addr": "0.0.0.0:8080", "upload_dir": "/srv/binwatch/uploads" },
        "dashboard": { "url": "https://dash.example", "api_key": "k1" },
        "stream": { "sample_every": 15, "log_capacity": 50 },
        "ingest": {
            "camera_device": "/dev/video2",
            "remote_aliases": { "phone": ["http://10.0.0.5:8080/video", "http://10.0.0.6:8080/video"] }
        },
        "detector": { "backend": "Stub", "confidence": 0.4 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("BINWATCH_CONFIG", file.path());
    std::env::set_var("BINWATCH_SAMPLE_EVERY", "10");
    std::env::set_var("BINWATCH_DASHBOARD_API_KEY", "k2");

    let cfg = BinwatchConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "0.0.0.0:8080");
    assert_eq!(cfg.upload_dir, PathBuf::from("/srv/binwatch/uploads"));
    assert_eq!(
        cfg.dashboard.upload_endpoint(),
        "https://dash.example/api/model/upload"
    );
    assert_eq!(cfg.dashboard.api_key.as_deref(), Some("k2"));
    assert_eq!(cfg.stream.sample_every, 10);
    assert_eq!(cfg.stream.log_capacity, 50);
    assert_eq!(cfg.ingest.camera_device, "/dev/video2");
    assert_eq!(cfg.ingest.remote_aliases["phone"].len(), 2);
    assert!(!cfg.ingest.remote_aliases.contains_key("ngrok"));
    assert_eq!(cfg.detector.backend, "stub");
    assert!((cfg.detector.confidence - 0.4).abs() < f32::EPSILON);

    clear_env();
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = BinwatchConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "127.0.0.1:5000");
    assert_eq!(cfg.stream.sample_every, 30);
    assert_eq!(cfg.stream.log_capacity, 100);
    assert_eq!(cfg.detector.backend, "motion");
    assert_eq!(cfg.dashboard.api_key, None);
    assert_eq!(cfg.geo.user_agent, "GarbageDetectionApp/1.0");
}

#[test]
fn invalid_env_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("BINWATCH_SAMPLE_EVERY", "0");
    assert!(BinwatchConfig::load().is_err());
    std::env::set_var("BINWATCH_SAMPLE_EVERY", "often");
    assert!(BinwatchConfig::load().is_err());

    clear_env();
}

#[test]
fn malformed_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    assert!(BinwatchConfig::load_from(Some(file.path())).is_err());
}
