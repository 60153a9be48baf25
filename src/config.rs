use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::frame::RenderSettings;
use crate::ingest::IngestSettings;

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_MAX_REQUEST_BYTES: usize = 256 * 1024 * 1024;
const DEFAULT_DASHBOARD_URL: &str = "http://localhost:3000";
const DEFAULT_MODEL_VERSION: &str = "YOLOv8";
const DEFAULT_IP_DISCOVERY_URLS: [&str; 2] =
    ["https://api.ipify.org?format=json", "https://httpbin.org/ip"];
const DEFAULT_IP_GEOLOCATION_URL: &str = "https://ipapi.co/{ip}/json/";
const DEFAULT_REVERSE_GEOCODE_URL: &str = "https://nominatim.openstreetmap.org/reverse";
const DEFAULT_USER_AGENT: &str = "GarbageDetectionApp/1.0";
const DEFAULT_SAMPLE_EVERY: u64 = 30;
const DEFAULT_LOG_CAPACITY: usize = 100;
const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_REMOTE_ALIAS: &str = "ngrok";
const DEFAULT_REMOTE_URL: &str = "https://76ee592fbf21.ngrok-free.app/video";
const DEFAULT_DETECTOR: &str = "motion";
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_FONT_SCALE: f32 = 16.0;

#[derive(Debug, Deserialize, Default)]
struct BinwatchConfigFile {
    api: Option<ApiConfigFile>,
    dashboard: Option<DashboardConfigFile>,
    geo: Option<GeoConfigFile>,
    stream: Option<StreamConfigFile>,
    ingest: Option<IngestConfigFile>,
    render: Option<RenderConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    upload_dir: Option<PathBuf>,
    max_request_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DashboardConfigFile {
    url: Option<String>,
    api_key: Option<String>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct GeoConfigFile {
    ip_discovery_urls: Option<Vec<String>>,
    ip_geolocation_url: Option<String>,
    reverse_geocode_url: Option<String>,
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    sample_every: Option<u64>,
    log_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct IngestConfigFile {
    camera_device: Option<String>,
    remote_aliases: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Deserialize, Default)]
struct RenderConfigFile {
    jpeg_quality: Option<u8>,
    font_path: Option<PathBuf>,
    font_scale: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    confidence: Option<f32>,
    iou: Option<f32>,
    input_size: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct BinwatchConfig {
    pub api_addr: String,
    pub upload_dir: PathBuf,
    pub max_request_bytes: usize,
    pub dashboard: DashboardSettings,
    pub geo: GeoSettings,
    pub stream: StreamSettings,
    pub ingest: IngestSettings,
    pub render: RenderSettings,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone)]
pub struct DashboardSettings {
    /// Base URL of the dashboard; events go to `<url>/api/model/upload`.
    pub url: String,
    pub api_key: Option<String>,
    pub model_version: String,
}

impl DashboardSettings {
    pub fn upload_endpoint(&self) -> String {
        format!("{}/api/model/upload", self.url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone)]
pub struct GeoSettings {
    /// Public IP discovery services, tried in order.
    pub ip_discovery_urls: Vec<String>,
    /// IP geolocation URL template; `{ip}` is replaced with the address.
    pub ip_geolocation_url: String,
    pub reverse_geocode_url: String,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Record every Nth frame that carried detections.
    pub sample_every: u64,
    /// Bound of the in-memory event log.
    pub log_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Default backend name: "motion", "stub" or "tract".
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub confidence: f32,
    pub iou: f32,
    pub input_size: u32,
}

impl Default for BinwatchConfig {
    fn default() -> Self {
        Self::from_file(BinwatchConfigFile::default())
    }
}

impl BinwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("BINWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: BinwatchConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let dashboard = file.dashboard.unwrap_or_default();
        let geo = file.geo.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let ingest = file.ingest.unwrap_or_default();
        let render = file.render.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();

        let remote_aliases = ingest.remote_aliases.unwrap_or_else(|| {
            BTreeMap::from([(
                DEFAULT_REMOTE_ALIAS.to_string(),
                vec![DEFAULT_REMOTE_URL.to_string()],
            )])
        });

        Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            upload_dir: api.upload_dir.unwrap_or_else(std::env::temp_dir),
            max_request_bytes: api.max_request_bytes.unwrap_or(DEFAULT_MAX_REQUEST_BYTES),
            dashboard: DashboardSettings {
                url: dashboard
                    .url
                    .unwrap_or_else(|| DEFAULT_DASHBOARD_URL.to_string()),
                api_key: dashboard.api_key.filter(|key| !key.trim().is_empty()),
                model_version: dashboard
                    .model_version
                    .unwrap_or_else(|| DEFAULT_MODEL_VERSION.to_string()),
            },
            geo: GeoSettings {
                ip_discovery_urls: geo.ip_discovery_urls.unwrap_or_else(|| {
                    DEFAULT_IP_DISCOVERY_URLS
                        .iter()
                        .map(|url| url.to_string())
                        .collect()
                }),
                ip_geolocation_url: geo
                    .ip_geolocation_url
                    .unwrap_or_else(|| DEFAULT_IP_GEOLOCATION_URL.to_string()),
                reverse_geocode_url: geo
                    .reverse_geocode_url
                    .unwrap_or_else(|| DEFAULT_REVERSE_GEOCODE_URL.to_string()),
                user_agent: geo
                    .user_agent
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            },
            stream: StreamSettings {
                sample_every: stream.sample_every.unwrap_or(DEFAULT_SAMPLE_EVERY),
                log_capacity: stream.log_capacity.unwrap_or(DEFAULT_LOG_CAPACITY),
            },
            ingest: IngestSettings {
                camera_device: ingest
                    .camera_device
                    .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
                remote_aliases,
            },
            render: RenderSettings {
                jpeg_quality: render.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                font_path: render.font_path,
                font_scale: render.font_scale.unwrap_or(DEFAULT_FONT_SCALE),
            },
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector.model_path,
                labels_path: detector.labels_path,
                confidence: detector.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                iou: detector.iou.unwrap_or(DEFAULT_IOU),
                input_size: detector.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("BINWATCH_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(dir) = env_value("BINWATCH_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_value("BINWATCH_DASHBOARD_URL") {
            self.dashboard.url = url;
        }
        if let Some(key) = env_value("BINWATCH_DASHBOARD_API_KEY") {
            self.dashboard.api_key = Some(key);
        }
        if let Some(device) = env_value("BINWATCH_CAMERA_DEVICE") {
            self.ingest.camera_device = device;
        }
        if let Some(backend) = env_value("BINWATCH_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_value("BINWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("BINWATCH_LABELS_PATH") {
            self.detector.labels_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_value("BINWATCH_FONT_PATH") {
            self.render.font_path = Some(PathBuf::from(path));
        }
        if let Some(every) = env_value("BINWATCH_SAMPLE_EVERY") {
            self.stream.sample_every = every
                .parse()
                .map_err(|_| anyhow!("BINWATCH_SAMPLE_EVERY must be a positive integer"))?;
        }
        if let Some(capacity) = env_value("BINWATCH_LOG_CAPACITY") {
            self.stream.log_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("BINWATCH_LOG_CAPACITY must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.stream.sample_every == 0 {
            return Err(anyhow!("stream.sample_every must be greater than zero"));
        }
        if self.stream.log_capacity == 0 {
            return Err(anyhow!("stream.log_capacity must be greater than zero"));
        }
        if !(1..=100).contains(&self.render.jpeg_quality) {
            return Err(anyhow!("render.jpeg_quality must be between 1 and 100"));
        }
        if !self.geo.ip_geolocation_url.contains("{ip}") {
            return Err(anyhow!("geo.ip_geolocation_url must contain an {{ip}} placeholder"));
        }
        url::Url::parse(&self.dashboard.url)
            .map_err(|e| anyhow!("invalid dashboard url '{}': {}", self.dashboard.url, e))?;
        if !(0.0..=1.0).contains(&self.detector.confidence) {
            return Err(anyhow!("detector.confidence must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.detector.iou) {
            return Err(anyhow!("detector.iou must be within [0, 1]"));
        }
        for (alias, candidates) in &self.ingest.remote_aliases {
            if candidates.is_empty() {
                return Err(anyhow!("remote alias '{}' has no candidate urls", alias));
            }
        }
        self.detector.backend = self.detector.backend.trim().to_lowercase();
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<BinwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_deployment() {
        let cfg = BinwatchConfig::default();
        assert_eq!(cfg.stream.sample_every, 30);
        assert_eq!(cfg.stream.log_capacity, 100);
        assert_eq!(
            cfg.dashboard.upload_endpoint(),
            "http://localhost:3000/api/model/upload"
        );
        assert_eq!(cfg.geo.ip_discovery_urls.len(), 2);
        assert!(cfg.ingest.remote_aliases.contains_key("ngrok"));
        assert_eq!(cfg.ingest.camera_device, "/dev/video0");
    }

    #[test]
    fn upload_endpoint_tolerates_trailing_slash() {
        let settings = DashboardSettings {
            url: "https://dash.example/".to_string(),
            api_key: None,
            model_version: "YOLOv8".to_string(),
        };
        assert_eq!(
            settings.upload_endpoint(),
            "https://dash.example/api/model/upload"
        );
    }

    #[test]
    fn validate_rejects_zero_sampling() {
        let mut cfg = BinwatchConfig::default();
        cfg.stream.sample_every = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_template_without_placeholder() {
        let mut cfg = BinwatchConfig::default();
        cfg.geo.ip_geolocation_url = "https://ipapi.co/json/".to_string();
        assert!(cfg.validate().is_err());
    }
}
