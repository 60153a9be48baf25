//! Frame ingestion sources.
//!
//! A stream session names its source with a selector string:
//! - `camera`: the configured local camera device (index 0 by default)
//! - a configured remote alias (e.g. `ngrok`): candidate URLs probed in order
//! - anything else: a file path or stream URL opened directly
//!
//! Every source is wrapped in a `Capture`, the capture handle the stream loop
//! reads from. Available backends:
//! - `stub://` synthetic frames (testing)
//! - still images (`.jpg`, `.jpeg`, `.png`, `.bmp`), one frame each
//! - HTTP(S) MJPEG feeds or JPEG snapshot URLs
//! - video files and `rtsp://` streams (feature: ingest-ffmpeg)
//! - V4L2 camera devices (feature: ingest-v4l2)
//!
//! The capture handle is released when the `Capture` is dropped.

#[cfg(feature = "ingest-ffmpeg")]
pub mod file_ffmpeg;
pub mod mjpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod still;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::path::Path;

use crate::frame::Frame;

#[cfg(feature = "ingest-ffmpeg")]
pub use file_ffmpeg::FfmpegSource;
pub use mjpeg::MjpegSource;
pub use still::StillImageSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// Selector value for the local camera.
pub const CAMERA_SELECTOR: &str = "camera";

const STILL_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Device opened for the `camera` selector.
    pub camera_device: String,
    /// Remote aliases and their candidate URLs, probed in order.
    pub remote_aliases: BTreeMap<String, Vec<String>>,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            remote_aliases: BTreeMap::new(),
        }
    }
}

/// A parsed source selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    Camera { device: String },
    Remote { alias: String, candidates: Vec<String> },
    Location(String),
}

impl SourceSelector {
    pub fn parse(raw: &str, settings: &IngestSettings) -> Self {
        let raw = raw.trim();
        if raw == CAMERA_SELECTOR {
            return Self::Camera {
                device: settings.camera_device.clone(),
            };
        }
        if let Some(candidates) = settings.remote_aliases.get(raw) {
            return Self::Remote {
                alias: raw.to_string(),
                candidates: candidates.clone(),
            };
        }
        Self::Location(raw.to_string())
    }

    /// Open the capture handle this selector names.
    pub fn open(&self) -> Result<Capture> {
        match self {
            Self::Camera { device } => Capture::open_camera(device),
            Self::Remote { alias, candidates } => {
                for url in candidates {
                    log::info!("remote '{}': trying {}", alias, url);
                    match Capture::open_location(url) {
                        Ok(capture) => {
                            log::info!("remote '{}': connected to {}", alias, url);
                            return Ok(capture);
                        }
                        Err(err) => {
                            log::warn!("remote '{}': failed to connect to {}: {:#}", alias, url, err);
                        }
                    }
                }
                Err(anyhow!(
                    "could not connect to any candidate for remote '{}'",
                    alias
                ))
            }
            Self::Location(location) => Capture::open_location(location),
        }
    }
}

impl std::fmt::Display for SourceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Camera { device } => write!(f, "camera ({})", device),
            Self::Remote { alias, .. } => write!(f, "remote '{}'", alias),
            Self::Location(location) => write!(f, "{}", location),
        }
    }
}

/// Capture statistics.
#[derive(Clone, Debug)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub source: String,
}

/// An open capture handle.
pub enum Capture {
    Synthetic(SyntheticSource),
    Still(StillImageSource),
    Mjpeg(MjpegSource),
    #[cfg(feature = "ingest-ffmpeg")]
    File(FfmpegSource),
    #[cfg(feature = "ingest-v4l2")]
    Device(V4l2Source),
}

impl Capture {
    /// Open the local camera device.
    pub fn open_camera(device: &str) -> Result<Self> {
        if device.starts_with("stub://") {
            return Ok(Self::Synthetic(SyntheticSource::open(device)?));
        }
        #[cfg(feature = "ingest-v4l2")]
        {
            let mut source = V4l2Source::new(V4l2Config {
                device: device.to_string(),
                ..V4l2Config::default()
            });
            source.connect()?;
            Ok(Self::Device(source))
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            Err(anyhow!(
                "camera capture from {} requires the ingest-v4l2 feature",
                device
            ))
        }
    }

    /// Open a file path or stream URL.
    pub fn open_location(location: &str) -> Result<Self> {
        if location.trim().is_empty() {
            return Err(anyhow!("empty source location"));
        }
        if location.starts_with("stub://") {
            return Ok(Self::Synthetic(SyntheticSource::open(location)?));
        }
        if location.starts_with("http://") || location.starts_with("https://") {
            return Ok(Self::Mjpeg(MjpegSource::connect(location)?));
        }
        if is_still_image(location) {
            return Ok(Self::Still(StillImageSource::open(Path::new(location))?));
        }
        #[cfg(feature = "ingest-ffmpeg")]
        {
            Ok(Self::File(FfmpegSource::open(location)?))
        }
        #[cfg(not(feature = "ingest-ffmpeg"))]
        {
            Err(anyhow!(
                "opening '{}' requires the ingest-ffmpeg feature",
                location
            ))
        }
    }

    /// Whether the handle can still produce frames.
    pub fn is_open(&self) -> bool {
        match self {
            Self::Synthetic(source) => source.is_open(),
            Self::Still(source) => source.is_open(),
            Self::Mjpeg(source) => source.is_open(),
            #[cfg(feature = "ingest-ffmpeg")]
            Self::File(source) => source.is_open(),
            #[cfg(feature = "ingest-v4l2")]
            Self::Device(source) => source.is_open(),
        }
    }

    /// Read the next frame. An error means the source is exhausted or broken.
    pub fn read_frame(&mut self) -> Result<Frame> {
        match self {
            Self::Synthetic(source) => source.next_frame(),
            Self::Still(source) => source.next_frame(),
            Self::Mjpeg(source) => source.next_frame(),
            #[cfg(feature = "ingest-ffmpeg")]
            Self::File(source) => source.next_frame(),
            #[cfg(feature = "ingest-v4l2")]
            Self::Device(source) => source.next_frame(),
        }
    }

    pub fn stats(&self) -> CaptureStats {
        match self {
            Self::Synthetic(source) => source.stats(),
            Self::Still(source) => source.stats(),
            Self::Mjpeg(source) => source.stats(),
            #[cfg(feature = "ingest-ffmpeg")]
            Self::File(source) => source.stats(),
            #[cfg(feature = "ingest-v4l2")]
            Self::Device(source) => source.stats(),
        }
    }
}

fn is_still_image(location: &str) -> bool {
    Path::new(location)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            STILL_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
