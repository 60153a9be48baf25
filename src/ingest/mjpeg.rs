//! HTTP(S) frame source.
//!
//! Handles phone/IP-camera feeds served either as `multipart/x-mixed-replace`
//! MJPEG streams or as plain JPEG snapshot URLs that are re-fetched per frame.
//! Frames are decoded in memory.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use super::CaptureStats;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MjpegSource {
    url: String,
    agent: ureq::Agent,
    stream: HttpStream,
    frame_count: u64,
    ended: bool,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    /// Snapshot URL. The body fetched while connecting is served first.
    Snapshot { pending: Option<Vec<u8>> },
}

impl MjpegSource {
    /// Connect to `url`. Fails if the server is unreachable or answers with an error.
    pub fn connect(url: &str) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        let response = agent
            .get(url)
            .call()
            .with_context(|| format!("connect to http stream {}", url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        let stream = if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            let body = read_body(response.into_reader())?;
            HttpStream::Snapshot {
                pending: Some(body),
            }
        };
        log::info!("MjpegSource: connected to {}", url);
        Ok(Self {
            url: url.to_string(),
            agent,
            stream,
            frame_count: 0,
            ended: false,
        })
    }

    pub fn is_open(&self) -> bool {
        !self.ended
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        if self.ended {
            return Err(anyhow!("http stream {} has ended", self.url));
        }
        let jpeg = match &mut self.stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg(),
            HttpStream::Snapshot { pending } => match pending.take() {
                Some(bytes) => Ok(bytes),
                None => fetch_single_jpeg(&self.agent, &self.url),
            },
        };
        let frame = jpeg.and_then(|bytes| decode_jpeg(&bytes));
        match frame {
            Ok(frame) => {
                self.frame_count += 1;
                Ok(frame)
            }
            Err(err) => {
                self.ended = true;
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
        }
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    read_body(response.into_reader())
}

fn read_body(reader: Box<dyn Read + Send + Sync>) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    Ok(Frame::from_image(image.into_rgb8()))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
