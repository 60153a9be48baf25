//! Synthetic frame source (`stub://`).
//!
//! `stub://<name>?frames=N&width=W&height=H&offline=true`
//!
//! - `frames`: number of frames before the source reports closed (unbounded if absent)
//! - `width` / `height`: frame size, 64x48 by default
//! - `offline=true`: refuse to open, like an unreachable feed

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::CaptureStats;
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;

pub struct SyntheticSource {
    location: String,
    width: u32,
    height: u32,
    frame_limit: Option<u64>,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticSource {
    pub fn open(location: &str) -> Result<Self> {
        let url = Url::parse(location).with_context(|| format!("parse stub url {}", location))?;
        let mut source = Self {
            location: location.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            frame_limit: None,
            frame_count: 0,
            scene_state: 0,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => {
                    source.frame_limit = Some(
                        value
                            .parse()
                            .map_err(|_| anyhow!("stub frames must be an integer"))?,
                    )
                }
                "width" => {
                    source.width = value
                        .parse()
                        .map_err(|_| anyhow!("stub width must be an integer"))?
                }
                "height" => {
                    source.height = value
                        .parse()
                        .map_err(|_| anyhow!("stub height must be an integer"))?
                }
                "offline" if value == "true" => {
                    return Err(anyhow!("stub source {} is offline", location));
                }
                _ => {}
            }
        }
        if source.width == 0 || source.height == 0 {
            return Err(anyhow!("stub frame size must be non-zero"));
        }
        log::info!("SyntheticSource: opened {}", location);
        Ok(source)
    }

    pub fn is_open(&self) -> bool {
        self.frame_limit
            .map_or(true, |limit| self.frame_count < limit)
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        if !self.is_open() {
            return Err(anyhow!("stub source {} exhausted", self.location));
        }
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        Frame::from_rgb(pixels, self.width, self.height)
    }

    /// Mostly static background; the scene shifts every 50 frames.
    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frame_count,
            source: self.location.clone(),
        }
    }
}
