//! Still image source: an uploaded photo streams as a single frame.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use super::CaptureStats;
use crate::frame::Frame;

pub struct StillImageSource {
    path: String,
    frame: Option<Frame>,
    frame_count: u64,
}

impl StillImageSource {
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("decode image {}", path.display()))?
            .into_rgb8();
        log::info!("StillImageSource: opened {}", path.display());
        Ok(Self {
            path: path.display().to_string(),
            frame: Some(Frame::from_image(image)),
            frame_count: 0,
        })
    }

    pub fn is_open(&self) -> bool {
        self.frame.is_some()
    }

    pub fn next_frame(&mut self) -> Result<Frame> {
        let frame = self
            .frame
            .take()
            .ok_or_else(|| anyhow!("image {} already consumed", self.path))?;
        self.frame_count += 1;
        Ok(frame)
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frame_count,
            source: self.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn still_image_yields_exactly_one_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bin.png");
        RgbImage::from_pixel(5, 4, Rgb([10, 20, 30])).save(&path)?;

        let mut source = StillImageSource::open(&path)?;
        assert!(source.is_open());
        let frame = source.next_frame()?;
        assert_eq!((frame.width, frame.height), (5, 4));
        assert_eq!(&frame.pixels()[..3], &[10, 20, 30]);
        assert!(!source.is_open());
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[test]
    fn undecodable_file_fails_to_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not a jpeg")?;
        assert!(StillImageSource::open(&path).is_err());
        Ok(())
    }
}
