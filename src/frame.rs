//! Frames and frame rendering.
//!
//! - `Frame`: an owned RGB24 frame as produced by every capture source.
//! - `Annotator`: burns detection boxes and labels into a copy of a frame and
//!   encodes it as JPEG for the multipart feed.
//!
//! Frames are never written to disk; the only output path is the encoded JPEG
//! handed to the video feed.

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::PathBuf;

use crate::detect::{Detection, DetectionResult};

/// Box colours, picked by class id.
const PALETTE: [[u8; 3]; 8] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 194, 255],
];

const BOX_THICKNESS: i32 = 2;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// An RGB24 frame.
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap RGB24 pixels. The buffer length must be `width * height * 3`.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Copy the frame into an image buffer for drawing or resizing.
    pub fn to_image(&self) -> Result<RgbImage> {
        ImageBuffer::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))
    }
}

// ----------------------------------------------------------------------------
// Annotator
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// JPEG quality for the feed, 1..=100.
    pub jpeg_quality: u8,
    /// TrueType font used for box labels. Without one only the label strip is drawn.
    pub font_path: Option<PathBuf>,
    pub font_scale: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            font_path: None,
            font_scale: 16.0,
        }
    }
}

pub struct Annotator {
    font: Option<FontVec>,
    scale: PxScale,
    jpeg_quality: u8,
}

impl Annotator {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            font: None,
            scale: PxScale::from(16.0),
            jpeg_quality,
        }
    }

    pub fn from_settings(settings: &RenderSettings) -> Result<Self> {
        let font = match &settings.font_path {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("read label font {}", path.display()))?;
                let font = FontVec::try_from_vec(bytes)
                    .map_err(|_| anyhow!("invalid font file {}", path.display()))?;
                Some(font)
            }
            None => None,
        };
        Ok(Self {
            font,
            scale: PxScale::from(settings.font_scale),
            jpeg_quality: settings.jpeg_quality,
        })
    }

    /// Draw every detection onto a copy of `frame`.
    pub fn annotate(&self, frame: &Frame, result: &DetectionResult) -> Result<RgbImage> {
        let mut image = frame.to_image()?;
        for detection in &result.detections {
            self.draw_detection(&mut image, detection);
        }
        Ok(image)
    }

    /// Annotate and encode in one step.
    pub fn render(&self, frame: &Frame, result: &DetectionResult) -> Result<Vec<u8>> {
        let image = self.annotate(frame, result)?;
        encode_jpeg(&image, self.jpeg_quality)
    }

    fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
        let (width, height) = image.dimensions();
        let Some(bounds) = clamp_box(detection, width, height) else {
            return;
        };
        let color = Rgb(PALETTE[detection.class_id % PALETTE.len()]);

        for inset in 0..BOX_THICKNESS {
            let w = bounds.w - 2 * inset;
            let h = bounds.h - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(bounds.x + inset, bounds.y + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(image, rect, color);
        }

        let text = label_text(detection);
        let (text_w, text_h) = match &self.font {
            Some(font) => text_size(self.scale, font, &text),
            None => (bounds.w.max(1) as u32, self.scale.y.ceil() as u32),
        };
        let strip_h = text_h + 4;
        let strip_y = if bounds.y >= strip_h as i32 {
            bounds.y - strip_h as i32
        } else {
            bounds.y
        };
        let strip = Rect::at(bounds.x, strip_y).of_size(text_w.max(1) + 4, strip_h);
        draw_filled_rect_mut(image, strip, color);

        if let Some(font) = &self.font {
            draw_text_mut(
                image,
                TEXT_COLOR,
                bounds.x + 2,
                strip_y + 2,
                self.scale,
                font,
                &text,
            );
        }
    }
}

struct PixelBox {
    x: i32,
    y: i32,
    w: i32,
    h: i32,
}

fn clamp_box(detection: &Detection, width: u32, height: u32) -> Option<PixelBox> {
    if width == 0 || height == 0 {
        return None;
    }
    let max_x = width as f32 - 1.0;
    let max_y = height as f32 - 1.0;
    let x1 = detection.x1.clamp(0.0, max_x) as i32;
    let y1 = detection.y1.clamp(0.0, max_y) as i32;
    let x2 = detection.x2.clamp(0.0, max_x) as i32;
    let y2 = detection.y2.clamp(0.0, max_y) as i32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(PixelBox {
        x: x1,
        y: y1,
        w: x2 - x1 + 1,
        h: y2 - y1 + 1,
    })
}

fn label_text(detection: &Detection) -> String {
    match detection.confidence {
        Some(confidence) => format!("{} {:.2}", detection.label, confidence),
        None => detection.label.clone(),
    }
}

/// Encode an RGB image as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    image
        .write_with_encoder(encoder)
        .context("encode annotated frame as jpeg")?;
    Ok(out)
}
