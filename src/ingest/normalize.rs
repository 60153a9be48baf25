//! Camera pixel format conversion to RGB24 frames.

use anyhow::{anyhow, Context, Result};

use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Yuyv,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"NV12" => Some(Self::Nv12),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

pub(crate) fn to_frame(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Frame> {
    match format {
        PixelFormat::Rgb24 => Frame::from_rgb(pixels.to_vec(), width, height),
        PixelFormat::Yuyv => Frame::from_rgb(yuyv_to_rgb(pixels, width, height)?, width, height),
        PixelFormat::Nv12 => Frame::from_rgb(nv12_to_rgb(pixels, width, height)?, width, height),
        PixelFormat::Mjpeg => {
            let image = image::load_from_memory(pixels).context("decode camera jpeg")?;
            Ok(Frame::from_image(image.into_rgb8()))
        }
    }
}

fn plane_size(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let count = plane_size(width, height)?;
    if width % 2 != 0 || pixels.len() < count * 2 {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            count * 2,
            pixels.len()
        ));
    }
    let mut rgb = Vec::with_capacity(count * 3);
    for chunk in pixels[..count * 2].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            rgb.extend_from_slice(&yuv_to_rgb(y as f32, u, v));
        }
    }
    Ok(rgb)
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = plane_size(width, height)?;
    let expected = y_plane + y_plane / 2;
    if pixels.len() < expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;
            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    [
        clamp_to_u8(y + 1.402 * v),
        clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_to_u8(y + 1.772 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_converts_to_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let frame = to_frame(&nv12, 2, 2, PixelFormat::Nv12)?;
        assert_eq!(frame.pixels(), &[128u8; 12][..]);

        let yuyv = vec![128u8; 8];
        let frame = to_frame(&yuyv, 2, 2, PixelFormat::Yuyv)?;
        assert_eq!(frame.pixels(), &[128u8; 12][..]);
        Ok(())
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(to_frame(&[0u8; 3], 2, 2, PixelFormat::Yuyv).is_err());
        assert!(to_frame(&[0u8; 5], 2, 2, PixelFormat::Nv12).is_err());
    }

    #[test]
    fn fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
    }
}
