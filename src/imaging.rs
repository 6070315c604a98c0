//! Image decode, downscale and preview frame encoding

use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, GenericImageView};

use crate::config::StreamEncoding;
use crate::device::RawFrame;
use crate::error::{Error, Result};

/// Packed 8-bit BGR pixels, the layout the device expects for image enrollment
#[derive(Debug, Clone, PartialEq)]
pub struct BgrImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl BgrImage {
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

/// Decode an uploaded image into BGR24, shrinking it when the buffer would
/// exceed `max_bytes`
///
/// The scale factor is `sqrt(max_bytes / size)` so the area shrinks by the
/// overshoot ratio and the aspect ratio is kept.
pub fn decode_enroll_image(bytes: &[u8], max_bytes: usize) -> Result<BgrImage> {
    let decoded = image::load_from_memory(bytes).map_err(|e| Error::Image(e.to_string()))?;
    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(Error::Image("image has no pixels".into()));
    }

    let mut rgb = decoded.into_rgb8();
    let size = width as usize * height as usize * 3;
    if size > max_bytes {
        let scale = (max_bytes as f64 / size as f64).sqrt();
        let new_w = ((width as f64 * scale) as u32).max(1);
        let new_h = ((height as f64 * scale) as u32).max(1);
        log::info!(
            "Resizing enroll image {}x{} -> {}x{} ({} bytes over the {} byte limit)",
            width,
            height,
            new_w,
            new_h,
            size,
            max_bytes
        );
        rgb = image::imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);
    }

    let (width, height) = rgb.dimensions();
    let mut pixels = rgb.into_raw();
    for px in pixels.chunks_exact_mut(3) {
        px.swap(0, 2);
    }

    Ok(BgrImage {
        width,
        height,
        pixels,
    })
}

fn check_frame(frame: &RawFrame) -> Result<()> {
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.width == 0 || frame.height == 0 || frame.pixels.len() != expected {
        return Err(Error::Encoding(format!(
            "frame {}x{} carries {} bytes, expected {}",
            frame.width,
            frame.height,
            frame.pixels.len(),
            expected
        )));
    }
    Ok(())
}

pub fn encode_jpeg(frame: &RawFrame, quality: u8) -> Result<Vec<u8>> {
    check_frame(frame)?;
    let mut out = Vec::with_capacity(frame.pixels.len() / 8);
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder
        .encode(&frame.pixels, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| Error::Encoding(e.to_string()))?;
    Ok(out)
}

/// Lossless WebP; the encoder has no quality knob
pub fn encode_webp(frame: &RawFrame) -> Result<Vec<u8>> {
    check_frame(frame)?;
    let mut out = Vec::new();
    let encoder = WebPEncoder::new_lossless(&mut out);
    encoder
        .encode(&frame.pixels, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| Error::Encoding(e.to_string()))?;
    Ok(out)
}

pub fn encode_frame(frame: &RawFrame, encoding: StreamEncoding, jpeg_quality: u8) -> Result<Vec<u8>> {
    match encoding {
        StreamEncoding::Jpeg => encode_jpeg(frame, jpeg_quality),
        StreamEncoding::Webp => encode_webp(frame),
    }
}
