//! JPEG encoding of annotated frames.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("jpeg encoder: {0}")]
    Codec(#[from] image::ImageError),
}

/// Encode packed RGB8 pixels as a baseline JPEG.
///
/// Identical input always produces identical bytes.
pub fn encode_jpeg(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>, EncodeError> {
    if width == 0 || height == 0 {
        return Err(EncodeError::Malformed(format!(
            "zero dimension {width}x{height}"
        )));
    }
    let expected = width as usize * height as usize * 3;
    if rgb.len() != expected {
        return Err(EncodeError::Malformed(format!(
            "expected {expected} bytes for {width}x{height} RGB, got {}",
            rgb.len()
        )));
    }

    let mut jpeg = Vec::with_capacity(expected / 8);
    JpegEncoder::new(&mut jpeg).encode(rgb, width, height, ExtendedColorType::Rgb8)?;
    Ok(jpeg)
}

pub fn encode_image(image: &RgbImage) -> Result<Vec<u8>, EncodeError> {
    encode_jpeg(image.as_raw(), image.width(), image.height())
}
