//! Reassembly of raw engine output into a canonical RGBA image.
//!
//! The engine hands back tightly packed pixels with either 3 (RGB) or 4
//! (RGBA) channels. Anything else is an integration defect and is rejected.

use image::RgbaImage;

use crate::error::BufferSizeError;

pub const RGB_CHANNELS: u64 = 3;
pub const RGBA_CHANNELS: u64 = 4;

const OPAQUE: u8 = 0xFF;

/// `width × height` interleaved RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl CanonicalImage {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_rgba_image(self) -> RgbaImage {
        RgbaImage::from_raw(self.width, self.height, self.data)
            .expect("canonical image holds width * height * 4 bytes")
    }
}

/// Builds a [`CanonicalImage`] from an engine buffer for an output of
/// `width × height` pixels.
pub fn assemble(raw: Vec<u8>, width: u32, height: u32) -> Result<CanonicalImage, BufferSizeError> {
    let pixels = u64::from(width) * u64::from(height);
    let expected_rgb = pixels * RGB_CHANNELS;
    let expected_rgba = pixels * RGBA_CHANNELS;
    let actual = raw.len() as u64;

    let data = if actual == expected_rgba {
        raw
    } else if actual == expected_rgb {
        expand_rgb(&raw)
    } else {
        return Err(BufferSizeError {
            width,
            height,
            actual: raw.len(),
            expected_rgb,
            expected_rgba,
        });
    };

    Ok(CanonicalImage {
        width,
        height,
        data,
    })
}

fn expand_rgb(rgb: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
    for px in rgb.chunks_exact(3) {
        rgba.extend_from_slice(px);
        rgba.push(OPAQUE);
    }
    rgba
}
