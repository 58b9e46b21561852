//! Frame buffers.
//!
//! - `Frame`: decoded RGB image owned by whoever captured it.
//!
//! A capture loop owns its frame for one iteration. When a frame is offloaded the
//! dispatcher takes a full copy (`Clone`), so the loop can keep drawing on the original
//! while the copy is in flight.
//!
//! JPEG encode/decode goes through the `image` crate; no other codec is supported on
//! the wire.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, RgbImage};

/// Default JPEG quality used when the caller does not pick one.
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Decoded RGB frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    /// Build a frame from packed RGB8 pixels.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame pixel buffer is {} bytes, expected {} for {}x{} rgb",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("invalid {}x{} rgb buffer", width, height))?;
        Ok(Self { image })
    }

    /// Solid-colour frame.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, image::Rgb(rgb)),
        }
    }

    /// Decode an encoded image (JPEG on the wire, PNG accepted for local files).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("decode image")?;
        Ok(Self {
            image: image.into_rgb8(),
        })
    }

    /// Encode as baseline JPEG at `quality` (clamped to 1..=100).
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.image.len() / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode(
                self.image.as_raw(),
                self.width(),
                self.height(),
                ExtendedColorType::Rgb8,
            )
            .context("encode jpeg")?;
        Ok(out)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Packed RGB8 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x < self.width() && y < self.height() {
            Some(self.image.get_pixel(x, y).0)
        } else {
            None
        }
    }

    /// Write one pixel; coordinates outside the frame are ignored.
    pub fn put_pixel(&mut self, x: i64, y: i64, rgb: [u8; 3]) {
        if x < 0 || y < 0 {
            return;
        }
        let (x, y) = (x as u32, y as u32);
        if x < self.width() && y < self.height() {
            self.image.put_pixel(x, y, image::Rgb(rgb));
        }
    }

    /// Copy out the region `[left, right) x [top, bottom)`.
    ///
    /// Edges are clamped to `[0, dimension]` first, so boxes that reach past the frame
    /// still crop the visible part and the cropped pixels all lie in `[0, dimension)`.
    /// Returns `None` when nothing is left.
    pub fn crop(&self, left: i32, top: i32, right: i32, bottom: i32) -> Option<Frame> {
        let x0 = clamp_axis(left, self.width());
        let y0 = clamp_axis(top, self.height());
        let x1 = clamp_axis(right, self.width());
        let y1 = clamp_axis(bottom, self.height());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        let view = imageops::crop_imm(&self.image, x0, y0, x1 - x0, y1 - y0);
        Some(Self {
            image: view.to_image(),
        })
    }

    /// Rotate clockwise by a multiple of 90 degrees.
    pub fn rotate(&self, rotation: Rotation) -> Frame {
        let image = match rotation {
            Rotation::None => self.image.clone(),
            Rotation::Cw90 => imageops::rotate90(&self.image),
            Rotation::Cw180 => imageops::rotate180(&self.image),
            Rotation::Cw270 => imageops::rotate270(&self.image),
        };
        Self { image }
    }
}

/// Clockwise rotation requested by a client before detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    /// Parse a rotation in degrees. Accepts 0, 90, 180, 270 and -90.
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        match degrees {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Cw90),
            180 | -180 => Ok(Rotation::Cw180),
            270 | -90 => Ok(Rotation::Cw270),
            other => Err(anyhow!("unsupported rotation {} degrees", other)),
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }
}

// Exclusive ends may equal `dim`, so a box touching the edge keeps its last row/column.
fn clamp_axis(value: i32, dim: u32) -> u32 {
    if value <= 0 {
        return 0;
    }
    (value as u32).min(dim)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
