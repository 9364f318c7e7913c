//! Backdrop compositing service
//!
//! Places a transparent-background image over a solid color canvas using the
//! standard "over" operator and encodes the result as PNG. Integer math keeps
//! the output deterministic: the same input and color always give the same
//! bytes.

use crate::{
    error::{BgReplaceError, Result},
    utils::BackdropColor,
};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, instrument};

/// Encoded final composite
#[derive(Debug, Clone)]
pub struct CompositeImage {
    /// PNG bytes
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl CompositeImage {
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Service for compositing foregrounds onto solid backdrops
pub struct Compositor;

impl Compositor {
    /// Composite `foreground` over a canvas of the same size filled with `color`
    ///
    /// Per channel: `out = fg * a + bg * (1 - a)`, rounded. The result is
    /// fully opaque.
    #[must_use]
    pub fn composite(foreground: &RgbaImage, color: BackdropColor) -> RgbaImage {
        let (width, height) = foreground.dimensions();
        let mut canvas = RgbaImage::from_pixel(width, height, color.to_rgba());

        for (out, fg) in canvas.pixels_mut().zip(foreground.pixels()) {
            let [fr, fg_g, fb, alpha] = fg.0;
            let [br, bg_g, bb, _] = out.0;
            out.0 = [
                blend(fr, br, alpha),
                blend(fg_g, bg_g, alpha),
                blend(fb, bb, alpha),
                255,
            ];
        }

        canvas
    }

    /// Decode the background-removed intermediate
    ///
    /// # Errors
    /// - `ImageDecode` when the bytes are not a decodable image
    pub fn decode_intermediate(bytes: &[u8]) -> Result<RgbaImage> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| BgReplaceError::ImageDecode(e.to_string()))?;
        debug!(
            width = image.width(),
            height = image.height(),
            color = ?image.color(),
            "Decoded intermediate"
        );
        Ok(image.to_rgba8())
    }

    /// Encode an image as PNG
    ///
    /// # Errors
    /// - `ImageEncode` on encoder failure
    pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .map_err(|e| BgReplaceError::ImageEncode(e.to_string()))?;
        Ok(buffer)
    }

    /// Decode, composite and encode in one go
    ///
    /// # Errors
    /// - `ImageDecode` / `ImageEncode`
    pub fn composite_bytes(intermediate: &[u8], color: BackdropColor) -> Result<CompositeImage> {
        let foreground = Self::decode_intermediate(intermediate)?;
        let composite = Self::composite(&foreground, color);
        let (width, height) = composite.dimensions();
        Ok(CompositeImage {
            png: Self::encode_png(&composite)?,
            width,
            height,
        })
    }

    /// Composite the intermediate stored at `path` off the async executor
    ///
    /// # Errors
    /// - Read failures
    /// - `ImageDecode` / `ImageEncode`
    #[instrument(skip(color), fields(color = %color))]
    pub async fn composite_file(path: &Path, color: BackdropColor) -> Result<CompositeImage> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| BgReplaceError::file_io_error("read intermediate", path, &e))?;

        tokio::task::spawn_blocking(move || Self::composite_bytes(&bytes, color))
            .await
            .map_err(|e| BgReplaceError::internal(format!("compositing task failed: {}", e)))?
    }
}

/// Round-to-nearest `(f * a + b * (255 - a)) / 255`
#[inline]
fn blend(foreground: u8, background: u8, alpha: u8) -> u8 {
    let a = u32::from(alpha);
    let value = u32::from(foreground) * a + u32::from(background) * (255 - a);
    ((value + 127) / 255) as u8
}
