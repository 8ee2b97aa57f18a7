//! Output encoding
//!
//! Keeps the choice of container and the encoder calls out of the pipeline.

use crate::{
    error::{CoreError, Result},
    types::{Image, Operation, OutputFormat, PixelFormat},
};
use image::codecs::jpeg::JpegEncoder;
use image::ImageFormat;
use std::io::Cursor;

/// Chooses and runs output encoders
pub struct OutputFormatHandler;

impl OutputFormatHandler {
    /// Container for the result of `operation`.
    ///
    /// Transparent results are always PNG; opaque results use `opaque_format`.
    #[must_use]
    pub fn select(operation: &Operation, opaque_format: OutputFormat) -> OutputFormat {
        if operation.produces_transparency() {
            OutputFormat::Png
        } else {
            opaque_format
        }
    }

    /// Encode `image` as `format`
    ///
    /// # Errors
    /// - JPEG requested for an image with an alpha channel
    /// - Encoder failures
    pub fn encode(image: &Image, format: OutputFormat, jpeg_quality: u8) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());

        match format {
            OutputFormat::Png => {
                image
                    .to_dynamic()
                    .write_to(&mut buffer, ImageFormat::Png)
                    .map_err(|e| CoreError::processing(format!("PNG encoding failed: {e}")))?;
            },
            OutputFormat::Jpeg => {
                if image.format() == PixelFormat::Rgba {
                    return Err(CoreError::processing(
                        "JPEG cannot carry transparency; composite onto a background first",
                    ));
                }
                let rgb = image.to_rgb();
                JpegEncoder::new_with_quality(&mut buffer, jpeg_quality.clamp(1, 100))
                    .encode_image(&rgb)
                    .map_err(|e| CoreError::processing(format!("JPEG encoding failed: {e}")))?;
            },
        }

        let bytes = buffer.into_inner();
        log::debug!(
            "📦 Encoded {}x{} as {} ({} bytes)",
            image.width(),
            image.height(),
            format.extension(),
            bytes.len()
        );
        Ok(bytes)
    }
}
