//! Core data types: image buffers, masks, operations and results

use crate::backends::BackendKind;
use crate::color::RgbColor;
use crate::error::{CoreError, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, RgbImage, RgbaImage};
use instant::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Pixel layout of an [`Image`] buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb,
    Rgba,
}

impl PixelFormat {
    /// Number of interleaved channels per pixel
    #[must_use]
    pub fn channels(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }
}

/// Decoded, immutable pixel buffer.
///
/// The buffer length always equals `width * height * channels`. Every
/// transform returns a new `Image`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Image {
    /// Build an image from raw interleaved bytes
    ///
    /// # Errors
    /// - Buffer length does not match `width * height * channels`
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(format.channels()))
            .ok_or_else(|| CoreError::unsupported_input("Image dimensions overflow"))?;

        if data.len() != expected {
            return Err(CoreError::unsupported_input(format!(
                "Buffer length {} does not match {}x{} {:?} ({} bytes expected)",
                data.len(),
                width,
                height,
                format,
                expected
            )));
        }

        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    /// Solid RGB image, mostly useful for synthetic inputs
    #[must_use]
    pub fn filled(width: u32, height: u32, color: RgbColor) -> Self {
        let rgb = RgbImage::from_pixel(width, height, image::Rgb(color.to_array()));
        Self::from_rgb(rgb)
    }

    #[must_use]
    pub fn from_rgb(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            format: PixelFormat::Rgb,
            data: image.into_raw(),
        }
    }

    #[must_use]
    pub fn from_rgba(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            format: PixelFormat::Rgba,
            data: image.into_raw(),
        }
    }

    /// Convert a decoded image, keeping alpha only when the source has it
    #[must_use]
    pub fn from_dynamic(image: &DynamicImage) -> Self {
        if image.color().has_alpha() {
            Self::from_rgba(image.to_rgba8())
        } else {
            Self::from_rgb(image.to_rgb8())
        }
    }

    /// Decode encoded bytes (format is sniffed)
    ///
    /// # Errors
    /// - Undecodable bytes or unknown container format
    /// - Zero-sized image
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes)?;
        let image = Self::from_dynamic(&decoded);
        if image.is_empty() {
            return Err(CoreError::unsupported_input("Decoded image has zero size"));
        }
        Ok(image)
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Largest side in pixels
    #[must_use]
    pub fn max_dimension(&self) -> u32 {
        self.width.max(self.height)
    }

    /// RGB copy of the pixels; alpha is dropped
    #[must_use]
    pub fn to_rgb(&self) -> RgbImage {
        match self.format {
            PixelFormat::Rgb => {
                RgbImage::from_raw(self.width, self.height, self.data.clone()).unwrap_or_default()
            },
            PixelFormat::Rgba => {
                let mut rgb = RgbImage::new(self.width, self.height);
                for (dst, src) in rgb.pixels_mut().zip(self.data.chunks_exact(4)) {
                    if let [r, g, b, _] = *src {
                        *dst = image::Rgb([r, g, b]);
                    }
                }
                rgb
            },
        }
    }

    /// RGBA copy of the pixels; opaque alpha is added for RGB sources
    #[must_use]
    pub fn to_rgba(&self) -> RgbaImage {
        match self.format {
            PixelFormat::Rgba => {
                RgbaImage::from_raw(self.width, self.height, self.data.clone()).unwrap_or_default()
            },
            PixelFormat::Rgb => {
                let mut rgba = RgbaImage::new(self.width, self.height);
                for (dst, src) in rgba.pixels_mut().zip(self.data.chunks_exact(3)) {
                    if let [r, g, b] = *src {
                        *dst = image::Rgba([r, g, b, 255]);
                    }
                }
                rgba
            },
        }
    }

    #[must_use]
    pub fn to_dynamic(&self) -> DynamicImage {
        match self.format {
            PixelFormat::Rgb => DynamicImage::ImageRgb8(self.to_rgb()),
            PixelFormat::Rgba => DynamicImage::ImageRgba8(self.to_rgba()),
        }
    }

    /// Downscale so that neither side exceeds `max_dimension`, preserving
    /// aspect ratio. Images already within bounds are returned unchanged.
    #[must_use]
    pub fn fit_within(&self, max_dimension: u32) -> Self {
        if max_dimension == 0 || self.max_dimension() <= max_dimension {
            return self.clone();
        }

        let scale = f64::from(max_dimension) / f64::from(self.max_dimension());
        let new_width = ((f64::from(self.width) * scale).round() as u32).max(1);
        let new_height = ((f64::from(self.height) * scale).round() as u32).max(1);

        log::debug!(
            "📐 Downscaling {}x{} → {}x{} (max dimension {})",
            self.width,
            self.height,
            new_width,
            new_height,
            max_dimension
        );

        match self.format {
            PixelFormat::Rgb => Self::from_rgb(image::imageops::resize(
                &self.to_rgb(),
                new_width,
                new_height,
                FilterType::Triangle,
            )),
            PixelFormat::Rgba => Self::from_rgba(image::imageops::resize(
                &self.to_rgba(),
                new_width,
                new_height,
                FilterType::Triangle,
            )),
        }
    }
}

/// Single-channel foreground confidence raster (0 = background, 255 = foreground)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Mask {
    /// Create a mask from raw values
    ///
    /// # Errors
    /// - Buffer length does not match `width * height`
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(CoreError::processing(format!(
                "Mask buffer length {} does not match {}x{}",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Uniform mask
    #[must_use]
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
        }
    }

    #[must_use]
    pub fn from_luma(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            data: image.into_raw(),
        }
    }

    #[must_use]
    pub fn to_luma(&self) -> GrayImage {
        ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Value at `(x, y)`, `None` outside the raster
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Resize with Lanczos3 so mask edges stay smooth
    #[must_use]
    pub fn resize(&self, new_width: u32, new_height: u32) -> Self {
        if (new_width, new_height) == self.dimensions() {
            return self.clone();
        }
        let resized = image::imageops::resize(
            &self.to_luma(),
            new_width,
            new_height,
            FilterType::Lanczos3,
        );
        Self::from_luma(resized)
    }

    /// Foreground/background split at the 50% threshold
    #[must_use]
    pub fn statistics(&self) -> MaskStatistics {
        let total_pixels = self.data.len();
        let foreground_pixels = self.data.iter().filter(|&&v| v > 127).count();
        let foreground_ratio = if total_pixels == 0 {
            0.0
        } else {
            foreground_pixels as f32 / total_pixels as f32
        };

        MaskStatistics {
            total_pixels,
            foreground_pixels,
            background_pixels: total_pixels - foreground_pixels,
            foreground_ratio,
        }
    }
}

/// Mask coverage summary, logged after segmentation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MaskStatistics {
    pub total_pixels: usize,
    pub foreground_pixels: usize,
    pub background_pixels: usize,
    pub foreground_ratio: f32,
}

/// What to do with the background once a mask is known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    /// Transparent background; output keeps an alpha channel
    RemoveBackground,
    /// Flat colour background; output is opaque
    RecolorBackground { color: RgbColor },
    /// Vertical gradient background from `top` to `bottom`; output is opaque
    GradientBackground { top: RgbColor, bottom: RgbColor },
    /// Photo background, resized to the image; output is opaque
    #[serde(skip)]
    ImageBackground { background: Arc<RgbImage> },
}

impl Operation {
    /// Background replacement with a decoded photo, kept as RGB
    #[must_use]
    pub fn image_background(background: &DynamicImage) -> Self {
        Self::ImageBackground {
            background: Arc::new(background.to_rgb8()),
        }
    }

    /// Whether the composited output carries transparency
    #[must_use]
    pub fn produces_transparency(&self) -> bool {
        matches!(self, Self::RemoveBackground)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RemoveBackground => "remove_background",
            Self::RecolorBackground { .. } => "recolor_background",
            Self::GradientBackground { .. } => "gradient_background",
            Self::ImageBackground { .. } => "image_background",
        }
    }
}

/// Encoded output container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpeg,
}

impl OutputFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }

    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    #[must_use]
    pub fn supports_transparency(self) -> bool {
        matches!(self, Self::Png)
    }
}

/// Mask plus which backend produced it
#[derive(Debug, Clone)]
pub struct SegmentationOutcome {
    pub mask: Mask,
    pub backend: BackendKind,
    /// Candidates tried, including the successful one
    pub attempts: usize,
    pub elapsed: Duration,
}

/// Successful result of [`crate::SegmentationService::process`]
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub backend: BackendKind,
    pub attempts: usize,
    pub elapsed: Duration,
}

impl ProcessedImage {
    /// Write the encoded bytes to disk
    ///
    /// # Errors
    /// - Filesystem errors
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, &self.bytes)?;
        Ok(())
    }
}
