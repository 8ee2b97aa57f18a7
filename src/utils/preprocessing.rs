//! Tensor conversion for neural backends
//!
//! Images are stretched to the model's square working resolution, normalised
//! into an NCHW tensor, and the model's single-channel prediction is turned
//! back into a [`Mask`] at the original image size.

use crate::{error::BackendError, models::PreprocessingConfig, types::Image, types::Mask};
use image::{imageops::FilterType, GrayImage};
use ndarray::Array4;

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Resize to the working tile with Lanczos3 and normalise to `(1, 3, H, W)`
    #[must_use]
    pub fn to_tensor(image: &Image, config: &PreprocessingConfig) -> Array4<f32> {
        let [target_width, target_height] = config.target_size;
        let resized = image::imageops::resize(
            &image.to_rgb(),
            target_width,
            target_height,
            FilterType::Lanczos3,
        );

        let mut tensor =
            Array4::<f32>::zeros((1, 3, target_height as usize, target_width as usize));

        #[allow(clippy::indexing_slicing)]
        // Safe: tensor dimensions pre-allocated to match the resized tile
        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[0, channel, y as usize, x as usize]] = (f32::from(pixel[channel]) / 255.0
                    - config.normalization_mean[channel])
                    / config.normalization_std[channel];
            }
        }

        tensor
    }

    /// Turn the first output channel into a mask of `width` x `height`.
    ///
    /// Predictions are min-max stretched when they span a range and clamped
    /// to `[0, 1]` otherwise. Upscaling uses Lanczos3.
    ///
    /// # Errors
    /// - Empty tensor or zero channels
    /// - Non-finite values anywhere in the prediction
    pub fn tensor_to_mask(
        output: &Array4<f32>,
        width: u32,
        height: u32,
    ) -> Result<Mask, BackendError> {
        let (batch, channels, tile_height, tile_width) = output.dim();
        if batch == 0 || channels == 0 || tile_height == 0 || tile_width == 0 {
            return Err(BackendError::runtime(format!(
                "Model output has an empty dimension: {:?}",
                output.dim()
            )));
        }

        let prediction = output.slice(ndarray::s![0, 0, .., ..]);
        if prediction.iter().any(|v| !v.is_finite()) {
            return Err(BackendError::runtime("Model output contains non-finite values"));
        }

        let (min, max) = prediction
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = max - min;
        let stretch = range > 1e-6 && (min < 0.0 || max > 1.0 || range < 0.999);

        let mut tile = GrayImage::new(tile_width as u32, tile_height as u32);
        for ((y, x), &value) in prediction.indexed_iter() {
            let normalized = if stretch {
                (value - min) / range
            } else {
                value.clamp(0.0, 1.0)
            };
            tile.put_pixel(
                x as u32,
                y as u32,
                image::Luma([(normalized * 255.0).round() as u8]),
            );
        }

        Ok(Mask::from_luma(tile).resize(width, height))
    }
}
