//! Mask application
//!
//! Turns an image plus its mask into the final pixels: a transparent cut-out
//! or the foreground blended over a replacement background (flat colour,
//! vertical gradient or a photo).

use crate::color::RgbColor;
use crate::error::{CoreError, Result};
use crate::types::{Image, Mask, Operation};
use image::imageops::{self, FilterType};
use image::{RgbImage, RgbaImage};

/// Stateless mask compositor
pub struct Compositor;

impl Compositor {
    /// Apply `operation` to `image` using `mask`.
    ///
    /// # Errors
    /// - [`CoreError::ProcessingFailure`] when mask and image sizes disagree
    ///   (debug builds panic instead)
    pub fn apply(image: &Image, mask: &Mask, operation: &Operation) -> Result<Image> {
        match operation {
            Operation::RemoveBackground => Self::remove_background(image, mask),
            Operation::RecolorBackground { color } => Self::recolor_background(image, mask, *color),
            Operation::GradientBackground { top, bottom } => {
                Self::gradient_background(image, mask, *top, *bottom)
            },
            Operation::ImageBackground { background } => {
                Self::image_background(image, mask, background)
            },
        }
    }

    /// RGBA output with alpha taken from the mask, capped by any existing alpha
    ///
    /// # Errors
    /// - [`CoreError::ProcessingFailure`] on a size mismatch
    pub fn remove_background(image: &Image, mask: &Mask) -> Result<Image> {
        Self::check_dimensions(image, mask)?;

        let source = image.to_rgba();
        let (width, height) = source.dimensions();
        let alpha_mask = mask.as_bytes();

        let result = RgbaImage::from_fn(width, height, |x, y| {
            let pixel = source.get_pixel(x, y);
            let index = y as usize * width as usize + x as usize;
            let m = alpha_mask.get(index).copied().unwrap_or(0);
            let alpha = m.min(pixel[3]);
            if alpha == 0 {
                image::Rgba([0, 0, 0, 0])
            } else {
                image::Rgba([pixel[0], pixel[1], pixel[2], alpha])
            }
        });

        Ok(Image::from_rgba(result))
    }

    /// Opaque RGB output over a flat colour
    ///
    /// # Errors
    /// - [`CoreError::ProcessingFailure`] on a size mismatch
    pub fn recolor_background(image: &Image, mask: &Mask, color: RgbColor) -> Result<Image> {
        Self::composite(image, mask, |_, _| color.to_array())
    }

    /// Opaque RGB output over a top-to-bottom linear gradient
    ///
    /// # Errors
    /// - [`CoreError::ProcessingFailure`] on a size mismatch
    pub fn gradient_background(
        image: &Image,
        mask: &Mask,
        top: RgbColor,
        bottom: RgbColor,
    ) -> Result<Image> {
        let height = image.height().max(1) as f32;
        let rows: Vec<[u8; 3]> = (0..image.height())
            .map(|y| {
                let ratio = y as f32 / height;
                let lerp = |a: u8, b: u8| {
                    (f32::from(a) + (f32::from(b) - f32::from(a)) * ratio).round() as u8
                };
                [lerp(top.r, bottom.r), lerp(top.g, bottom.g), lerp(top.b, bottom.b)]
            })
            .collect();

        Self::composite(image, mask, |_, y| {
            rows.get(y as usize).copied().unwrap_or(top.to_array())
        })
    }

    /// Opaque RGB output over `background`, Lanczos-resized to the image size
    ///
    /// # Errors
    /// - [`CoreError::ProcessingFailure`] on a size mismatch or an empty background
    pub fn image_background(image: &Image, mask: &Mask, background: &RgbImage) -> Result<Image> {
        if background.width() == 0 || background.height() == 0 {
            return Err(CoreError::processing("background image is empty"));
        }

        let (width, height) = image.dimensions();
        let resized;
        let background = if background.dimensions() == (width, height) {
            background
        } else {
            log::debug!(
                "Resizing background {}x{} to {}x{}",
                background.width(),
                background.height(),
                width,
                height
            );
            resized = imageops::resize(background, width, height, FilterType::Lanczos3);
            &resized
        };

        Self::composite(image, mask, |x, y| background.get_pixel(x, y).0)
    }

    /// `out = fg * w + bg * (1 - w)` per channel, `w` = mask capped by source alpha
    fn composite<F>(image: &Image, mask: &Mask, background_at: F) -> Result<Image>
    where
        F: Fn(u32, u32) -> [u8; 3],
    {
        Self::check_dimensions(image, mask)?;

        let source = image.to_rgba();
        let (width, height) = source.dimensions();
        let weights = mask.as_bytes();
        let mut result = RgbImage::new(width, height);

        for y in 0..height {
            for x in 0..width {
                let background = background_at(x, y);
                let pixel = source.get_pixel(x, y);
                let index = y as usize * width as usize + x as usize;
                let weight = weights.get(index).copied().unwrap_or(0).min(pixel[3]);

                let w = f32::from(weight) / 255.0;
                let mut out = [0_u8; 3];
                for (channel, value) in out.iter_mut().enumerate() {
                    let fg = f32::from(pixel[channel]);
                    let bg = f32::from(background[channel]);
                    *value = (fg * w + bg * (1.0 - w)).round().clamp(0.0, 255.0) as u8;
                }
                result.put_pixel(x, y, image::Rgb(out));
            }
        }

        Ok(Image::from_rgb(result))
    }

    fn check_dimensions(image: &Image, mask: &Mask) -> Result<()> {
        debug_assert_eq!(
            image.dimensions(),
            mask.dimensions(),
            "mask size must match image size"
        );
        if image.dimensions() != mask.dimensions() {
            log::error!(
                "❌ Mask {}x{} does not match image {}x{}",
                mask.width(),
                mask.height(),
                image.width(),
                image.height()
            );
            return Err(CoreError::processing(format!(
                "mask is {}x{} but image is {}x{}",
                mask.width(),
                mask.height(),
                image.width(),
                image.height()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> Image {
        Image::from_rgb(RgbImage::from_fn(6, 4, |x, y| {
            image::Rgb([(x * 40) as u8, (y * 60) as u8, 128])
        }))
    }

    #[test]
    fn test_remove_background_alpha_equals_mask() {
        let image = sample_image();
        let mask = Mask::new(6, 4, (0..24).map(|i| (i * 10) as u8).collect()).unwrap();
        let out = Compositor::remove_background(&image, &mask).unwrap().to_rgba();

        assert_eq!(out.get_pixel(5, 3)[3], 230);
        assert_eq!(out.get_pixel(0, 0)[3], 0);
        assert_eq!(out.get_pixel(5, 3)[0], 200);
    }

    #[test]
    fn test_recolor_with_opaque_mask_is_identity() {
        let image = sample_image();
        let mask = Mask::filled(6, 4, 255);
        let out = Compositor::recolor_background(&image, &mask, RgbColor::new(1, 2, 3)).unwrap();
        assert_eq!(out.to_rgb(), image.to_rgb());
    }

    #[test]
    fn test_recolor_with_empty_mask_is_flat() {
        let image = sample_image();
        let color = RgbColor::new(12, 200, 99);
        let out = Compositor::recolor_background(&image, &Mask::filled(6, 4, 0), color).unwrap();
        assert!(out.to_rgb().pixels().all(|p| p.0 == [12, 200, 99]));
    }

    #[test]
    fn test_recolor_blends_half_mask() {
        let image = Image::filled(2, 2, RgbColor::new(200, 0, 100));
        let out = Compositor::recolor_background(&image, &Mask::filled(2, 2, 128), RgbColor::WHITE)
            .unwrap()
            .to_rgb();
        let pixel = out.get_pixel(0, 0).0;
        assert!((i32::from(pixel[0]) - 227).abs() <= 1);
        assert!((i32::from(pixel[1]) - 127).abs() <= 1);
    }

    #[test]
    fn test_gradient_runs_top_to_bottom() {
        let image = Image::filled(3, 10, RgbColor::WHITE);
        let out = Compositor::gradient_background(
            &image,
            &Mask::filled(3, 10, 0),
            RgbColor::new(0, 0, 0),
            RgbColor::new(200, 100, 50),
        )
        .unwrap()
        .to_rgb();

        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(0, 5).0, [100, 50, 25]);
        assert!(out.get_pixel(0, 9)[0] < 200);
    }

    fn soft_mask() -> Mask {
        let levels = [0_u8, 1, 76, 128, 254, 255];
        Mask::new(6, 4, (0..24).map(|i| levels[i % levels.len()]).collect()).unwrap()
    }

    #[test]
    fn test_remove_is_idempotent_on_cut_out() {
        let image = sample_image();
        let mask = soft_mask();

        let once = Compositor::remove_background(&image, &mask).unwrap();
        let twice = Compositor::remove_background(&once, &mask).unwrap();
        assert_eq!(once.to_rgba(), twice.to_rgba());

        let alphas: Vec<u8> = once.to_rgba().pixels().map(|p| p[3]).collect();
        assert_eq!(alphas, mask.as_bytes());
    }

    #[test]
    fn test_source_alpha_caps_the_mask() {
        let source = RgbaImage::from_fn(6, 1, |x, _| image::Rgba([90, 90, 90, (x * 50) as u8]));
        let image = Image::from_rgba(source);
        let out = Compositor::remove_background(&image, &Mask::filled(6, 1, 120)).unwrap();

        let alphas: Vec<u8> = out.to_rgba().pixels().map(|p| p[3]).collect();
        assert_eq!(alphas, vec![0, 50, 100, 120, 120, 120]);
    }

    #[test]
    fn test_blending_a_cut_out_matches_blending_the_source() {
        let image = sample_image();
        let mask = soft_mask();
        let cut_out = Compositor::remove_background(&image, &mask).unwrap();

        let color = RgbColor::new(10, 220, 40);
        let direct = Compositor::recolor_background(&image, &mask, color).unwrap();
        let via_cut_out = Compositor::recolor_background(&cut_out, &mask, color).unwrap();
        assert_eq!(direct.to_rgb(), via_cut_out.to_rgb());

        let (top, bottom) = (RgbColor::WHITE, RgbColor::new(0, 0, 0));
        let direct = Compositor::gradient_background(&image, &mask, top, bottom).unwrap();
        let via_cut_out = Compositor::gradient_background(&cut_out, &mask, top, bottom).unwrap();
        assert_eq!(direct.to_rgb(), via_cut_out.to_rgb());
    }

    #[test]
    fn test_image_background_is_resized_and_blended() {
        let image = Image::filled(4, 4, RgbColor::new(200, 10, 10));
        let background = RgbImage::from_pixel(9, 7, image::Rgb([0, 0, 250]));
        let mask = Mask::new(4, 4, (0..16).map(|i| if i < 8 { 255 } else { 0 }).collect()).unwrap();

        let out = Compositor::image_background(&image, &mask, &background).unwrap().to_rgb();

        assert_eq!(out.dimensions(), (4, 4));
        assert_eq!(out.get_pixel(0, 0).0, [200, 10, 10]);
        assert_eq!(out.get_pixel(3, 3).0, [0, 0, 250]);
    }

    #[test]
    fn test_empty_background_image_is_rejected() {
        let image = Image::filled(2, 2, RgbColor::WHITE);
        let result =
            Compositor::image_background(&image, &Mask::filled(2, 2, 0), &RgbImage::new(0, 0));
        assert!(matches!(result, Err(CoreError::ProcessingFailure(_))));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "mask size must match image size")]
    fn test_dimension_mismatch_panics_in_debug() {
        let _ = Compositor::remove_background(&sample_image(), &Mask::filled(3, 3, 255));
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_dimension_mismatch_is_processing_failure_in_release() {
        let result = Compositor::remove_background(&sample_image(), &Mask::filled(3, 3, 255));
        assert!(matches!(result, Err(CoreError::ProcessingFailure(_))));
    }
}
