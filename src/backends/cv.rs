//! Classical segmentation without a model
//!
//! A downscaled analysis copy of the image is inspected once to pick one of
//! three strategies, the strategy produces a binary foreground raster, and the
//! raster is feathered and upscaled back to the input size.

use super::{ensure_non_empty, BackendDescriptor, BackendKind, SegmentationBackend};
use crate::error::BackendError;
use crate::session::Session;
use crate::types::{Image, Mask};
use crate::utils::raster::{color_distance, corner_pixels, gradient_magnitude, BinaryRaster};
use image::imageops::FilterType;
use image::RgbImage;
use serde::Serialize;

/// Classical strategy chosen for one image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CvStrategy {
    /// Corners share one colour: threshold on distance from it
    ColorThreshold,
    /// Busy image: grow the background inwards from the border
    RegionGrowing,
    /// Calm but varied image: fill the largest edge-enclosed region
    EdgeContour,
}

/// Statistics the strategy choice is based on
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CvAnalysis {
    /// Fraction of pixels on a strong edge
    pub edge_density: f32,
    /// Spread of corner colours around their mean
    pub corner_spread: f32,
    /// Mean corner colour
    pub background_estimate: [f32; 3],
}

/// Session-less classical backend
#[derive(Debug, Clone)]
pub struct ComputerVisionBackend {
    descriptor: BackendDescriptor,
    analysis_size: u32,
    uniform_corner_spread: f32,
    edge_density_threshold: f32,
    strong_edge_magnitude: f32,
    color_tolerance: f32,
    feather_sigma: f32,
}

impl ComputerVisionBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptor: BackendKind::ComputerVision.descriptor(),
            analysis_size: 256,
            uniform_corner_spread: 20.0,
            edge_density_threshold: 0.1,
            strong_edge_magnitude: 100.0,
            color_tolerance: 40.0,
            feather_sigma: 1.5,
        }
    }

    fn analysis_copy(&self, image: &Image) -> RgbImage {
        let rgb = image.to_rgb();
        let (width, height) = rgb.dimensions();
        let longest = width.max(height);
        if longest <= self.analysis_size {
            return rgb;
        }
        let scale = f64::from(self.analysis_size) / f64::from(longest);
        let new_width = ((f64::from(width) * scale).round() as u32).max(1);
        let new_height = ((f64::from(height) * scale).round() as u32).max(1);
        image::imageops::resize(&rgb, new_width, new_height, FilterType::Triangle)
    }

    /// Edge density and corner statistics of an analysis copy
    #[must_use]
    pub fn analyze(&self, small: &RgbImage) -> CvAnalysis {
        let (width, height) = small.dimensions();
        let corner_size = (width.min(height) / 10).clamp(1, 50);
        let corners = corner_pixels(small, corner_size);

        let count = corners.len().max(1) as f32;
        let mut mean = [0.0_f32; 3];
        for pixel in &corners {
            for (acc, &v) in mean.iter_mut().zip(pixel.iter()) {
                *acc += f32::from(v);
            }
        }
        for acc in &mut mean {
            *acc /= count;
        }

        let variance = corners
            .iter()
            .map(|&pixel| color_distance(pixel, mean).powi(2))
            .sum::<f32>()
            / count;

        let gray = image::imageops::grayscale(small);
        let magnitudes = gradient_magnitude(&gray);
        let strong = magnitudes
            .iter()
            .filter(|&&m| m > self.strong_edge_magnitude)
            .count();

        CvAnalysis {
            edge_density: strong as f32 / magnitudes.len().max(1) as f32,
            corner_spread: variance.sqrt(),
            background_estimate: mean,
        }
    }

    /// Deterministic strategy choice for `image`
    #[must_use]
    pub fn select_strategy(&self, image: &Image) -> CvStrategy {
        let analysis = self.analyze(&self.analysis_copy(image));
        self.strategy_for(&analysis)
    }

    fn strategy_for(&self, analysis: &CvAnalysis) -> CvStrategy {
        if analysis.corner_spread < self.uniform_corner_spread {
            CvStrategy::ColorThreshold
        } else if analysis.edge_density > self.edge_density_threshold {
            CvStrategy::RegionGrowing
        } else {
            CvStrategy::EdgeContour
        }
    }

    fn color_threshold(&self, small: &RgbImage, analysis: &CvAnalysis) -> BinaryRaster {
        let threshold = self.color_tolerance.max(analysis.corner_spread * 1.5);
        let (width, height) = small.dimensions();
        BinaryRaster::from_fn(width, height, |x, y| {
            color_distance(small.get_pixel(x, y).0, analysis.background_estimate) > threshold
        })
        .close(2)
        .open(2)
    }

    fn region_growing(&self, small: &RgbImage, analysis: &CvAnalysis) -> BinaryRaster {
        let (width, height) = small.dimensions();
        let margin_x = width / 5;
        let margin_y = height / 5;
        let in_subject_rect = |x: u32, y: u32| {
            x >= margin_x && x < width - margin_x && y >= margin_y && y < height - margin_y
        };

        // The central rectangle is assumed to hold the subject, so growing into it needs a
        // closer colour match
        let outer_tolerance = self.color_tolerance.max(analysis.corner_spread);
        let inner_tolerance = self.color_tolerance * 0.5;

        let background = BinaryRaster::flood_from_border(width, height, |x, y| {
            let tolerance = if in_subject_rect(x, y) {
                inner_tolerance
            } else {
                outer_tolerance
            };
            color_distance(small.get_pixel(x, y).0, analysis.background_estimate) < tolerance
        });

        background.invert().close(2).largest_component()
    }

    fn edge_contour(&self, small: &RgbImage) -> BinaryRaster {
        let (width, height) = small.dimensions();
        let gray = image::imageops::blur(&image::imageops::grayscale(small), 1.0);
        let magnitudes = gradient_magnitude(&gray);

        let mean = magnitudes.iter().sum::<f32>() / magnitudes.len().max(1) as f32;
        let threshold = (mean * 2.0).max(30.0);

        let edges = BinaryRaster::from_fn(width, height, |x, y| {
            magnitudes
                .get(y as usize * width as usize + x as usize)
                .is_some_and(|&m| m > threshold)
        })
        .dilate(1);

        let outside = BinaryRaster::flood_from_border(width, height, |x, y| !edges.get(x, y));
        outside.invert().largest_component()
    }

    fn ellipse(width: u32, height: u32) -> BinaryRaster {
        let cx = f64::from(width) / 2.0;
        let cy = f64::from(height) / 2.0;
        let rx = (f64::from(width) / 3.0).max(1.0);
        let ry = (f64::from(height) / 3.0).max(1.0);
        BinaryRaster::from_fn(width, height, |x, y| {
            let dx = (f64::from(x) + 0.5 - cx) / rx;
            let dy = (f64::from(y) + 0.5 - cy) / ry;
            dx * dx + dy * dy <= 1.0
        })
    }
}

impl Default for ComputerVisionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentationBackend for ComputerVisionBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn compute_mask(
        &self,
        image: &Image,
        _session: Option<&Session>,
    ) -> Result<Mask, BackendError> {
        ensure_non_empty(image)?;

        let small = self.analysis_copy(image);
        let analysis = self.analyze(&small);
        let strategy = self.strategy_for(&analysis);

        log::debug!(
            "🔍 CV analysis: edge density {:.3}, corner spread {:.1} → {:?}",
            analysis.edge_density,
            analysis.corner_spread,
            strategy
        );

        let mut foreground = match strategy {
            CvStrategy::ColorThreshold => self.color_threshold(&small, &analysis),
            CvStrategy::RegionGrowing => self.region_growing(&small, &analysis),
            CvStrategy::EdgeContour => self.edge_contour(&small),
        };

        let (width, height) = small.dimensions();
        let min_pixels = (width as usize * height as usize) / 100;
        if foreground.count() <= min_pixels {
            log::debug!("⚪ {:?} found no subject, using centred ellipse", strategy);
            foreground = Self::ellipse(width, height);
        }

        let feathered = image::imageops::blur(&foreground.to_gray(), self.feather_sigma);
        Ok(Mask::from_luma(feathered).resize(image.width(), image.height()))
    }
}
