//! Last-resort backend: keep everything, soften the border

use super::{ensure_non_empty, BackendDescriptor, BackendKind, SegmentationBackend};
use crate::error::BackendError;
use crate::session::Session;
use crate::types::{Image, Mask};

/// Opacity at the very edge of the image
const EDGE_OPACITY: f32 = 0.3;

/// Full-opacity mask with a border band ramping down to 30% at the edge
#[derive(Debug, Clone)]
pub struct EdgeHeuristicBackend {
    descriptor: BackendDescriptor,
}

impl EdgeHeuristicBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            descriptor: BackendKind::EdgeHeuristic.descriptor(),
        }
    }

    fn band_width(width: u32, height: u32) -> u32 {
        width.min(height) / 20
    }
}

impl Default for EdgeHeuristicBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentationBackend for EdgeHeuristicBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn compute_mask(
        &self,
        image: &Image,
        _session: Option<&Session>,
    ) -> Result<Mask, BackendError> {
        ensure_non_empty(image)?;

        let (width, height) = image.dimensions();
        let band = Self::band_width(width, height);
        if band == 0 {
            return Ok(Mask::filled(width, height, 255));
        }

        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let distance = x.min(y).min(width - 1 - x).min(height - 1 - y);
                let value = if distance >= band {
                    255
                } else {
                    let t = distance as f32 / band as f32;
                    ((EDGE_OPACITY + (1.0 - EDGE_OPACITY) * t) * 255.0).round() as u8
                };
                data.push(value);
            }
        }

        Mask::new(width, height, data).map_err(|e| BackendError::runtime(e.to_string()))
    }
}
