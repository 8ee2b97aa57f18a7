//! Neural segmentation through a leased runtime session

use super::{ensure_non_empty, BackendDescriptor, SegmentationBackend};
use crate::error::BackendError;
use crate::models::{NeuralModelSpec, STANDARD_MODEL, TINY_MODEL};
use crate::session::Session;
use crate::types::{Image, Mask};
use crate::utils::ImagePreprocessor;
use instant::Instant;

/// Runs one of the neural models on a session supplied by the caller.
///
/// The backend itself is stateless: the model lives in the [`Session`], which
/// is owned by the [`crate::session::SessionManager`].
#[derive(Debug, Clone)]
pub struct NeuralBackend {
    descriptor: BackendDescriptor,
    model: NeuralModelSpec,
}

impl NeuralBackend {
    /// Small, fast model with a 320px working tile
    #[must_use]
    pub fn tiny() -> Self {
        Self::for_model(TINY_MODEL)
    }

    /// Higher quality model with a 1024px working tile
    #[must_use]
    pub fn standard() -> Self {
        Self::for_model(STANDARD_MODEL)
    }

    fn for_model(model: NeuralModelSpec) -> Self {
        Self {
            descriptor: model.kind.descriptor(),
            model,
        }
    }

    #[must_use]
    pub fn model(&self) -> &NeuralModelSpec {
        &self.model
    }
}

impl SegmentationBackend for NeuralBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn compute_mask(&self, image: &Image, session: Option<&Session>) -> Result<Mask, BackendError> {
        ensure_non_empty(image)?;

        let session = session.ok_or_else(|| {
            BackendError::resource_exhausted(format!(
                "{} needs a loaded session and none was provided",
                self.descriptor.name
            ))
        })?;

        if session.kind() != self.descriptor.kind {
            return Err(BackendError::runtime(format!(
                "session #{} holds {} but {} was requested",
                session.id(),
                session.kind(),
                self.descriptor.kind
            )));
        }

        let start = Instant::now();
        let input = ImagePreprocessor::to_tensor(image, &self.model.preprocessing);
        let output = session.run(&input)?;

        let [tile_width, tile_height] = self.model.preprocessing.target_size;
        let (batch, channels, out_height, out_width) = output.dim();
        if batch == 0
            || channels == 0
            || out_height != tile_height as usize
            || out_width != tile_width as usize
        {
            return Err(BackendError::runtime(format!(
                "{} produced output of shape {:?}, expected (1, 1, {}, {})",
                self.model.model_name,
                output.dim(),
                tile_height,
                tile_width
            )));
        }

        let mask = ImagePreprocessor::tensor_to_mask(&output, image.width(), image.height())?;

        log::debug!(
            "🧠 {} mask via {} ({}) in {:.0}ms",
            self.model.model_name,
            session.runtime_name(),
            self.descriptor.name,
            start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(mask)
    }
}
