//! Tract engine, pure Rust inference with no native dependencies

use super::InferenceEngine;
use crate::error::BackendError;
use instant::Instant;
use ndarray::Array4;
use std::path::Path;
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Optimised, runnable Tract model
#[derive(Debug)]
pub struct TractEngine {
    model: TractModel,
}

impl TractEngine {
    /// Load, optimise and make runnable a model file
    ///
    /// # Errors
    /// - Unreadable or invalid ONNX file
    /// - Graph optimisation failures
    pub fn from_file(path: &Path) -> Result<Self, BackendError> {
        let load_start = Instant::now();

        let model = onnx()
            .model_for_path(path)
            .map_err(|e| tract_error("Failed to load ONNX model", &e))?
            .into_optimized()
            .map_err(|e| tract_error("Failed to optimize model", &e))?
            .into_runnable()
            .map_err(|e| tract_error("Failed to create runnable model", &e))?;

        log::info!(
            "✅ Tract model ready: {} in {:.0}ms",
            path.display(),
            load_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(Self { model })
    }
}

fn tract_error(context: &str, err: &TractError) -> BackendError {
    BackendError::from_runtime_message(context, &err.to_string())
}

impl InferenceEngine for TractEngine {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>, BackendError> {
        let inference_start = Instant::now();
        log::debug!("🔮 Running Tract inference, input {:?}", input.shape());

        let input_tensor = Tensor::from(input.clone());
        let outputs = self
            .model
            .run(tvec![input_tensor.into()])
            .map_err(|e| tract_error("Tract inference failed", &e))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::runtime("No output tensor found"))?
            .into_arc_tensor();

        let output_view = output_tensor
            .to_array_view::<f32>()
            .map_err(|e| tract_error("Failed to convert output tensor", &e))?;

        let output = match output_view.shape() {
            [n, c, h, w] => Array4::from_shape_vec(
                (*n, *c, *h, *w),
                output_view.iter().copied().collect(),
            )
            .map_err(|e| BackendError::runtime(format!("Failed to reshape output tensor: {e}")))?,
            other => {
                return Err(BackendError::runtime(format!(
                    "Expected 4D output tensor, got {}D",
                    other.len()
                )))
            },
        };

        log::debug!(
            "✅ Tract inference completed in {:.2}ms, output {:?}",
            inference_start.elapsed().as_secs_f64() * 1000.0,
            output.dim()
        );

        Ok(output)
    }

    fn runtime_name(&self) -> &'static str {
        "tract"
    }
}
