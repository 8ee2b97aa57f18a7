//! ONNX Runtime engine
//!
//! Sessions are built for small resident footprint: CPU only, a single
//! intra-op thread by default and no memory-pattern preallocation.

use super::{InferenceEngine, RuntimeOptions};
use crate::error::BackendError;
use instant::Instant;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::path::Path;

/// ONNX Runtime session wrapper
#[derive(Debug)]
pub struct OnnxEngine {
    session: Session,
}

impl OnnxEngine {
    /// Build a session from a model file on disk
    ///
    /// # Errors
    /// - Session builder configuration failures
    /// - Invalid or unreadable model file
    pub fn from_file(path: &Path, options: &RuntimeOptions) -> Result<Self, BackendError> {
        let load_start = Instant::now();

        let intra_threads = if options.intra_threads > 0 {
            options.intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(1)
        };

        let session = Session::builder()
            .map_err(|e| runtime_error("Failed to create session builder", &e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| runtime_error("Failed to set optimization level", &e))?
            .with_intra_threads(intra_threads)
            .map_err(|e| runtime_error("Failed to set intra threads", &e))?
            .with_inter_threads(1)
            .map_err(|e| runtime_error("Failed to set inter threads", &e))?
            .with_memory_pattern(!options.memory_lean)
            .map_err(|e| runtime_error("Failed to configure memory pattern", &e))?
            .commit_from_file(path)
            .map_err(|e| runtime_error("Failed to create session from model file", &e))?;

        log::info!(
            "✅ ONNX Runtime session ready: {} ({} intra thread(s), memory lean: {}) in {:.0}ms",
            path.display(),
            intra_threads,
            options.memory_lean,
            load_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(Self { session })
    }
}

fn runtime_error<E: std::fmt::Display>(context: &str, err: &E) -> BackendError {
    BackendError::from_runtime_message(context, &err.to_string())
}

impl InferenceEngine for OnnxEngine {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>, BackendError> {
        let inference_start = Instant::now();
        log::debug!("🚀 Starting ONNX inference with input shape: {:?}", input.dim());

        let input_value = Value::from_array(input.clone())
            .map_err(|e| runtime_error("Failed to convert input tensor", &e))?;

        let outputs = self
            .session
            .run(ort::inputs![input_value])
            .map_err(|e| runtime_error("ONNX inference failed", &e))?;

        // First output holds the finest-resolution prediction for u2net/isnet
        let keys: Vec<_> = outputs.keys().collect();
        let first_key = keys
            .first()
            .ok_or_else(|| BackendError::runtime("No output tensors found"))?;
        let output_tensor = outputs
            .get(first_key)
            .ok_or_else(|| BackendError::runtime("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| runtime_error("Failed to extract output tensor", &e))?;

        let shape = output_tensor.shape().to_vec();
        let output = match shape.as_slice() {
            [n, c, h, w] => Array4::from_shape_vec(
                (*n, *c, *h, *w),
                output_tensor.iter().copied().collect(),
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
            "📊 ONNX inference complete: {:.2}ms, output {:?}",
            inference_start.elapsed().as_secs_f64() * 1000.0,
            output.dim()
        );

        Ok(output)
    }

    fn runtime_name(&self) -> &'static str {
        "onnx"
    }
}
