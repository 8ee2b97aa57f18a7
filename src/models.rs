//! Neural model catalog
//!
//! Maps each neural backend to the ONNX file it runs and the tensor layout the
//! model expects. Model files live in a single directory resolved from an
//! explicit path, `PIXPORT_MODEL_DIR`, or the user cache directory.

use crate::backends::BackendKind;
use crate::error::{CoreError, Result, SessionError};
use std::path::{Path, PathBuf};

/// Environment variable overriding the model directory
pub const MODEL_DIR_ENV: &str = "PIXPORT_MODEL_DIR";

/// Tensor preparation parameters for one model
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PreprocessingConfig {
    /// Square working resolution `[width, height]`
    pub target_size: [u32; 2],
    pub normalization_mean: [f32; 3],
    pub normalization_std: [f32; 3],
}

/// Static description of a neural model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeuralModelSpec {
    pub kind: BackendKind,
    pub model_name: &'static str,
    pub file_name: &'static str,
    pub preprocessing: PreprocessingConfig,
}

pub(crate) const TINY_MODEL: NeuralModelSpec = NeuralModelSpec {
    kind: BackendKind::TinyNeural,
    model_name: "u2netp",
    file_name: "u2netp.onnx",
    preprocessing: PreprocessingConfig {
        target_size: [320, 320],
        normalization_mean: [0.485, 0.456, 0.406],
        normalization_std: [0.229, 0.224, 0.225],
    },
};

pub(crate) const STANDARD_MODEL: NeuralModelSpec = NeuralModelSpec {
    kind: BackendKind::StandardNeural,
    model_name: "isnet-general-use",
    file_name: "isnet-general-use.onnx",
    preprocessing: PreprocessingConfig {
        target_size: [1024, 1024],
        normalization_mean: [0.5, 0.5, 0.5],
        normalization_std: [1.0, 1.0, 1.0],
    },
};

impl NeuralModelSpec {
    /// Model spec for a neural backend, `None` for session-less kinds
    #[must_use]
    pub fn for_kind(kind: BackendKind) -> Option<Self> {
        match kind {
            BackendKind::TinyNeural => Some(TINY_MODEL),
            BackendKind::StandardNeural => Some(STANDARD_MODEL),
            BackendKind::ComputerVision | BackendKind::EdgeHeuristic => None,
        }
    }
}

/// Locates model files on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    model_dir: PathBuf,
}

impl ModelCatalog {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(model_dir: P) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    /// Resolve the model directory from `explicit`, then the environment,
    /// then the platform cache directory.
    ///
    /// # Errors
    /// - No explicit path, no environment override and no cache directory
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(dir) = explicit {
            return Ok(Self::new(dir));
        }

        if let Ok(dir_override) = std::env::var(MODEL_DIR_ENV) {
            if !dir_override.trim().is_empty() {
                return Ok(Self::new(dir_override));
            }
        }

        dirs::cache_dir()
            .map(|cache| Self::new(cache.join("pixport").join("models")))
            .ok_or_else(|| {
                CoreError::configuration(format!(
                    "Failed to determine model directory. Set {MODEL_DIR_ENV} environment variable."
                ))
            })
    }

    #[must_use]
    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Path of the model file for `kind`
    ///
    /// # Errors
    /// - `kind` is not a neural backend
    pub fn model_path(&self, kind: BackendKind) -> std::result::Result<PathBuf, SessionError> {
        NeuralModelSpec::for_kind(kind)
            .map(|spec| self.model_dir.join(spec.file_name))
            .ok_or(SessionError::NotNeural(kind))
    }

    /// Whether the model file for `kind` exists
    #[must_use]
    pub fn is_available(&self, kind: BackendKind) -> bool {
        self.model_path(kind).is_ok_and(|path| path.is_file())
    }

    /// Neural kinds whose model files are present
    #[must_use]
    pub fn available_models(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|kind| kind.is_neural() && self.is_available(*kind))
            .collect()
    }
}
