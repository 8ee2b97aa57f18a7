//! Neural inference runtimes
//!
//! Two interchangeable engines execute the ONNX models:
//! - ONNX Runtime via `ort` (feature `onnx`)
//! - Tract, pure Rust (feature `tract`)
//!
//! Engines are created only by the session manager through a
//! [`SessionLoader`], so a loaded model never escapes a [`crate::session::Session`].

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxEngine;

#[cfg(feature = "tract")]
pub use self::tract::TractEngine;

use crate::backends::BackendKind;
use crate::error::{BackendError, CoreError, SessionError};
use crate::models::ModelCatalog;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A loaded model that can run forward passes
pub trait InferenceEngine: Send {
    /// Run inference on an NCHW tensor
    ///
    /// # Errors
    /// - Allocation failures map to [`BackendError::ResourceExhausted`]
    /// - Anything else maps to [`BackendError::RuntimeFailure`]
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>, BackendError>;

    /// Short name for logs
    fn runtime_name(&self) -> &'static str;
}

/// Which library executes neural models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Onnx,
    Tract,
}

impl RuntimeKind {
    /// The runtime compiled into this build, ONNX Runtime preferred
    #[must_use]
    pub fn preferred() -> Self {
        if cfg!(feature = "onnx") {
            Self::Onnx
        } else {
            Self::Tract
        }
    }

    #[must_use]
    pub fn is_compiled_in(self) -> bool {
        match self {
            Self::Onnx => cfg!(feature = "onnx"),
            Self::Tract => cfg!(feature = "tract"),
        }
    }
}

impl Default for RuntimeKind {
    fn default() -> Self {
        Self::preferred()
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Onnx => f.write_str("onnx"),
            Self::Tract => f.write_str("tract"),
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" | "ort" | "onnxruntime" => Ok(Self::Onnx),
            "tract" => Ok(Self::Tract),
            other => Err(CoreError::configuration(format!(
                "Unknown runtime '{other}' (expected onnx or tract)"
            ))),
        }
    }
}

/// Thread and allocator settings handed to a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeOptions {
    /// Threads inside one operator; 0 picks the number of cores
    pub intra_threads: usize,
    /// Disable arena and memory-pattern preallocation
    pub memory_lean: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            intra_threads: 1,
            memory_lean: true,
        }
    }
}

/// Creates inference engines on behalf of the session manager.
///
/// Loaders must not keep references to the engines they create.
pub trait SessionLoader: Send + Sync {
    /// Load the runtime for `kind`
    ///
    /// # Errors
    /// - Model file missing or unreadable
    /// - Runtime initialisation failure
    fn load(&self, kind: BackendKind) -> Result<Box<dyn InferenceEngine>, SessionError>;

    /// Drop any cached intermediate state before a retry
    fn reclaim(&self) {}
}

/// Loads models from a [`ModelCatalog`] with the configured runtime
#[derive(Debug, Clone)]
pub struct ModelSessionLoader {
    catalog: ModelCatalog,
    runtime: RuntimeKind,
    options: RuntimeOptions,
}

impl ModelSessionLoader {
    #[must_use]
    pub fn new(catalog: ModelCatalog, runtime: RuntimeKind, options: RuntimeOptions) -> Self {
        Self {
            catalog,
            runtime,
            options,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }
}

impl SessionLoader for ModelSessionLoader {
    fn load(&self, kind: BackendKind) -> Result<Box<dyn InferenceEngine>, SessionError> {
        let path = self.catalog.model_path(kind)?;
        if !path.is_file() {
            return Err(SessionError::LoadFailure {
                backend: kind,
                attempts: 1,
                last_error: format!("model file not found: {}", path.display()),
            });
        }

        match self.runtime {
            #[cfg(feature = "onnx")]
            RuntimeKind::Onnx => {
                let engine = OnnxEngine::from_file(&path, &self.options).map_err(|e| {
                    SessionError::LoadFailure {
                        backend: kind,
                        attempts: 1,
                        last_error: e.to_string(),
                    }
                })?;
                Ok(Box::new(engine))
            },
            #[cfg(feature = "tract")]
            RuntimeKind::Tract => {
                let engine = TractEngine::from_file(&path).map_err(|e| SessionError::LoadFailure {
                    backend: kind,
                    attempts: 1,
                    last_error: e.to_string(),
                })?;
                Ok(Box::new(engine))
            },
            #[allow(unreachable_patterns)]
            other => Err(SessionError::runtime_unavailable(format!(
                "runtime '{other}' is not compiled into this build"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_kind_parsing() {
        assert_eq!("ort".parse::<RuntimeKind>().unwrap(), RuntimeKind::Onnx);
        assert_eq!("Tract".parse::<RuntimeKind>().unwrap(), RuntimeKind::Tract);
        assert!("tensorflow".parse::<RuntimeKind>().is_err());
    }

    #[test]
    fn test_missing_model_file_is_load_failure() {
        let temp = tempfile::TempDir::new().unwrap();
        let loader = ModelSessionLoader::new(
            ModelCatalog::new(temp.path()),
            RuntimeKind::preferred(),
            RuntimeOptions::default(),
        );

        let err = loader.load(BackendKind::TinyNeural).err().unwrap();
        assert!(matches!(err, SessionError::LoadFailure { .. }));

        let err = loader.load(BackendKind::ComputerVision).err().unwrap();
        assert_eq!(err, SessionError::NotNeural(BackendKind::ComputerVision));
    }

    #[test]
    fn test_lean_defaults() {
        let options = RuntimeOptions::default();
        assert_eq!(options.intra_threads, 1);
        assert!(options.memory_lean);
    }
}
