//! Segmentation backends
//!
//! Every strategy for computing a foreground mask implements
//! [`SegmentationBackend`]. The fallback orchestrator only ever sees the trait
//! plus the static [`BackendDescriptor`] each backend publishes:
//! - `TinyNeural` / `StandardNeural`: ONNX models run through a [`crate::session::Session`]
//! - `ComputerVision`: classical segmentation, no model
//! - `EdgeHeuristic`: unconditional last resort

pub mod cv;
pub mod edge;
pub mod neural;

// Test utilities for backend testing
#[cfg(test)]
pub mod test_utils;

pub use self::cv::{ComputerVisionBackend, CvStrategy};
pub use self::edge::EdgeHeuristicBackend;
pub use self::neural::NeuralBackend;

use crate::error::{BackendError, CoreError};
use crate::session::Session;
use crate::types::{Image, Mask};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Tag identifying a backend variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    TinyNeural,
    StandardNeural,
    ComputerVision,
    EdgeHeuristic,
}

impl BackendKind {
    pub const ALL: [Self; 4] = [
        Self::TinyNeural,
        Self::StandardNeural,
        Self::ComputerVision,
        Self::EdgeHeuristic,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::TinyNeural => "tiny-neural",
            Self::StandardNeural => "standard-neural",
            Self::ComputerVision => "computer-vision",
            Self::EdgeHeuristic => "edge-heuristic",
        }
    }

    /// Whether this backend needs a loaded runtime session
    #[must_use]
    pub fn is_neural(self) -> bool {
        matches!(self, Self::TinyNeural | Self::StandardNeural)
    }

    /// Static metadata used for ranking and memory gating
    #[must_use]
    pub fn descriptor(self) -> BackendDescriptor {
        match self {
            Self::TinyNeural => BackendDescriptor {
                kind: self,
                name: self.name(),
                peak_memory_mb: 120,
                max_input_dimension: 2048,
                latency: LatencyClass::Moderate,
                guarded: true,
            },
            Self::StandardNeural => BackendDescriptor {
                kind: self,
                name: self.name(),
                peak_memory_mb: 300,
                max_input_dimension: 4096,
                latency: LatencyClass::Slow,
                guarded: true,
            },
            Self::ComputerVision => BackendDescriptor {
                kind: self,
                name: self.name(),
                peak_memory_mb: 60,
                max_input_dimension: 8192,
                latency: LatencyClass::Fast,
                guarded: true,
            },
            Self::EdgeHeuristic => BackendDescriptor {
                kind: self,
                name: self.name(),
                peak_memory_mb: 4,
                max_input_dimension: u32::MAX,
                latency: LatencyClass::Instant,
                guarded: false,
            },
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepts the canonical names plus the model names operators already use
impl FromStr for BackendKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tiny-neural" | "tiny" | "u2netp" | "isnet-tiny" | "isnet-general-tiny" => {
                Ok(Self::TinyNeural)
            },
            "standard-neural" | "standard" | "neural" | "u2net" | "isnet-general-use" | "isnet" => {
                Ok(Self::StandardNeural)
            },
            "computer-vision" | "cv" | "lightweight" | "opencv" => Ok(Self::ComputerVision),
            "edge-heuristic" | "edge" | "heuristic" | "minimal" => Ok(Self::EdgeHeuristic),
            other => Err(CoreError::configuration(format!(
                "Unknown backend '{other}' (expected one of: {})",
                Self::ALL.map(Self::name).join(", ")
            ))),
        }
    }
}

/// Rough inference latency bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    Instant,
    Fast,
    Moderate,
    Slow,
}

/// Static backend metadata, never mutated at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub name: &'static str,
    /// Approximate peak resident cost of one run, in MB
    pub peak_memory_mb: u32,
    /// Largest side the backend handles without memory blowing up
    pub max_input_dimension: u32,
    pub latency: LatencyClass,
    /// Whether the memory guard must approve an attempt
    pub guarded: bool,
}

/// A strategy that turns an image into a foreground mask.
///
/// Implementations must return a mask with exactly the image's dimensions and
/// must not keep any runtime state alive after returning an error.
pub trait SegmentationBackend: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    /// Compute a mask for `image`.
    ///
    /// Neural backends require `session`; session-less backends ignore it.
    ///
    /// # Errors
    /// - [`BackendError::ResourceExhausted`] when memory ran out or no session was supplied
    /// - [`BackendError::RuntimeFailure`] when inference produced unusable output
    /// - [`BackendError::UnsupportedInput`] for zero-size images
    fn compute_mask(&self, image: &Image, session: Option<&Session>) -> Result<Mask, BackendError>;

    fn kind(&self) -> BackendKind {
        self.descriptor().kind
    }
}

/// Reject zero-size images before any backend work
pub(crate) fn ensure_non_empty(image: &Image) -> Result<(), BackendError> {
    if image.is_empty() {
        return Err(BackendError::unsupported_input(format!(
            "image has zero size ({}x{})",
            image.width(),
            image.height()
        )));
    }
    Ok(())
}

/// Backend instances keyed by kind
#[derive(Clone)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn SegmentationBackend>>,
}

impl BackendRegistry {
    /// Registry with the built-in implementation for every kind
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(NeuralBackend::tiny()));
        registry.register(Arc::new(NeuralBackend::standard()));
        registry.register(Arc::new(ComputerVisionBackend::new()));
        registry.register(Arc::new(EdgeHeuristicBackend::new()));
        registry
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Install or replace the backend for its kind
    pub fn register(&mut self, backend: Arc<dyn SegmentationBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    #[must_use]
    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn SegmentationBackend>> {
        self.backends.get(&kind).cloned()
    }

    #[must_use]
    pub fn contains(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.backends.keys().collect();
        kinds.sort();
        f.debug_struct("BackendRegistry").field("backends", &kinds).finish()
    }
}
