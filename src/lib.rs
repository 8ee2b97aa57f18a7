#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # PixPort Background Removal
//!
//! Background removal and background replacement for hosts with a hard memory
//! budget. A request is served by the first backend in a ranked fallback chain
//! that can produce a mask without exceeding that budget:
//!
//! - **Neural**: two ONNX models (tiny and standard) run through ONNX Runtime
//!   or Tract, loaded into at most one live session at a time
//! - **Computer vision**: classical threshold, region-growing and contour
//!   segmentation with no model
//! - **Edge heuristic**: an unconditional centre-weighted mask that always
//!   succeeds
//!
//! A memory guard vets every guarded attempt against the process budget and
//! the host's free memory, so a request degrades to a cheaper backend instead
//! of killing the process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pixport_bgremove::{DeploymentProfile, Operation, RgbColor, SegmentationService};
//!
//! # fn example(upload: Vec<u8>) -> anyhow::Result<()> {
//! let profile = DeploymentProfile::from_env()?;
//! let service = SegmentationService::new(profile)?;
//!
//! let cut_out = service.process(&upload, &Operation::RemoveBackground)?;
//! cut_out.save("cut_out.png")?;
//!
//! let recolored = service.process(
//!     &upload,
//!     &Operation::RecolorBackground { color: "#4682B4".parse::<RgbColor>()? },
//! )?;
//! println!("{} via {}", recolored.format.mime_type(), recolored.backend);
//! # Ok(())
//! # }
//! ```
//!
//! ## Deployment Profiles
//!
//! | Profile       | Budget | Sessions          | First choice    |
//! |---------------|--------|-------------------|-----------------|
//! | `standard`    | 2 GB   | reused            | standard neural |
//! | `constrained` | 512 MB | reused            | tiny neural     |
//! | `minimal`     | 256 MB | fresh per request | computer vision |
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime via `ort`
//! - `tract` (default): pure Rust Tract runtime
//! - `cli` (default): the `pixport-bgremove` binary and subscriber setup
//! - `webp-support` (default): WebP input decoding
//! - `tracing-json`: JSON log output for the CLI

pub mod backends;
#[cfg(feature = "cli")]
pub mod cli;
pub mod color;
pub mod compositor;
pub mod config;
pub mod error;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod processor;
pub mod runtime;
pub mod services;
pub mod session;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod types;
pub mod utils;
pub mod warmer;

// Public API exports
pub use backends::{
    BackendDescriptor, BackendKind, BackendRegistry, ComputerVisionBackend, CvStrategy,
    EdgeHeuristicBackend, LatencyClass, NeuralBackend, SegmentationBackend,
};
pub use color::RgbColor;
pub use compositor::Compositor;
pub use config::{parse_backend_list, DeploymentProfile, DeploymentProfileBuilder, ProfileKind};
pub use error::{BackendError, CoreError, Result, SessionError};
pub use memory::{
    FixedMemoryProbe, GuardDecision, GuardRejection, GuardThresholds, MemoryGuard, MemoryProbe,
    MemorySnapshot, SystemMemoryProbe,
};
pub use models::{ModelCatalog, NeuralModelSpec};
pub use orchestrator::FallbackOrchestrator;
pub use processor::{SegmentationService, ServiceStatus};
pub use runtime::{InferenceEngine, ModelSessionLoader, RuntimeKind, RuntimeOptions, SessionLoader};
pub use services::OutputFormatHandler;
pub use session::{
    Session, SessionLease, SessionManager, SessionManagerConfig, SessionPolicy, SessionStats,
};
pub use types::{
    Image, Mask, MaskStatistics, Operation, OutputFormat, PixelFormat, ProcessedImage,
    SegmentationOutcome,
};
pub use warmer::{Warmer, WarmerStatus};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, spans, TracingConfig, TracingFormat};
