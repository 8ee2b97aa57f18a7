//! Error types for segmentation and compositing operations
//!
//! Three layers of errors exist. [`BackendError`] is what a single
//! segmentation backend reports, [`SessionError`] is what the session manager
//! reports while loading a neural runtime, and [`CoreError`] is the only type
//! that crosses the public `process` boundary.

use crate::backends::BackendKind;
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced to callers of the processing pipeline
#[derive(Error, Debug)]
pub enum CoreError {
    /// Decode failure, zero-size image, oversize upload or disallowed format
    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    /// Every attempted candidate ran out of memory or was rejected by the memory guard
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    /// A backend executed but produced unusable output
    #[error("Backend runtime failure in {backend}: {message}")]
    BackendRuntimeFailure { backend: String, message: String },

    /// A neural runtime could not be initialised after all retries
    #[error("Session load failure: {0}")]
    SessionLoadFailure(String),

    /// Internal invariant violation, e.g. mask and image sizes disagree
    #[error("Processing failure: {0}")]
    ProcessingFailure(String),

    /// The deployment profile excludes every backend or names an unknown one
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A background colour could not be parsed
    #[error("Invalid color: {0}")]
    InvalidColor(String),

    /// Filesystem errors while reading profiles or models
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Create a new unsupported input error
    pub fn unsupported_input<S: Into<String>>(msg: S) -> Self {
        Self::UnsupportedInput(msg.into())
    }

    /// Create a new resource exhaustion error
    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a new backend runtime failure attributed to `backend`
    pub fn backend_runtime<B: Into<String>, S: Into<String>>(backend: B, msg: S) -> Self {
        Self::BackendRuntimeFailure {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    /// Create a new processing failure
    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::ProcessingFailure(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::ConfigurationError(msg.into())
    }

    /// Create a new colour validation error
    pub fn invalid_color<S: Into<String>>(msg: S) -> Self {
        Self::InvalidColor(msg.into())
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
    ) -> Self {
        Self::ConfigurationError(format!(
            "Invalid {parameter}: {value} (valid range: {valid_range})"
        ))
    }

    /// Whether a caller is expected to see this error in normal operation.
    ///
    /// Resource and backend errors are absorbed by the fallback chain and only
    /// escape when every candidate failed.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedInput(_)
                | Self::ProcessingFailure(_)
                | Self::ConfigurationError(_)
                | Self::InvalidColor(_)
        )
    }
}

impl From<image::ImageError> for CoreError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => Self::UnsupportedInput(e.to_string()),
            image::ImageError::Decoding(e) => Self::UnsupportedInput(e.to_string()),
            image::ImageError::Limits(e) => Self::UnsupportedInput(e.to_string()),
            image::ImageError::IoError(e) => Self::Io(e),
            other => Self::ProcessingFailure(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigurationError(format!("Invalid profile document: {err}"))
    }
}

/// Errors reported by a single segmentation backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Session creation or inference exceeded available memory
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Inference ran but produced invalid output (wrong shape, non-finite values)
    #[error("runtime failure: {0}")]
    RuntimeFailure(String),

    /// The image cannot be segmented at all (zero dimensions)
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),
}

impl BackendError {
    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        Self::RuntimeFailure(msg.into())
    }

    pub fn unsupported_input<S: Into<String>>(msg: S) -> Self {
        Self::UnsupportedInput(msg.into())
    }

    /// Classify a runtime error message from an inference library.
    ///
    /// Allocation failures become [`BackendError::ResourceExhausted`], anything
    /// else is a [`BackendError::RuntimeFailure`].
    #[must_use]
    pub fn from_runtime_message(context: &str, message: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("alloc")
            || lowered.contains("out of memory")
            || lowered.contains("bad_alloc")
        {
            Self::ResourceExhausted(format!("{context}: {message}"))
        } else {
            Self::RuntimeFailure(format!("{context}: {message}"))
        }
    }

    /// Whether the failure was caused by memory pressure
    #[must_use]
    pub fn is_resource_related(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }
}

/// Errors reported by the session manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The runtime could not be initialised after every retry
    #[error("failed to load {backend} after {attempts} attempts: {last_error}")]
    LoadFailure {
        backend: BackendKind,
        attempts: u32,
        last_error: String,
    },

    /// A session was requested for a backend that does not use one
    #[error("{0} does not use a runtime session")]
    NotNeural(BackendKind),

    /// The neural runtime for this backend is not compiled in
    #[error("no neural runtime available: {0}")]
    RuntimeUnavailable(String),
}

impl SessionError {
    pub fn runtime_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::RuntimeUnavailable(msg.into())
    }
}

impl From<SessionError> for CoreError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotNeural(kind) => {
                Self::ConfigurationError(format!("{kind} does not use a runtime session"))
            },
            other => Self::SessionLoadFailure(other.to_string()),
        }
    }
}

/// Session load failures count as resource exhaustion for fallback purposes
impl From<SessionError> for BackendError {
    fn from(err: SessionError) -> Self {
        Self::ResourceExhausted(err.to_string())
    }
}

impl From<BackendError> for CoreError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ResourceExhausted(msg) => Self::ResourceExhausted(msg),
            BackendError::RuntimeFailure(msg) => Self::BackendRuntimeFailure {
                backend: "unknown".to_string(),
                message: msg,
            },
            BackendError::UnsupportedInput(msg) => Self::UnsupportedInput(msg),
        }
    }
}
