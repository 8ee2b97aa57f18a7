//! Deployment profiles
//!
//! A [`DeploymentProfile`] is built once at process start, from a preset, the
//! environment, or a JSON file, and is read-only afterwards. It decides which
//! backends may run, in what order, and how much memory they may use.

use crate::backends::BackendKind;
use crate::error::{CoreError, Result};
use crate::memory::GuardThresholds;
use crate::runtime::{RuntimeKind, RuntimeOptions};
use crate::session::{SessionManagerConfig, SessionPolicy};
use crate::types::OutputFormat;
use instant::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const MB: usize = 1024 * 1024;

/// Named starting points for a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Roomy host: best model first, sessions kept loaded
    Standard,
    /// ~512MB host: tiny model first, 80% high-water mark
    Constrained,
    /// ~256MB host: classical first, one fresh session per request
    Minimal,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => f.write_str("standard"),
            Self::Constrained => f.write_str("constrained"),
            Self::Minimal => f.write_str("minimal"),
        }
    }
}

impl FromStr for ProfileKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "default" | "full" => Ok(Self::Standard),
            "constrained" | "railway" | "low-memory" => Ok(Self::Constrained),
            "minimal" | "fly" | "tiny" => Ok(Self::Minimal),
            other => Err(CoreError::configuration(format!(
                "Unknown profile '{other}' (expected standard, constrained or minimal)"
            ))),
        }
    }
}

/// Everything the service needs to know about its host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentProfile {
    pub kind: ProfileKind,

    /// Memory the whole process may use, in MB
    pub memory_budget_mb: u64,

    /// Backends allowed to run; order breaks ties in ranking
    pub backends: Vec<BackendKind>,

    /// Backend tried first regardless of cost
    pub promoted_backend: Option<BackendKind>,

    /// Largest accepted encoded input
    pub max_file_bytes: usize,

    /// Decoded images are downscaled to fit this side length
    pub max_dimension: u32,

    /// Inputs above this side length skip the most expensive neural backend
    pub large_input_threshold: u32,

    pub high_water_ratio: f64,
    pub min_available_mb: u64,

    pub session_policy: SessionPolicy,
    pub session_max_attempts: u32,
    pub retry_backoff_ms: u64,

    /// Encoding for outputs without transparency
    pub opaque_format: OutputFormat,
    pub jpeg_quality: u8,

    /// Explicit model directory; falls back to `PIXPORT_MODEL_DIR` and the cache dir
    pub model_dir: Option<PathBuf>,
    pub runtime: RuntimeKind,

    /// Threads inside one operator, 0 = auto
    pub intra_threads: usize,

    /// Load the preferred neural model in the background at startup
    pub warm_on_start: bool,
}

impl Default for DeploymentProfile {
    fn default() -> Self {
        Self::preset(ProfileKind::Standard)
    }
}

impl DeploymentProfile {
    /// Preset values for `kind`
    #[must_use]
    pub fn preset(kind: ProfileKind) -> Self {
        use BackendKind::{ComputerVision, EdgeHeuristic, StandardNeural, TinyNeural};

        let base = Self {
            kind,
            memory_budget_mb: 2048,
            backends: vec![StandardNeural, TinyNeural, ComputerVision, EdgeHeuristic],
            promoted_backend: Some(StandardNeural),
            max_file_bytes: 16 * MB,
            max_dimension: 2048,
            large_input_threshold: 1600,
            high_water_ratio: 0.85,
            min_available_mb: 100,
            session_policy: SessionPolicy::Reuse,
            session_max_attempts: 3,
            retry_backoff_ms: 500,
            opaque_format: OutputFormat::Jpeg,
            jpeg_quality: 95,
            model_dir: None,
            runtime: RuntimeKind::preferred(),
            intra_threads: 0,
            warm_on_start: true,
        };

        match kind {
            ProfileKind::Standard => base,
            ProfileKind::Constrained => Self {
                memory_budget_mb: 512,
                backends: vec![TinyNeural, StandardNeural, ComputerVision, EdgeHeuristic],
                promoted_backend: Some(TinyNeural),
                max_file_bytes: 8 * MB,
                max_dimension: 1200,
                large_input_threshold: 1024,
                high_water_ratio: 0.8,
                intra_threads: 1,
                ..base
            },
            ProfileKind::Minimal => Self {
                memory_budget_mb: 256,
                backends: vec![ComputerVision, TinyNeural, EdgeHeuristic],
                promoted_backend: Some(ComputerVision),
                max_file_bytes: 8 * MB,
                max_dimension: 1024,
                large_input_threshold: 800,
                high_water_ratio: 0.75,
                min_available_mb: 50,
                session_policy: SessionPolicy::FreshPerRequest,
                session_max_attempts: 2,
                retry_backoff_ms: 250,
                intra_threads: 1,
                warm_on_start: false,
                ..base
            },
        }
    }

    /// Builder starting from the standard preset
    #[must_use]
    pub fn builder() -> DeploymentProfileBuilder {
        DeploymentProfileBuilder::from_preset(ProfileKind::Standard)
    }

    /// Profile from the process environment
    ///
    /// # Errors
    /// - Unparseable values in any recognised variable
    /// - The resulting profile fails [`Self::validate`]
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Profile from an arbitrary variable lookup.
    ///
    /// `PIXPORT_PROFILE` picks the preset; without it the hosting hints
    /// `SKIP_AI_MODELS`, `FLY_APP_NAME`, `MEMORY_CONSTRAINED` and
    /// `RAILWAY_ENVIRONMENT_NAME` do. `PIXPORT_*` overrides apply on top.
    ///
    /// # Errors
    /// - Unparseable values in any recognised variable
    /// - The resulting profile fails [`Self::validate`]
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str| get(key).is_some_and(|v| is_truthy(&v));

        let skip_neural = flag("SKIP_AI_MODELS");
        let kind = match get("PIXPORT_PROFILE") {
            Some(name) => name.parse()?,
            None if skip_neural || get("FLY_APP_NAME").is_some() => ProfileKind::Minimal,
            None if flag("MEMORY_CONSTRAINED") || get("RAILWAY_ENVIRONMENT_NAME").is_some() => {
                ProfileKind::Constrained
            },
            None => ProfileKind::Standard,
        };

        let mut builder = DeploymentProfileBuilder::from_preset(kind);

        if let Some(model) = get("REMBG_MODEL") {
            let backend: BackendKind = model.parse()?;
            if builder.profile.backends.contains(&backend) {
                builder = builder.promoted_backend(Some(backend));
            } else {
                log::warn!(
                    "⚠️ REMBG_MODEL={model} is not permitted by the '{kind}' profile, ignoring"
                );
            }
        }
        if let Some(value) = get("PIXPORT_MEMORY_BUDGET_MB") {
            builder = builder.memory_budget_mb(parse_number("PIXPORT_MEMORY_BUDGET_MB", &value)?);
        }
        if let Some(value) = get("PIXPORT_BACKENDS") {
            builder = builder.backends(parse_backend_list(&value)?);
        }
        if let Some(value) = get("PIXPORT_PROMOTED_BACKEND") {
            let promoted = match value.to_ascii_lowercase().as_str() {
                "none" | "off" => None,
                other => Some(other.parse()?),
            };
            builder = builder.promoted_backend(promoted);
        }
        if let Some(value) = get("PIXPORT_MAX_DIMENSION") {
            builder = builder.max_dimension(parse_number("PIXPORT_MAX_DIMENSION", &value)?);
        }
        if let Some(value) = get("PIXPORT_MAX_FILE_MB") {
            builder = builder.max_file_mb(parse_number("PIXPORT_MAX_FILE_MB", &value)?);
        }
        if let Some(value) = get(crate::models::MODEL_DIR_ENV) {
            builder = builder.model_dir(value);
        }
        if let Some(value) = get("PIXPORT_RUNTIME") {
            builder = builder.runtime(value.parse()?);
        }
        if skip_neural {
            builder = builder.without_neural();
        }

        let profile = builder.build()?;
        log::info!(
            "⚙️ Deployment profile '{}': budget {}MB, backends [{}]",
            profile.kind,
            profile.memory_budget_mb,
            profile
                .backends
                .iter()
                .map(|b| b.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(profile)
    }

    /// Profile from a JSON document; missing fields take standard preset values
    ///
    /// # Errors
    /// - File unreadable
    /// - Invalid JSON or unknown enum values
    /// - The resulting profile fails [`Self::validate`]
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let profile: Self = serde_json::from_str(&contents)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Check internal consistency
    ///
    /// # Errors
    /// - Empty or duplicated backend list
    /// - Promoted backend not in the permitted list
    /// - Zero budget, limits or attempts
    /// - High-water ratio outside `(0, 1]`
    /// - JPEG quality outside `1-100`
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(CoreError::configuration("No backends permitted"));
        }

        for (i, kind) in self.backends.iter().enumerate() {
            if self.backends.iter().take(i).any(|b| b == kind) {
                return Err(CoreError::configuration(format!(
                    "Backend '{kind}' listed more than once"
                )));
            }
        }

        if let Some(promoted) = self.promoted_backend {
            if !self.backends.contains(&promoted) {
                return Err(CoreError::configuration(format!(
                    "Promoted backend '{promoted}' is not in the permitted list"
                )));
            }
        }

        if self.memory_budget_mb == 0 {
            return Err(CoreError::config_value_error(
                "memory budget",
                self.memory_budget_mb,
                "> 0 MB",
            ));
        }

        if !(self.high_water_ratio > 0.0 && self.high_water_ratio <= 1.0) {
            return Err(CoreError::config_value_error(
                "high-water ratio",
                self.high_water_ratio,
                "(0, 1]",
            ));
        }

        if self.max_dimension == 0 || self.large_input_threshold == 0 {
            return Err(CoreError::configuration(
                "max dimension and large-input threshold must be positive",
            ));
        }

        if self.max_file_bytes == 0 {
            return Err(CoreError::config_value_error("max file size", 0, "> 0 bytes"));
        }

        if self.session_max_attempts == 0 {
            return Err(CoreError::config_value_error("session attempts", 0, ">= 1"));
        }

        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(CoreError::config_value_error(
                "JPEG quality",
                self.jpeg_quality,
                "1-100",
            ));
        }

        Ok(())
    }

    /// Whether any permitted backend needs a neural session
    #[must_use]
    pub fn permits_neural(&self) -> bool {
        self.backends.iter().any(|b| b.is_neural())
    }

    #[must_use]
    pub fn session_manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            policy: self.session_policy,
            max_attempts: self.session_max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    #[must_use]
    pub fn guard_thresholds(&self) -> GuardThresholds {
        GuardThresholds {
            budget_mb: self.memory_budget_mb,
            high_water_ratio: self.high_water_ratio,
            min_available_mb: self.min_available_mb,
        }
    }

    #[must_use]
    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            intra_threads: self.intra_threads,
            memory_lean: self.kind != ProfileKind::Standard,
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| CoreError::configuration(format!("{key} must be a number, got '{value}'")))
}

/// Comma-separated backend names
///
/// # Errors
/// - Any unknown backend name
pub fn parse_backend_list(value: &str) -> Result<Vec<BackendKind>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

/// Builder for [`DeploymentProfile`]
#[derive(Debug, Clone)]
pub struct DeploymentProfileBuilder {
    profile: DeploymentProfile,
}

impl Default for DeploymentProfileBuilder {
    fn default() -> Self {
        Self::from_preset(ProfileKind::Standard)
    }
}

impl DeploymentProfileBuilder {
    #[must_use]
    pub fn from_preset(kind: ProfileKind) -> Self {
        Self {
            profile: DeploymentProfile::preset(kind),
        }
    }

    /// Start from an existing profile, e.g. one read from the environment
    #[must_use]
    pub fn from_profile(profile: DeploymentProfile) -> Self {
        Self { profile }
    }

    #[must_use]
    pub fn memory_budget_mb(mut self, budget: u64) -> Self {
        self.profile.memory_budget_mb = budget;
        self
    }

    /// Replace the permitted backends. A promoted backend no longer permitted is dropped.
    #[must_use]
    pub fn backends(mut self, backends: Vec<BackendKind>) -> Self {
        if let Some(promoted) = self.profile.promoted_backend {
            if !backends.contains(&promoted) {
                self.profile.promoted_backend = None;
            }
        }
        self.profile.backends = backends;
        self
    }

    #[must_use]
    pub fn promoted_backend(mut self, backend: Option<BackendKind>) -> Self {
        self.profile.promoted_backend = backend;
        self
    }

    /// Remove both neural backends
    #[must_use]
    pub fn without_neural(self) -> Self {
        let remaining = self
            .profile
            .backends
            .iter()
            .copied()
            .filter(|b| !b.is_neural())
            .collect();
        self.backends(remaining)
    }

    #[must_use]
    pub fn max_file_mb(mut self, megabytes: usize) -> Self {
        self.profile.max_file_bytes = megabytes.saturating_mul(MB);
        self
    }

    #[must_use]
    pub fn max_dimension(mut self, dimension: u32) -> Self {
        self.profile.max_dimension = dimension;
        self
    }

    #[must_use]
    pub fn large_input_threshold(mut self, dimension: u32) -> Self {
        self.profile.large_input_threshold = dimension;
        self
    }

    #[must_use]
    pub fn high_water_ratio(mut self, ratio: f64) -> Self {
        self.profile.high_water_ratio = ratio;
        self
    }

    #[must_use]
    pub fn min_available_mb(mut self, megabytes: u64) -> Self {
        self.profile.min_available_mb = megabytes;
        self
    }

    #[must_use]
    pub fn session_policy(mut self, policy: SessionPolicy) -> Self {
        self.profile.session_policy = policy;
        self
    }

    #[must_use]
    pub fn session_max_attempts(mut self, attempts: u32) -> Self {
        self.profile.session_max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.profile.retry_backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn opaque_format(mut self, format: OutputFormat) -> Self {
        self.profile.opaque_format = format;
        self
    }

    #[must_use]
    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.profile.jpeg_quality = quality;
        self
    }

    #[must_use]
    pub fn model_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.profile.model_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn runtime(mut self, runtime: RuntimeKind) -> Self {
        self.profile.runtime = runtime;
        self
    }

    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.profile.intra_threads = threads;
        self
    }

    #[must_use]
    pub fn warm_on_start(mut self, warm: bool) -> Self {
        self.profile.warm_on_start = warm;
        self
    }

    /// Validate and return the profile
    ///
    /// # Errors
    /// - Any rule of [`DeploymentProfile::validate`]
    pub fn build(self) -> Result<DeploymentProfile> {
        self.profile.validate()?;
        Ok(self.profile)
    }
}
