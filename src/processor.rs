//! Segmentation service
//!
//! [`SegmentationService`] is the single entry point used by the CLI and by any
//! embedding server. It owns the whole pipeline: size checks, decoding,
//! downscaling, the fallback chain, compositing and encoding. One instance is
//! shared by reference (usually an `Arc`) between all concurrent callers.

use crate::{
    backends::{BackendKind, BackendRegistry},
    compositor::Compositor,
    config::{DeploymentProfile, ProfileKind},
    error::{CoreError, Result},
    memory::{MemoryGuard, MemoryProbe, SystemMemoryProbe},
    models::ModelCatalog,
    orchestrator::FallbackOrchestrator,
    runtime::{ModelSessionLoader, SessionLoader},
    services::OutputFormatHandler,
    session::{SessionManager, SessionStats},
    types::{Image, Operation, ProcessedImage},
    warmer::{Warmer, WarmerStatus},
};
use chrono::{DateTime, Utc};
use instant::Instant;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{instrument, span, Level};

/// Operational snapshot returned by [`SegmentationService::status`]
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub profile: ProfileKind,
    /// Backend whose session is currently loaded
    pub active_backend: Option<BackendKind>,
    /// Backend that produced the most recent mask
    pub last_backend: Option<BackendKind>,
    pub process_memory_mb: Option<u64>,
    pub available_memory_mb: Option<u64>,
    pub total_memory_mb: Option<u64>,
    pub memory_budget_mb: u64,
    pub warmer_status: WarmerStatus,
    pub warmed_backend: Option<BackendKind>,
    pub sessions: SessionStats,
    pub live_sessions: usize,
    pub peak_live_sessions: usize,
    pub requests_processed: u64,
    pub requests_failed: u64,
    pub started_at: DateTime<Utc>,
    pub checked_at: DateTime<Utc>,
}

/// Background removal and replacement behind a fallback chain
#[derive(Debug)]
pub struct SegmentationService {
    profile: DeploymentProfile,
    orchestrator: Arc<FallbackOrchestrator>,
    warmer: Warmer,
    started_at: DateTime<Utc>,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl SegmentationService {
    /// Build a service with the built-in backends, models resolved from disk
    /// and the host's memory figures.
    ///
    /// Starts the warmer when the profile asks for it.
    ///
    /// # Errors
    /// - [`CoreError::ConfigurationError`] for an invalid profile
    /// - No usable model directory could be resolved
    pub fn new(profile: DeploymentProfile) -> Result<Self> {
        profile.validate()?;

        let catalog = ModelCatalog::resolve(profile.model_dir.as_deref())?;
        if profile.permits_neural() {
            let available = catalog.available_models();
            log::info!(
                "📁 Model directory {} ({} model(s) present)",
                catalog.model_dir().display(),
                available.len()
            );
        }

        let loader = ModelSessionLoader::new(catalog, profile.runtime, profile.runtime_options());
        let service = Self::with_components(
            profile,
            BackendRegistry::with_defaults(),
            Arc::new(loader),
            Arc::new(SystemMemoryProbe::new()),
        )?;

        if service.profile.warm_on_start {
            // The handle is not needed; progress is visible through status().
            drop(service.start_warmer());
        }
        Ok(service)
    }

    /// Build a service from explicit parts. The warmer is not started.
    ///
    /// # Errors
    /// - [`CoreError::ConfigurationError`] for an invalid profile or when a
    ///   permitted backend is missing from `registry`
    pub fn with_components(
        profile: DeploymentProfile,
        registry: BackendRegistry,
        loader: Arc<dyn SessionLoader>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        profile.validate()?;

        if let Some(missing) = profile.backends.iter().find(|kind| !registry.contains(**kind)) {
            return Err(CoreError::configuration(format!(
                "backend {missing} is permitted but not registered"
            )));
        }

        let sessions = Arc::new(SessionManager::new(loader, profile.session_manager_config()));
        let guard = MemoryGuard::new(probe, profile.guard_thresholds());
        let orchestrator = Arc::new(FallbackOrchestrator::new(&profile, registry, sessions, guard));

        log::info!(
            "🚀 Segmentation service ready: profile {}, backends [{}], budget {}MB",
            profile.kind,
            profile
                .backends
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            profile.memory_budget_mb
        );

        Ok(Self {
            profile,
            orchestrator,
            warmer: Warmer::new(),
            started_at: Utc::now(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Start warming the preferred neural model in the background
    pub fn start_warmer(&self) -> Option<tokio::task::JoinHandle<WarmerStatus>> {
        self.warmer.spawn(Arc::clone(&self.orchestrator))
    }

    /// Decode, segment, composite and encode one image.
    ///
    /// # Errors
    /// - [`CoreError::UnsupportedInput`] for empty, oversized or undecodable input
    /// - [`CoreError::ResourceExhausted`] or [`CoreError::BackendRuntimeFailure`]
    ///   when no backend could produce a mask
    /// - [`CoreError::ConfigurationError`] when the profile permits no usable backend
    /// - [`CoreError::ProcessingFailure`] for compositing or encoding failures
    #[instrument(
        skip(self, image_bytes, operation),
        fields(bytes = image_bytes.len(), operation = operation.name())
    )]
    pub fn process(&self, image_bytes: &[u8], operation: &Operation) -> Result<ProcessedImage> {
        let result = self.run_pipeline(image_bytes, operation);
        match &result {
            Ok(_) => self.processed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn run_pipeline(&self, image_bytes: &[u8], operation: &Operation) -> Result<ProcessedImage> {
        let start = Instant::now();

        if image_bytes.is_empty() {
            return Err(CoreError::unsupported_input("empty upload"));
        }
        if image_bytes.len() > self.profile.max_file_bytes {
            return Err(CoreError::unsupported_input(format!(
                "upload is {} bytes, limit is {} bytes",
                image_bytes.len(),
                self.profile.max_file_bytes
            )));
        }

        let image = {
            let _span = span!(Level::DEBUG, "decode").entered();
            let decoded = Image::decode(image_bytes)?;
            log::debug!(
                "🖼️ Decoded {}x{} {:?} image",
                decoded.width(),
                decoded.height(),
                decoded.format()
            );
            decoded.fit_within(self.profile.max_dimension)
        };

        let outcome = self.orchestrator.segment(&image)?;

        let composed = {
            let _span = span!(Level::DEBUG, "composite", operation = operation.name()).entered();
            Compositor::apply(&image, &outcome.mask, operation)?
        };

        let format = OutputFormatHandler::select(operation, self.profile.opaque_format);
        let bytes = {
            let _span = span!(Level::DEBUG, "encode", format = format.extension()).entered();
            OutputFormatHandler::encode(&composed, format, self.profile.jpeg_quality)?
        };

        let elapsed = start.elapsed();
        log::info!(
            "✅ {} done with {} in {:.0}ms ({} attempt(s))",
            operation.name(),
            outcome.backend,
            elapsed.as_secs_f64() * 1000.0,
            outcome.attempts
        );

        Ok(ProcessedImage {
            bytes,
            format,
            width: composed.width(),
            height: composed.height(),
            backend: outcome.backend,
            attempts: outcome.attempts,
            elapsed,
        })
    }

    /// [`Self::process`] on the tokio blocking pool
    ///
    /// # Errors
    /// - Everything [`Self::process`] returns
    /// - [`CoreError::ProcessingFailure`] if the blocking task panicked
    pub async fn process_async(
        self: Arc<Self>,
        image_bytes: Vec<u8>,
        operation: Operation,
    ) -> Result<ProcessedImage> {
        tokio::task::spawn_blocking(move || self.process(&image_bytes, &operation))
            .await
            .map_err(|e| CoreError::processing(format!("processing task failed: {e}")))?
    }

    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        let sessions = self.orchestrator.sessions();
        let snapshot = self.orchestrator.guard().snapshot();

        ServiceStatus {
            profile: self.profile.kind,
            active_backend: sessions.active_backend(),
            last_backend: self.orchestrator.last_used(),
            process_memory_mb: snapshot.map(|s| s.process_rss_mb),
            available_memory_mb: snapshot.map(|s| s.available_mb),
            total_memory_mb: snapshot.map(|s| s.total_mb),
            memory_budget_mb: self.profile.memory_budget_mb,
            warmer_status: self.warmer.status(),
            warmed_backend: self.warmer.warmed_backend(),
            sessions: sessions.stats(),
            live_sessions: sessions.live_sessions(),
            peak_live_sessions: sessions.peak_live_sessions(),
            requests_processed: self.processed.load(Ordering::Relaxed),
            requests_failed: self.failed.load(Ordering::Relaxed),
            started_at: self.started_at,
            checked_at: Utc::now(),
        }
    }

    /// Drop the loaded runtime session, if any. Returns whether one was released.
    pub fn release_resources(&self) -> bool {
        let released = self.orchestrator.sessions().clear();
        if released {
            log::info!("🧹 Released active session on request");
        }
        released
    }

    #[must_use]
    pub fn profile(&self) -> &DeploymentProfile {
        &self.profile
    }

    #[must_use]
    pub fn warmer(&self) -> &Warmer {
        &self.warmer
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<FallbackOrchestrator> {
        &self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::MockLoader;
    use crate::color::RgbColor;
    use crate::memory::FixedMemoryProbe;
    use crate::types::OutputFormat;
    use std::io::Cursor;

    fn service(profile: DeploymentProfile) -> SegmentationService {
        SegmentationService::with_components(
            profile,
            BackendRegistry::with_defaults(),
            Arc::new(MockLoader::new()),
            Arc::new(FixedMemoryProbe::unavailable()),
        )
        .unwrap()
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 90])
        });
        let mut buffer = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut buffer, image::ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_remove_background_produces_png() {
        let service = service(DeploymentProfile::preset(ProfileKind::Constrained));
        let result = service.process(&png_bytes(64, 48), &Operation::RemoveBackground).unwrap();

        assert_eq!(result.format, OutputFormat::Png);
        assert_eq!((result.width, result.height), (64, 48));
        assert_eq!(result.backend, BackendKind::TinyNeural);
        let decoded = image::load_from_memory(&result.bytes).unwrap();
        assert!(decoded.color().has_alpha());
    }

    #[test]
    fn test_recolor_uses_opaque_format() {
        let service = service(DeploymentProfile::preset(ProfileKind::Standard));
        let operation = Operation::RecolorBackground {
            color: RgbColor::WHITE,
        };
        let result = service.process(&png_bytes(32, 32), &operation).unwrap();
        assert_eq!(result.format, OutputFormat::Jpeg);
        assert_eq!(image::guess_format(&result.bytes).unwrap(), image::ImageFormat::Jpeg);
    }

    #[test]
    fn test_rejects_empty_and_oversized_uploads() {
        let profile = DeploymentProfile::builder().max_file_mb(1).build().unwrap();
        let service = service(profile);

        assert!(matches!(
            service.process(&[], &Operation::RemoveBackground),
            Err(CoreError::UnsupportedInput(_))
        ));
        let huge = vec![0_u8; 1024 * 1024 + 1];
        assert!(matches!(
            service.process(&huge, &Operation::RemoveBackground),
            Err(CoreError::UnsupportedInput(_))
        ));
        assert!(matches!(
            service.process(b"not an image", &Operation::RemoveBackground),
            Err(CoreError::UnsupportedInput(_))
        ));
        assert_eq!(service.status().requests_failed, 3);
    }

    #[test]
    fn test_large_images_are_downscaled() {
        let profile = DeploymentProfile::builder().max_dimension(100).build().unwrap();
        let service = service(profile);
        let result = service.process(&png_bytes(400, 200), &Operation::RemoveBackground).unwrap();
        assert_eq!((result.width, result.height), (100, 50));
    }

    #[test]
    fn test_status_and_release() {
        let service = service(DeploymentProfile::preset(ProfileKind::Standard));
        assert_eq!(service.status().active_backend, None);

        service.process(&png_bytes(20, 20), &Operation::RemoveBackground).unwrap();
        let status = service.status();
        assert_eq!(status.active_backend, Some(BackendKind::StandardNeural));
        assert_eq!(status.last_backend, Some(BackendKind::StandardNeural));
        assert_eq!(status.requests_processed, 1);
        assert_eq!(status.process_memory_mb, None);
        assert_eq!(status.warmer_status, WarmerStatus::NotStarted);

        assert!(service.release_resources());
        assert!(!service.release_resources());
        assert_eq!(service.status().active_backend, None);
        assert!(serde_json::to_string(&service.status()).is_ok());
    }

    #[test]
    fn test_unregistered_backend_is_configuration_error() {
        let result = SegmentationService::with_components(
            DeploymentProfile::default(),
            BackendRegistry::empty(),
            Arc::new(MockLoader::new()),
            Arc::new(FixedMemoryProbe::unavailable()),
        );
        assert!(matches!(result, Err(CoreError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_process_async_matches_sync() {
        let service = Arc::new(service(DeploymentProfile::preset(ProfileKind::Minimal)));
        let result = Arc::clone(&service)
            .process_async(png_bytes(30, 30), Operation::RemoveBackground)
            .await
            .unwrap();
        assert_eq!(result.backend, BackendKind::ComputerVision);
        assert_eq!(service.status().requests_processed, 1);
    }
}
