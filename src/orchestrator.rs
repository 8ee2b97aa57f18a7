//! Priority-ordered backend fallback
//!
//! The orchestrator turns a [`DeploymentProfile`] and an input size into an
//! ordered candidate list, then walks it: guard check, session lease for
//! neural backends, `compute_mask`. The first valid mask wins. Every failure
//! is logged and absorbed; only an exhausted or empty chain reaches the caller.

use crate::backends::{BackendDescriptor, BackendKind, BackendRegistry};
use crate::config::DeploymentProfile;
use crate::error::{BackendError, CoreError, Result};
use crate::memory::{GuardDecision, MemoryGuard};
use crate::session::{SessionManager, SessionPolicy};
use crate::types::{Image, Mask, SegmentationOutcome};
use instant::Instant;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{instrument, span, Level};

/// Ranks and runs segmentation backends until one produces a mask
#[derive(Debug)]
pub struct FallbackOrchestrator {
    registry: BackendRegistry,
    sessions: Arc<SessionManager>,
    guard: MemoryGuard,
    permitted: Vec<BackendKind>,
    promoted: Option<BackendKind>,
    large_input_threshold: u32,
    last_used: Mutex<Option<BackendKind>>,
}

/// Fallback tier: neural first, then classical, the edge heuristic last
fn tier(kind: BackendKind) -> u8 {
    match kind {
        BackendKind::TinyNeural | BackendKind::StandardNeural => 0,
        BackendKind::ComputerVision => 1,
        BackendKind::EdgeHeuristic => 2,
    }
}

impl FallbackOrchestrator {
    #[must_use]
    pub fn new(
        profile: &DeploymentProfile,
        registry: BackendRegistry,
        sessions: Arc<SessionManager>,
        guard: MemoryGuard,
    ) -> Self {
        Self {
            registry,
            sessions,
            guard,
            permitted: profile.backends.clone(),
            promoted: profile.promoted_backend,
            large_input_threshold: profile.large_input_threshold,
            last_used: Mutex::new(None),
        }
    }

    /// Candidate order for an input whose longest side is `max_dimension`.
    ///
    /// Same profile and size always give the same order.
    #[must_use]
    pub fn rank_candidates(&self, max_dimension: u32) -> Vec<BackendKind> {
        let mut candidates: Vec<BackendKind> = self
            .permitted
            .iter()
            .copied()
            .filter(|kind| self.registry.contains(*kind))
            .filter(|kind| kind.descriptor().max_input_dimension >= max_dimension)
            .collect();

        // Stable: equal keys keep profile order
        candidates.sort_by_key(|kind| (tier(*kind), kind.descriptor().peak_memory_mb));

        if let Some(promoted) = self.promoted.filter(|p| *p != BackendKind::EdgeHeuristic) {
            if let Some(pos) = candidates.iter().position(|k| *k == promoted) {
                let kind = candidates.remove(pos);
                candidates.insert(0, kind);
            }
        }

        if max_dimension > self.large_input_threshold {
            let most_expensive = candidates
                .iter()
                .copied()
                .filter(|k| k.is_neural())
                .max_by_key(|k| k.descriptor().peak_memory_mb);
            if let Some(skipped) = most_expensive {
                log::debug!(
                    "📏 Input side {max_dimension}px above {}px, skipping {skipped}",
                    self.large_input_threshold
                );
                candidates.retain(|k| *k != skipped);
            }
        }

        candidates
    }

    /// Produce a mask for `image`, falling back through the ranked candidates.
    ///
    /// # Errors
    /// - [`CoreError::ConfigurationError`] when the profile leaves no candidate
    /// - [`CoreError::UnsupportedInput`] when a backend rejects the input itself
    /// - [`CoreError::ResourceExhausted`] when every candidate failed for lack of memory
    /// - [`CoreError::BackendRuntimeFailure`] when every candidate failed and at
    ///   least one failure was not memory related
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub fn segment(&self, image: &Image) -> Result<SegmentationOutcome> {
        let start = Instant::now();
        let candidates = self.rank_candidates(image.max_dimension());

        if candidates.is_empty() {
            return Err(CoreError::configuration(format!(
                "No permitted backend can handle a {}x{} input",
                image.width(),
                image.height()
            )));
        }

        log::debug!(
            "🔗 Candidates: {}",
            candidates.iter().map(|k| k.name()).collect::<Vec<_>>().join(" → ")
        );

        let mut failures: Vec<(BackendKind, BackendError)> = Vec::new();

        for (index, kind) in candidates.iter().copied().enumerate() {
            let _span = span!(Level::INFO, "candidate", backend = %kind).entered();

            match self.attempt(kind, image) {
                Ok(mask) => {
                    *self.last_used.lock() = Some(kind);
                    let stats = mask.statistics();
                    log::info!(
                        "✅ Segmented with {} after {} attempt(s) in {:.0}ms ({:.1}% foreground)",
                        kind,
                        index + 1,
                        start.elapsed().as_secs_f64() * 1000.0,
                        stats.foreground_ratio * 100.0
                    );
                    return Ok(SegmentationOutcome {
                        mask,
                        backend: kind,
                        attempts: index + 1,
                        elapsed: start.elapsed(),
                    });
                },
                Err(BackendError::UnsupportedInput(message)) => {
                    return Err(CoreError::UnsupportedInput(message));
                },
                Err(err) => {
                    log::warn!("⚠️ {kind} failed, falling back: {err}");
                    failures.push((kind, err));
                },
            }
        }

        Err(Self::exhausted(failures))
    }

    fn attempt(&self, kind: BackendKind, image: &Image) -> std::result::Result<Mask, BackendError> {
        let backend = self
            .registry
            .get(kind)
            .ok_or_else(|| BackendError::runtime(format!("{kind} is not registered")))?;

        let descriptor = backend.descriptor();
        if let GuardDecision::Reject(reason) =
            self.guard.check_with_resident(descriptor, self.resident_cost(descriptor))
        {
            return Err(BackendError::resource_exhausted(reason.to_string()));
        }

        let mask = if kind.is_neural() {
            // Load failures count as resource exhaustion
            let lease = self.sessions.get_session(kind)?;
            backend.compute_mask(image, Some(lease.session()))?
        } else {
            backend.compute_mask(image, None)?
        };

        if mask.dimensions() != image.dimensions() {
            return Err(BackendError::runtime(format!(
                "{kind} returned a {}x{} mask for a {}x{} image",
                mask.width(),
                mask.height(),
                image.width(),
                image.height()
            )));
        }

        Ok(mask)
    }

    /// Peak cost already held in RSS by a reusable session of the same kind
    fn resident_cost(&self, descriptor: &BackendDescriptor) -> u64 {
        let reusable = self.sessions.policy() == SessionPolicy::Reuse
            && self.sessions.active_backend() == Some(descriptor.kind);
        if reusable {
            u64::from(descriptor.peak_memory_mb)
        } else {
            0
        }
    }

    fn exhausted(failures: Vec<(BackendKind, BackendError)>) -> CoreError {
        let all_resource = failures.iter().all(|(_, e)| e.is_resource_related());
        let summary = failures
            .iter()
            .map(|(kind, err)| format!("{kind}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");

        log::error!("❌ Every backend failed: {summary}");

        if all_resource {
            return CoreError::resource_exhausted(format!("every backend failed: {summary}"));
        }

        match failures
            .into_iter()
            .rev()
            .find(|(_, e)| !e.is_resource_related())
        {
            Some((kind, err)) => CoreError::backend_runtime(kind.name(), err.to_string()),
            None => CoreError::resource_exhausted(summary),
        }
    }

    /// Backend that produced the most recent mask
    #[must_use]
    pub fn last_used(&self) -> Option<BackendKind> {
        *self.last_used.lock()
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn guard(&self) -> &MemoryGuard {
        &self.guard
    }

    #[must_use]
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{MockBackend, MockLoader};
    use crate::color::RgbColor;
    use crate::config::ProfileKind;
    use crate::memory::{FixedMemoryProbe, MemorySnapshot};
    use crate::session::{SessionManagerConfig, SessionPolicy};
    use instant::Duration;
    use std::sync::atomic::Ordering;

    fn sessions(loader: MockLoader) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(loader),
            SessionManagerConfig {
                policy: SessionPolicy::Reuse,
                max_attempts: 2,
                retry_backoff: Duration::ZERO,
            },
        ))
    }

    fn guard_with(profile: &DeploymentProfile, rss: u64) -> (MemoryGuard, Arc<FixedMemoryProbe>) {
        let probe = Arc::new(FixedMemoryProbe::new(MemorySnapshot {
            process_rss_mb: rss,
            available_mb: 4096,
            total_mb: 8192,
        }));
        (MemoryGuard::new(probe.clone(), profile.guard_thresholds()), probe)
    }

    fn build(profile: &DeploymentProfile, registry: BackendRegistry) -> FallbackOrchestrator {
        let (guard, _) = guard_with(profile, 50);
        FallbackOrchestrator::new(profile, registry, sessions(MockLoader::new()), guard)
    }

    #[test]
    fn test_ranking_is_deterministic_and_tiered() {
        let profile = DeploymentProfile::builder()
            .promoted_backend(None)
            .build()
            .unwrap();
        let orchestrator = build(&profile, BackendRegistry::with_defaults());

        let first = orchestrator.rank_candidates(800);
        assert_eq!(
            first,
            vec![
                BackendKind::TinyNeural,
                BackendKind::StandardNeural,
                BackendKind::ComputerVision,
                BackendKind::EdgeHeuristic
            ]
        );
        for _ in 0..10 {
            assert_eq!(orchestrator.rank_candidates(800), first);
        }
    }

    #[test]
    fn test_promoted_backend_goes_first_and_edge_stays_last() {
        let profile = DeploymentProfile::preset(ProfileKind::Minimal);
        let orchestrator = build(&profile, BackendRegistry::with_defaults());

        assert_eq!(
            orchestrator.rank_candidates(500),
            vec![BackendKind::ComputerVision, BackendKind::TinyNeural, BackendKind::EdgeHeuristic]
        );
    }

    #[test]
    fn test_large_input_skips_most_expensive_neural() {
        let profile = DeploymentProfile::preset(ProfileKind::Standard);
        let orchestrator = build(&profile, BackendRegistry::with_defaults());

        let small = orchestrator.rank_candidates(1000);
        assert_eq!(small.first(), Some(&BackendKind::StandardNeural));

        let large = orchestrator.rank_candidates(2000);
        assert!(!large.contains(&BackendKind::StandardNeural));
        assert_eq!(large.first(), Some(&BackendKind::TinyNeural));
    }

    #[test]
    fn test_falls_back_past_failing_neural_backend() {
        let profile = DeploymentProfile::preset(ProfileKind::Constrained);
        let mut registry = BackendRegistry::empty();
        let tiny = MockBackend::failing(
            BackendKind::TinyNeural,
            BackendError::resource_exhausted("arena allocation failed"),
        );
        let tiny_calls = tiny.call_counter();
        registry.register(Arc::new(tiny));
        registry.register(Arc::new(MockBackend::succeeding(BackendKind::ComputerVision, 200)));
        registry.register(Arc::new(MockBackend::succeeding(BackendKind::EdgeHeuristic, 255)));

        let profile = DeploymentProfile {
            backends: vec![
                BackendKind::TinyNeural,
                BackendKind::ComputerVision,
                BackendKind::EdgeHeuristic,
            ],
            ..profile
        };
        let orchestrator = build(&profile, registry);

        let outcome = orchestrator
            .segment(&Image::filled(64, 48, RgbColor::WHITE))
            .unwrap();

        assert_eq!(outcome.backend, BackendKind::ComputerVision);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.mask.dimensions(), (64, 48));
        assert_eq!(tiny_calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.last_used(), Some(BackendKind::ComputerVision));
    }

    #[test]
    fn test_guard_rejection_skips_without_invoking() {
        let profile = DeploymentProfile::preset(ProfileKind::Constrained);
        let tiny = MockBackend::succeeding(BackendKind::TinyNeural, 255);
        let cv = MockBackend::succeeding(BackendKind::ComputerVision, 255);
        let tiny_calls = tiny.call_counter();
        let cv_calls = cv.call_counter();

        let mut registry = BackendRegistry::empty();
        registry.register(Arc::new(tiny));
        registry.register(Arc::new(cv));
        registry.register(Arc::new(MockBackend::succeeding(BackendKind::EdgeHeuristic, 128)));

        // RSS above 80% of 512MB: every guarded backend is refused
        let (guard, _) = guard_with(&profile, 450);
        let orchestrator =
            FallbackOrchestrator::new(&profile, registry, sessions(MockLoader::new()), guard);

        let outcome = orchestrator
            .segment(&Image::filled(32, 32, RgbColor::WHITE))
            .unwrap();

        assert_eq!(outcome.backend, BackendKind::EdgeHeuristic);
        assert_eq!(tiny_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cv_calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.sessions().live_sessions(), 0);
    }

    #[test]
    fn test_loaded_session_is_not_charged_again() {
        let profile = DeploymentProfile::preset(ProfileKind::Constrained);
        let (guard, probe) = guard_with(&profile, 50);
        let orchestrator = FallbackOrchestrator::new(
            &profile,
            BackendRegistry::with_defaults(),
            sessions(MockLoader::new()),
            guard,
        );
        let image = Image::filled(40, 40, RgbColor::new(30, 90, 200));

        let first = orchestrator.segment(&image).unwrap();
        assert_eq!(first.backend, BackendKind::TinyNeural);

        // The tiny model is resident: 400 + 120 would exceed 512 only if counted twice
        probe.set(Some(MemorySnapshot {
            process_rss_mb: 400,
            available_mb: 4096,
            total_mb: 8192,
        }));
        let second = orchestrator.segment(&image).unwrap();
        assert_eq!(second.backend, BackendKind::TinyNeural);
        assert_eq!(second.attempts, 1);

        // Without a resident session the same figures refuse the model
        orchestrator.sessions().clear();
        let third = orchestrator.segment(&image).unwrap();
        assert_ne!(third.backend, BackendKind::TinyNeural);
    }

    #[test]
    fn test_session_load_failure_falls_back() {
        let profile = DeploymentProfile::preset(ProfileKind::Constrained);
        let (guard, _) = guard_with(&profile, 50);
        let loader = MockLoader::new().failing_kind(BackendKind::TinyNeural);
        let orchestrator = FallbackOrchestrator::new(
            &profile,
            BackendRegistry::with_defaults(),
            sessions(loader),
            guard,
        );

        let outcome = orchestrator
            .segment(&Image::filled(40, 40, RgbColor::new(30, 90, 200)))
            .unwrap();

        assert_eq!(outcome.backend, BackendKind::StandardNeural);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(orchestrator.sessions().peak_live_sessions(), 1);
        assert_eq!(orchestrator.sessions().active_backend(), Some(BackendKind::StandardNeural));
    }

    #[test]
    fn test_empty_candidate_list_is_configuration_error() {
        let profile = DeploymentProfile::builder()
            .backends(vec![BackendKind::StandardNeural])
            .large_input_threshold(100)
            .build()
            .unwrap();
        let orchestrator = build(&profile, BackendRegistry::with_defaults());

        let result = orchestrator.segment(&Image::filled(200, 200, RgbColor::WHITE));
        assert!(matches!(result, Err(CoreError::ConfigurationError(_))));
    }

    #[test]
    fn test_exhausted_chain_classification() {
        let profile = DeploymentProfile::builder()
            .backends(vec![BackendKind::ComputerVision, BackendKind::TinyNeural])
            .promoted_backend(None)
            .build()
            .unwrap();

        let mut registry = BackendRegistry::empty();
        registry.register(Arc::new(MockBackend::failing(
            BackendKind::TinyNeural,
            BackendError::resource_exhausted("oom"),
        )));
        registry.register(Arc::new(MockBackend::failing(
            BackendKind::ComputerVision,
            BackendError::resource_exhausted("oom"),
        )));
        let orchestrator = build(&profile, registry);
        assert!(matches!(
            orchestrator.segment(&Image::filled(8, 8, RgbColor::WHITE)),
            Err(CoreError::ResourceExhausted(_))
        ));

        let mut registry = BackendRegistry::empty();
        registry.register(Arc::new(MockBackend::failing(
            BackendKind::TinyNeural,
            BackendError::resource_exhausted("oom"),
        )));
        registry.register(Arc::new(MockBackend::failing(
            BackendKind::ComputerVision,
            BackendError::runtime("bad output"),
        )));
        let orchestrator = build(&profile, registry);
        match orchestrator.segment(&Image::filled(8, 8, RgbColor::WHITE)) {
            Err(CoreError::BackendRuntimeFailure { backend, .. }) => {
                assert_eq!(backend, "computer-vision");
            },
            other => panic!("expected runtime failure, got {other:?}"),
        }
    }
}
