//! Background model warm-up
//!
//! Loads the preferred neural model through the normal session path and runs
//! one inference on a synthetic image, so the first real request does not pay
//! the load cost. Failures are logged and recorded, never propagated.

use crate::backends::BackendKind;
use crate::color::RgbColor;
use crate::memory::GuardDecision;
use crate::orchestrator::FallbackOrchestrator;
use crate::session::SessionPolicy;
use crate::types::Image;
use instant::Instant;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Side length of the synthetic warm-up image
const WARMUP_SIZE: u32 = 100;

/// Neural backends tried: the preferred one plus one backup
const MAX_WARMUP_CANDIDATES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmerStatus {
    NotStarted,
    Warming,
    Ready,
    Failed,
}

/// Tracks and runs the warm-up
#[derive(Debug, Clone)]
pub struct Warmer {
    status: Arc<Mutex<WarmerStatus>>,
    warmed: Arc<Mutex<Option<BackendKind>>>,
}

impl Default for Warmer {
    fn default() -> Self {
        Self::new()
    }
}

impl Warmer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: Arc::new(Mutex::new(WarmerStatus::NotStarted)),
            warmed: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn status(&self) -> WarmerStatus {
        *self.status.lock()
    }

    /// Backend whose session was warmed, once ready
    #[must_use]
    pub fn warmed_backend(&self) -> Option<BackendKind> {
        *self.warmed.lock()
    }

    fn set_status(&self, status: WarmerStatus) {
        *self.status.lock() = status;
    }

    /// Start warming on the tokio blocking pool.
    ///
    /// Returns `None` when warming is skipped. Without a tokio runtime the
    /// work runs on a plain thread and no handle is returned.
    pub fn spawn(
        &self,
        orchestrator: Arc<FallbackOrchestrator>,
    ) -> Option<tokio::task::JoinHandle<WarmerStatus>> {
        if orchestrator.sessions().policy() == SessionPolicy::FreshPerRequest {
            log::info!("⏭️ Skipping warm-up: sessions are created per request");
            return None;
        }

        self.set_status(WarmerStatus::Warming);
        let warmer = self.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn_blocking(move || warmer.warm_blocking(&orchestrator))),
            Err(_) => {
                log::debug!("No tokio runtime, warming on a plain thread");
                std::thread::spawn(move || warmer.warm_blocking(&orchestrator));
                None
            },
        }
    }

    /// Warm synchronously and return the final status.
    ///
    /// Warming is skipped under [`SessionPolicy::FreshPerRequest`], where a
    /// warmed session would be released immediately.
    pub fn warm_blocking(&self, orchestrator: &FallbackOrchestrator) -> WarmerStatus {
        if orchestrator.sessions().policy() == SessionPolicy::FreshPerRequest {
            self.set_status(WarmerStatus::NotStarted);
            return WarmerStatus::NotStarted;
        }

        let candidates: Vec<BackendKind> = orchestrator
            .rank_candidates(WARMUP_SIZE)
            .into_iter()
            .filter(|k| k.is_neural())
            .take(MAX_WARMUP_CANDIDATES)
            .collect();

        if candidates.is_empty() {
            log::info!("⏭️ No neural backend permitted, nothing to warm");
            self.set_status(WarmerStatus::NotStarted);
            return WarmerStatus::NotStarted;
        }

        self.set_status(WarmerStatus::Warming);
        let image = Image::filled(WARMUP_SIZE, WARMUP_SIZE, RgbColor::new(128, 128, 128));

        for kind in candidates {
            let start = Instant::now();
            match Self::warm_one(orchestrator, kind, &image) {
                Ok(()) => {
                    log::info!(
                        "🔥 Warmed {} in {:.0}ms",
                        kind,
                        start.elapsed().as_secs_f64() * 1000.0
                    );
                    *self.warmed.lock() = Some(kind);
                    self.set_status(WarmerStatus::Ready);
                    return WarmerStatus::Ready;
                },
                Err(reason) => log::warn!("⚠️ Warm-up of {kind} failed: {reason}"),
            }
        }

        self.set_status(WarmerStatus::Failed);
        WarmerStatus::Failed
    }

    fn warm_one(
        orchestrator: &FallbackOrchestrator,
        kind: BackendKind,
        image: &Image,
    ) -> std::result::Result<(), String> {
        let backend = orchestrator
            .registry()
            .get(kind)
            .ok_or_else(|| format!("{kind} is not registered"))?;

        if let GuardDecision::Reject(reason) = orchestrator.guard().check(backend.descriptor()) {
            return Err(reason.to_string());
        }

        let lease = orchestrator
            .sessions()
            .get_session(kind)
            .map_err(|e| e.to_string())?;
        backend
            .compute_mask(image, Some(lease.session()))
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::MockLoader;
    use crate::backends::BackendRegistry;
    use crate::config::{DeploymentProfile, ProfileKind};
    use crate::memory::{FixedMemoryProbe, MemoryGuard};
    use crate::session::SessionManager;

    fn orchestrator(profile: &DeploymentProfile, loader: MockLoader) -> FallbackOrchestrator {
        let sessions = Arc::new(SessionManager::new(
            Arc::new(loader),
            crate::session::SessionManagerConfig {
                retry_backoff: instant::Duration::ZERO,
                ..profile.session_manager_config()
            },
        ));
        let guard = MemoryGuard::new(
            Arc::new(FixedMemoryProbe::unavailable()),
            profile.guard_thresholds(),
        );
        FallbackOrchestrator::new(profile, BackendRegistry::with_defaults(), sessions, guard)
    }

    #[test]
    fn test_warms_preferred_backend() {
        let profile = DeploymentProfile::preset(ProfileKind::Constrained);
        let orchestrator = orchestrator(&profile, MockLoader::new());
        let warmer = Warmer::new();

        assert_eq!(warmer.warm_blocking(&orchestrator), WarmerStatus::Ready);
        assert_eq!(warmer.warmed_backend(), Some(BackendKind::TinyNeural));
        assert_eq!(orchestrator.sessions().active_backend(), Some(BackendKind::TinyNeural));
    }

    #[test]
    fn test_falls_back_to_backup_model() {
        let profile = DeploymentProfile::preset(ProfileKind::Constrained);
        let orchestrator =
            orchestrator(&profile, MockLoader::new().failing_kind(BackendKind::TinyNeural));
        let warmer = Warmer::new();

        assert_eq!(warmer.warm_blocking(&orchestrator), WarmerStatus::Ready);
        assert_eq!(warmer.warmed_backend(), Some(BackendKind::StandardNeural));
        assert_eq!(orchestrator.sessions().live_sessions(), 1);
    }

    #[test]
    fn test_all_failures_mark_failed() {
        let profile = DeploymentProfile::preset(ProfileKind::Constrained);
        let orchestrator = orchestrator(&profile, MockLoader::new().failing_first(100));
        let warmer = Warmer::new();

        assert_eq!(warmer.warm_blocking(&orchestrator), WarmerStatus::Failed);
        assert_eq!(orchestrator.sessions().live_sessions(), 0);
    }

    #[test]
    fn test_skipped_for_fresh_sessions() {
        let profile = DeploymentProfile::preset(ProfileKind::Minimal);
        let orchestrator = Arc::new(orchestrator(&profile, MockLoader::new()));
        let warmer = Warmer::new();

        assert!(warmer.spawn(Arc::clone(&orchestrator)).is_none());
        assert_eq!(warmer.status(), WarmerStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_spawn_runs_on_blocking_pool() {
        let profile = DeploymentProfile::preset(ProfileKind::Constrained);
        let orchestrator = Arc::new(orchestrator(&profile, MockLoader::new()));
        let warmer = Warmer::new();

        let handle = warmer.spawn(orchestrator).unwrap();
        assert_eq!(handle.await.unwrap(), WarmerStatus::Ready);
        assert_eq!(warmer.status(), WarmerStatus::Ready);
    }
}
