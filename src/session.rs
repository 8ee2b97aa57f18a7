//! Session management for neural runtimes
//!
//! The [`SessionManager`] owns at most one loaded neural model per process.
//! Callers borrow it through a [`SessionLease`] that lives for one call frame:
//!
//! - Under [`SessionPolicy::Reuse`] the slot lock is held only while the slot
//!   changes. Leases share a read gate; evicting a session takes the write side
//!   of that gate, so a session is never dropped under an in-flight inference
//!   and two models are never resident at once.
//! - Under [`SessionPolicy::FreshPerRequest`] each lease creates a new session
//!   and keeps the slot lock until it is returned, when the session is
//!   released. Concurrent requests queue on the lock.
//!
//! [`Session`]'s `Drop` is the only place a loaded model is released.

use crate::backends::BackendKind;
use crate::error::{BackendError, SessionError};
use crate::runtime::{InferenceEngine, SessionLoader};
use instant::{Duration, Instant};
use ndarray::Array4;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{span, Level};

/// Whether a loaded session outlives the request that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Keep the session loaded and hand it to later requests for the same backend
    Reuse,
    /// Create a session per request and release it afterwards
    FreshPerRequest,
}

/// A loaded neural model
pub struct Session {
    id: u64,
    kind: BackendKind,
    created_at: Instant,
    engine: Mutex<Box<dyn InferenceEngine>>,
    live: Arc<AtomicUsize>,
}

impl Session {
    fn new(
        id: u64,
        kind: BackendKind,
        engine: Box<dyn InferenceEngine>,
        live: Arc<AtomicUsize>,
        peak: &AtomicUsize,
    ) -> Self {
        let now_live = live.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now_live, Ordering::SeqCst);
        Self {
            id,
            kind,
            created_at: Instant::now(),
            engine: Mutex::new(engine),
            live,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[must_use]
    pub fn runtime_name(&self) -> &'static str {
        self.engine.lock().runtime_name()
    }

    /// Run one forward pass. Concurrent callers on the same session take turns.
    ///
    /// # Errors
    /// - Whatever the underlying engine reports
    pub fn run(&self, input: &Array4<f32>) -> Result<Array4<f32>, BackendError> {
        self.engine.lock().infer(input)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        log::debug!(
            "🧹 Released session #{} ({}) after {:.1}s",
            self.id,
            self.kind,
            self.created_at.elapsed().as_secs_f64()
        );
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Counters describing session churn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub creations: u64,
    pub reuses: u64,
    pub evictions: u64,
    pub load_attempts: u64,
    pub load_failures: u64,
}

/// Tunables for [`SessionManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionManagerConfig {
    pub policy: SessionPolicy,
    /// Load attempts before giving up
    pub max_attempts: u32,
    /// Pause between failed load attempts
    pub retry_backoff: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            policy: SessionPolicy::Reuse,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Default)]
struct SessionSlot {
    active: Option<Arc<Session>>,
}

/// Borrowed access to the active session for the duration of one call
pub struct SessionLease<'a> {
    // Declared first so the session is dropped before the hold is released
    session: Arc<Session>,
    hold: LeaseHold<'a>,
}

enum LeaseHold<'a> {
    Shared { _gate: RwLockReadGuard<'a, ()> },
    Exclusive {
        slot: MutexGuard<'a, SessionSlot>,
        manager: &'a SessionManager,
    },
}

impl SessionLease<'_> {
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Deref for SessionLease<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        if let LeaseHold::Exclusive { slot, manager } = &mut self.hold {
            if slot.active.take().is_some() {
                manager.set_active_kind(None);
                log::debug!("♻️ Fresh session #{} returned", self.session.id());
            }
        }
    }
}

/// Owner of the single active neural session
pub struct SessionManager {
    slot: Mutex<SessionSlot>,
    gate: RwLock<()>,
    active_kind: Mutex<Option<BackendKind>>,
    loader: Arc<dyn SessionLoader>,
    config: SessionManagerConfig,
    live: Arc<AtomicUsize>,
    peak_live: AtomicUsize,
    next_id: AtomicU64,
    stats: Mutex<SessionStats>,
}

impl SessionManager {
    #[must_use]
    pub fn new(loader: Arc<dyn SessionLoader>, config: SessionManagerConfig) -> Self {
        Self {
            slot: Mutex::new(SessionSlot::default()),
            gate: RwLock::new(()),
            active_kind: Mutex::new(None),
            loader,
            config,
            live: Arc::new(AtomicUsize::new(0)),
            peak_live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            stats: Mutex::new(SessionStats::default()),
        }
    }

    /// Lease a session for `kind`, creating or replacing the active one as needed.
    ///
    /// A thread must return its lease before asking for another one.
    ///
    /// # Errors
    /// - [`SessionError::NotNeural`] for session-less backends
    /// - [`SessionError::LoadFailure`] once every attempt failed
    pub fn get_session(&self, kind: BackendKind) -> Result<SessionLease<'_>, SessionError> {
        if !kind.is_neural() {
            return Err(SessionError::NotNeural(kind));
        }

        let mut slot = self.slot.lock();

        match self.config.policy {
            SessionPolicy::Reuse => {
                if let Some(session) = slot.active.as_ref().filter(|s| s.kind() == kind) {
                    let session = Arc::clone(session);
                    let gate = self.gate.read();
                    self.stats.lock().reuses += 1;
                    log::debug!("♻️ Reusing session #{} ({})", session.id(), kind);
                    return Ok(SessionLease {
                        session,
                        hold: LeaseHold::Shared { _gate: gate },
                    });
                }

                self.drain_and_evict(&mut slot, "switching backend");
                let session = Arc::new(self.create_with_retry(kind)?);
                slot.active = Some(Arc::clone(&session));
                self.set_active_kind(Some(kind));

                let gate = self.gate.read();
                Ok(SessionLease {
                    session,
                    hold: LeaseHold::Shared { _gate: gate },
                })
            },
            SessionPolicy::FreshPerRequest => {
                self.drain_and_evict(&mut slot, "fresh session per request");
                let session = Arc::new(self.create_with_retry(kind)?);
                slot.active = Some(Arc::clone(&session));
                self.set_active_kind(Some(kind));

                Ok(SessionLease {
                    session,
                    hold: LeaseHold::Exclusive {
                        slot,
                        manager: self,
                    },
                })
            },
        }
    }

    /// Release the active session, if any. Safe to call repeatedly.
    ///
    /// Returns whether a session was released.
    pub fn clear(&self) -> bool {
        let mut slot = self.slot.lock();
        self.drain_and_evict(&mut slot, "explicit clear")
    }

    #[must_use]
    pub fn active_backend(&self) -> Option<BackendKind> {
        *self.active_kind.lock()
    }

    /// Sessions currently alive, whether active or still being returned
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously alive sessions observed
    #[must_use]
    pub fn peak_live_sessions(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        *self.stats.lock()
    }

    #[must_use]
    pub fn policy(&self) -> SessionPolicy {
        self.config.policy
    }

    fn set_active_kind(&self, kind: Option<BackendKind>) {
        *self.active_kind.lock() = kind;
    }

    /// Wait for outstanding leases, then drop the active session
    fn drain_and_evict(&self, slot: &mut SessionSlot, reason: &str) -> bool {
        let _drained = self.gate.write();
        let Some(old) = slot.active.take() else {
            return false;
        };

        log::info!(
            "🧹 Evicting session #{} ({}): {}",
            old.id(),
            old.kind(),
            reason
        );
        self.stats.lock().evictions += 1;
        self.set_active_kind(None);
        drop(old);
        true
    }

    fn create_with_retry(&self, kind: BackendKind) -> Result<Session, SessionError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let _span = span!(Level::INFO, "session_load", backend = %kind, attempt).entered();
            let load_start = Instant::now();
            self.stats.lock().load_attempts += 1;

            match self.loader.load(kind) {
                Ok(engine) => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let session =
                        Session::new(id, kind, engine, Arc::clone(&self.live), &self.peak_live);
                    self.stats.lock().creations += 1;
                    log::info!(
                        "🧠 Loaded session #{} for {} on attempt {} in {:.0}ms",
                        id,
                        kind,
                        attempt,
                        load_start.elapsed().as_secs_f64() * 1000.0
                    );
                    return Ok(session);
                },
                Err(err @ (SessionError::NotNeural(_) | SessionError::RuntimeUnavailable(_))) => {
                    self.stats.lock().load_failures += 1;
                    return Err(err);
                },
                Err(err) => {
                    last_error = match err {
                        SessionError::LoadFailure { last_error, .. } => last_error,
                        other => other.to_string(),
                    };
                    log::warn!(
                        "⚠️ Loading {} failed (attempt {}/{}): {}",
                        kind,
                        attempt,
                        max_attempts,
                        last_error
                    );

                    if attempt < max_attempts {
                        self.loader.reclaim();
                        if !self.config.retry_backoff.is_zero() {
                            std::thread::sleep(self.config.retry_backoff);
                        }
                    }
                },
            }
        }

        self.stats.lock().load_failures += 1;
        log::error!("❌ Giving up on {kind} after {max_attempts} attempts");
        Err(SessionError::LoadFailure {
            backend: kind,
            attempts: max_attempts,
            last_error,
        })
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("policy", &self.config.policy)
            .field("active", &self.active_backend())
            .field("live", &self.live_sessions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{MockEngine, MockLoader};

    fn manager(loader: MockLoader, policy: SessionPolicy) -> SessionManager {
        SessionManager::new(
            Arc::new(loader),
            SessionManagerConfig {
                policy,
                max_attempts: 3,
                retry_backoff: Duration::ZERO,
            },
        )
    }

    #[test]
    fn test_same_backend_is_reused() {
        let loader = MockLoader::new();
        let history = loader.call_history();
        let manager = manager(loader, SessionPolicy::Reuse);

        let first_id = manager.get_session(BackendKind::TinyNeural).unwrap().id();
        let second_id = manager.get_session(BackendKind::TinyNeural).unwrap().id();

        assert_eq!(first_id, second_id);
        assert_eq!(history.lock().unwrap().len(), 1);
        assert_eq!(manager.stats().reuses, 1);
        assert_eq!(manager.active_backend(), Some(BackendKind::TinyNeural));
        assert_eq!(manager.live_sessions(), 1);
    }

    #[test]
    fn test_switching_backend_evicts_previous() {
        let manager = manager(MockLoader::new(), SessionPolicy::Reuse);

        drop(manager.get_session(BackendKind::TinyNeural).unwrap());
        let lease = manager.get_session(BackendKind::StandardNeural).unwrap();

        assert_eq!(lease.kind(), BackendKind::StandardNeural);
        assert_eq!(manager.stats().evictions, 1);
        assert_eq!(manager.live_sessions(), 1);
        assert_eq!(manager.peak_live_sessions(), 1);
    }

    #[test]
    fn test_fresh_policy_recreates_and_releases() {
        let manager = manager(MockLoader::new(), SessionPolicy::FreshPerRequest);

        let first_id = {
            let lease = manager.get_session(BackendKind::TinyNeural).unwrap();
            assert_eq!(manager.live_sessions(), 1);
            lease.id()
        };
        assert_eq!(manager.live_sessions(), 0);
        assert_eq!(manager.active_backend(), None);

        let second_id = manager.get_session(BackendKind::TinyNeural).unwrap().id();
        assert_ne!(first_id, second_id);
        assert_eq!(manager.stats().creations, 2);
        assert_eq!(manager.stats().reuses, 0);
    }

    #[test]
    fn test_retry_then_success() {
        let loader = MockLoader::new().failing_first(2);
        let manager = manager(loader, SessionPolicy::Reuse);

        let lease = manager.get_session(BackendKind::TinyNeural).unwrap();
        assert_eq!(lease.kind(), BackendKind::TinyNeural);

        let stats = manager.stats();
        assert_eq!(stats.load_attempts, 3);
        assert_eq!(stats.creations, 1);
        assert_eq!(stats.load_failures, 0);
    }

    #[test]
    fn test_exhausted_retries_leave_nothing_behind() {
        let loader = MockLoader::new().failing_first(10);
        let manager = manager(loader, SessionPolicy::Reuse);

        let err = manager.get_session(BackendKind::StandardNeural).err().unwrap();
        match err {
            SessionError::LoadFailure {
                backend, attempts, ..
            } => {
                assert_eq!(backend, BackendKind::StandardNeural);
                assert_eq!(attempts, 3);
            },
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(manager.live_sessions(), 0);
        assert_eq!(manager.active_backend(), None);
        assert_eq!(manager.stats().load_failures, 1);
    }

    #[test]
    fn test_failed_switch_clears_old_session() {
        let loader = MockLoader::new().failing_kind(BackendKind::StandardNeural);
        let manager = manager(loader, SessionPolicy::Reuse);

        drop(manager.get_session(BackendKind::TinyNeural).unwrap());
        assert!(manager.get_session(BackendKind::StandardNeural).is_err());
        assert_eq!(manager.live_sessions(), 0);
        assert_eq!(manager.active_backend(), None);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let manager = manager(MockLoader::new(), SessionPolicy::Reuse);
        assert!(!manager.clear());

        drop(manager.get_session(BackendKind::TinyNeural).unwrap());
        assert!(manager.clear());
        assert!(!manager.clear());
        assert_eq!(manager.live_sessions(), 0);
    }

    #[test]
    fn test_session_less_backends_are_rejected() {
        let manager = manager(MockLoader::new(), SessionPolicy::Reuse);
        assert_eq!(
            manager.get_session(BackendKind::EdgeHeuristic).err(),
            Some(SessionError::NotNeural(BackendKind::EdgeHeuristic))
        );
    }

    #[test]
    fn test_session_runs_engine() {
        let loader = MockLoader::new().with_engine(|| MockEngine::constant(0.75));
        let manager = manager(loader, SessionPolicy::Reuse);
        let lease = manager.get_session(BackendKind::TinyNeural).unwrap();

        let output = lease.run(&Array4::zeros((1, 3, 8, 8))).unwrap();
        assert_eq!(output.dim(), (1, 1, 8, 8));
        assert!(output.iter().all(|&v| (v - 0.75).abs() < f32::EPSILON));
        assert_eq!(lease.runtime_name(), "mock");
    }

    #[test]
    fn test_concurrent_leases_never_exceed_one_session() {
        let manager = Arc::new(manager(MockLoader::new(), SessionPolicy::Reuse));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    for round in 0..20 {
                        let kind = if (i + round) % 2 == 0 {
                            BackendKind::TinyNeural
                        } else {
                            BackendKind::StandardNeural
                        };
                        let lease = manager.get_session(kind).unwrap();
                        assert_eq!(lease.kind(), kind);
                        lease.run(&Array4::zeros((1, 3, 4, 4))).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(manager.peak_live_sessions(), 1);
    }
}
