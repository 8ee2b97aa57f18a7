//! Memory introspection and the admission check run before each guarded backend
//!
//! The guard is a pure function of a [`MemorySnapshot`] and a
//! [`BackendDescriptor`]. Where the snapshot comes from is pluggable through
//! [`MemoryProbe`]: [`SystemMemoryProbe`] asks the OS via `sysinfo`,
//! [`FixedMemoryProbe`] returns whatever a test or simulation sets.

use crate::backends::BackendDescriptor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Point-in-time memory figures, all in MB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub process_rss_mb: u64,
    pub available_mb: u64,
    pub total_mb: u64,
}

/// Source of memory snapshots
pub trait MemoryProbe: Send + Sync {
    /// Current figures, or `None` when the platform cannot report them
    fn snapshot(&self) -> Option<MemorySnapshot>;
}

/// Reads process RSS and system memory through `sysinfo`
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemMemoryProbe {
    #[must_use]
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("⚠️ Cannot determine current PID, process RSS unavailable: {e}");
                None
            },
        };
        Self {
            system: Mutex::new(system),
            pid,
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_memory(),
        );

        // sysinfo reports 0 where available memory is unknown
        let available = system.available_memory();
        if available == 0 {
            return None;
        }

        let rss = system.process(pid)?.memory();
        Some(MemorySnapshot {
            process_rss_mb: rss / BYTES_PER_MB,
            available_mb: available / BYTES_PER_MB,
            total_mb: system.total_memory() / BYTES_PER_MB,
        })
    }
}

impl fmt::Debug for SystemMemoryProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMemoryProbe")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Probe returning a settable snapshot; `None` simulates an introspection failure
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    snapshot: Mutex<Option<MemorySnapshot>>,
}

impl FixedMemoryProbe {
    #[must_use]
    pub fn new(snapshot: MemorySnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
        }
    }

    /// A probe whose every read fails
    #[must_use]
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn set(&self, snapshot: Option<MemorySnapshot>) {
        *self.snapshot.lock() = snapshot;
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        *self.snapshot.lock()
    }
}

/// Guard thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuardThresholds {
    /// Memory budget of the whole process, in MB
    pub budget_mb: u64,
    /// Fraction of the budget above which no guarded backend starts
    pub high_water_ratio: f64,
    /// System memory floor below which no guarded backend starts, in MB
    pub min_available_mb: u64,
}

/// Why a backend was refused
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum GuardRejection {
    #[error("process RSS {rss_mb}MB above high-water mark {limit_mb}MB")]
    HighWater { rss_mb: u64, limit_mb: u64 },

    #[error("system available memory {available_mb}MB below floor {floor_mb}MB")]
    LowSystemMemory { available_mb: u64, floor_mb: u64 },

    #[error("RSS {rss_mb}MB + peak {cost_mb}MB exceeds budget {budget_mb}MB")]
    OverBudget {
        rss_mb: u64,
        cost_mb: u64,
        budget_mb: u64,
    },
}

/// Outcome of a guard check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardDecision {
    Allow,
    /// Allowed because memory could not be read
    AllowUnverified,
    /// Not subject to the guard
    Exempt,
    Reject(GuardRejection),
}

impl GuardDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Reject(_))
    }
}

/// Admission check against the configured thresholds
#[derive(Clone)]
pub struct MemoryGuard {
    probe: Arc<dyn MemoryProbe>,
    thresholds: GuardThresholds,
}

impl MemoryGuard {
    #[must_use]
    pub fn new(probe: Arc<dyn MemoryProbe>, thresholds: GuardThresholds) -> Self {
        Self { probe, thresholds }
    }

    #[must_use]
    pub fn thresholds(&self) -> &GuardThresholds {
        &self.thresholds
    }

    /// Current figures from the probe
    #[must_use]
    pub fn snapshot(&self) -> Option<MemorySnapshot> {
        self.probe.snapshot()
    }

    /// Decide whether `descriptor` may run now. Never mutates anything.
    #[must_use]
    pub fn check(&self, descriptor: &BackendDescriptor) -> GuardDecision {
        self.check_with_resident(descriptor, 0)
    }

    /// Like [`check`](Self::check), for a backend whose model already holds
    /// `resident_mb` of the process RSS. Only the remainder of its peak cost
    /// is charged against the budget.
    #[must_use]
    pub fn check_with_resident(
        &self,
        descriptor: &BackendDescriptor,
        resident_mb: u64,
    ) -> GuardDecision {
        if !descriptor.guarded {
            return GuardDecision::Exempt;
        }

        let Some(snapshot) = self.probe.snapshot() else {
            log::warn!(
                "⚠️ Memory introspection failed, allowing {} unverified",
                descriptor.name
            );
            return GuardDecision::AllowUnverified;
        };

        let decision = Self::evaluate(&self.thresholds, &snapshot, descriptor, resident_mb);
        match &decision {
            GuardDecision::Reject(reason) => {
                log::warn!("🛑 Memory guard rejected {}: {}", descriptor.name, reason);
            },
            _ => log::debug!(
                "✅ Memory guard allowed {} (RSS {}MB, available {}MB)",
                descriptor.name,
                snapshot.process_rss_mb,
                snapshot.available_mb
            ),
        }
        decision
    }

    fn evaluate(
        thresholds: &GuardThresholds,
        snapshot: &MemorySnapshot,
        descriptor: &BackendDescriptor,
        resident_mb: u64,
    ) -> GuardDecision {
        let high_water = (thresholds.budget_mb as f64 * thresholds.high_water_ratio) as u64;
        if snapshot.process_rss_mb > high_water {
            return GuardDecision::Reject(GuardRejection::HighWater {
                rss_mb: snapshot.process_rss_mb,
                limit_mb: high_water,
            });
        }

        if snapshot.available_mb < thresholds.min_available_mb {
            return GuardDecision::Reject(GuardRejection::LowSystemMemory {
                available_mb: snapshot.available_mb,
                floor_mb: thresholds.min_available_mb,
            });
        }

        let cost = u64::from(descriptor.peak_memory_mb).saturating_sub(resident_mb);
        if snapshot.process_rss_mb + cost > thresholds.budget_mb {
            return GuardDecision::Reject(GuardRejection::OverBudget {
                rss_mb: snapshot.process_rss_mb,
                cost_mb: cost,
                budget_mb: thresholds.budget_mb,
            });
        }

        GuardDecision::Allow
    }
}

impl fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("thresholds", &self.thresholds)
            .finish_non_exhaustive()
    }
}
