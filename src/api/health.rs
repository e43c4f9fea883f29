//! Shared health state for the /health endpoint.
//! Updated by the polling scheduler; stream counters are read from the StreamManager.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

/// Poll-cycle health. Scheduler writes, API reads.
#[derive(Debug, Default)]
pub struct HealthState {
    /// Unix ms of the last completed cycle (0 = none yet).
    last_cycle_at_ms: AtomicU64,
    /// Unix ms of the last cycle attempt, successful or not.
    last_attempt_at_ms: AtomicU64,
    last_cycle_ok: AtomicBool,
    cycles_completed: AtomicU64,
    cycles_failed: AtomicU64,
    cycles_skipped: AtomicU64,
    consecutive_storage_failures: AtomicU32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub last_cycle_at_ms: Option<u64>,
    pub last_attempt_at_ms: Option<u64>,
    pub last_cycle_ok: bool,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub cycles_skipped: u64,
    pub consecutive_storage_failures: u32,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, at_ms: u64) {
        self.last_cycle_at_ms.store(at_ms, Ordering::Relaxed);
        self.last_attempt_at_ms.store(at_ms, Ordering::Relaxed);
        self.last_cycle_ok.store(true, Ordering::Relaxed);
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_storage_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self, at_ms: u64) {
        self.last_attempt_at_ms.store(at_ms, Ordering::Relaxed);
        self.last_cycle_ok.store(false, Ordering::Relaxed);
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the consecutive storage failure count including this one.
    pub fn record_storage_failure(&self, at_ms: u64) -> u32 {
        self.last_attempt_at_ms.store(at_ms, Ordering::Relaxed);
        self.last_cycle_ok.store(false, Ordering::Relaxed);
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_storage_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_cycles_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn cycles_skipped(&self) -> u64 {
        self.cycles_skipped.load(Ordering::Relaxed)
    }

    pub fn consecutive_storage_failures(&self) -> u32 {
        self.consecutive_storage_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let non_zero = |v: u64| (v != 0).then_some(v);
        HealthSnapshot {
            last_cycle_at_ms: non_zero(self.last_cycle_at_ms.load(Ordering::Relaxed)),
            last_attempt_at_ms: non_zero(self.last_attempt_at_ms.load(Ordering::Relaxed)),
            last_cycle_ok: self.last_cycle_ok.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            consecutive_storage_failures: self.consecutive_storage_failures(),
        }
    }
}
