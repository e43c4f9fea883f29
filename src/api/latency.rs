//! In-memory histogram of poll-cycle durations.
//! Recorded by the scheduler around every cycle that actually ran.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

/// Tracks 1ms to 1h, 3 significant figures. Values stored in milliseconds.
pub struct LatencyStats {
    inner: Option<Mutex<Histogram<u64>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

impl LatencyStats {
    pub fn new() -> Self {
        let inner = Histogram::new_with_bounds(1, 3_600_000, 3).ok().map(Mutex::new);
        Self { inner }
    }

    pub fn record_ms(&self, ms: u64) {
        if let Some(inner) = &self.inner {
            let mut h = inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Out-of-range values are clamped to the tracked bounds.
            h.saturating_record(ms.max(1));
        }
    }

    pub fn record(&self, d: Duration) {
        let ms = d.as_millis().min(u128::from(u64::MAX)) as u64;
        self.record_ms(ms);
    }

    pub fn summary(&self) -> LatencySummary {
        let empty = LatencySummary { samples: 0, p50_ms: None, p95_ms: None, p99_ms: None, max_ms: None };
        let Some(inner) = &self.inner else {
            return empty;
        };
        let h = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if h.len() == 0 {
            return empty;
        }
        LatencySummary {
            samples: h.len(),
            p50_ms: Some(h.value_at_quantile(0.5)),
            p95_ms: Some(h.value_at_quantile(0.95)),
            p99_ms: Some(h.value_at_quantile(0.99)),
            max_ms: Some(h.max()),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}
