//! Recompute latency: time from an accepted merge to a published view.

use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;

/// Upper bound of the histogram, in microseconds (60s).
const MAX_TRACKED_US: u64 = 60_000_000;

/// p50 / p95 / p99 in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Percentiles {
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Shared by the view tracker (records) and the diagnostics task (reads).
pub struct LatencyStats {
    // None only if hdrhistogram refused the bounds, in which case nothing is recorded.
    inner: Mutex<Option<Histogram<u64>>>,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Histogram::new_with_bounds(1, MAX_TRACKED_US, 3).ok()) }
    }

    pub fn record(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX).clamp(1, MAX_TRACKED_US);
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(h) = guard.as_mut() {
                let _ = h.record(us);
            }
        }
    }

    /// None until something has been recorded.
    pub fn percentiles(&self) -> Option<Percentiles> {
        let guard = self.inner.lock().ok()?;
        let h = guard.as_ref().filter(|h| h.len() > 0)?;
        Some(Percentiles {
            p50_us: h.value_at_quantile(0.50),
            p95_us: h.value_at_quantile(0.95),
            p99_us: h.value_at_quantile(0.99),
        })
    }

    pub fn len(&self) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|h| h.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}
