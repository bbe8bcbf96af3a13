//! Await manager counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time view of the await manager counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AwaitStatistics {
    /// Callers that parked, cumulative.
    pub threads_blocked: u64,
    /// Callers woken by interruption, cumulative.
    pub threads_interrupted: u64,
    /// Sum of blocked durations, in milliseconds.
    pub total_duration_ms: u64,
    /// Shortest blocked duration, in milliseconds.
    pub min_duration_ms: u64,
    /// Longest blocked duration, in milliseconds.
    pub max_duration_ms: u64,
    /// Mean blocked duration, in milliseconds.
    pub mean_duration_ms: u64,
}

/// Lock-free counters owned by one manager instance.
#[derive(Debug)]
pub(crate) struct Counters {
    blocked: AtomicU64,
    interrupted: AtomicU64,
    finished: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            blocked: AtomicU64::new(0),
            interrupted: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }
}

impl Counters {
    pub(crate) fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duration(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.blocked.store(0, Ordering::Relaxed);
        self.interrupted.store(0, Ordering::Relaxed);
        self.finished.store(0, Ordering::Relaxed);
        self.total_ms.store(0, Ordering::Relaxed);
        self.min_ms.store(u64::MAX, Ordering::Relaxed);
        self.max_ms.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> AwaitStatistics {
        let finished = self.finished.load(Ordering::Relaxed);
        let total = self.total_ms.load(Ordering::Relaxed);
        let min = self.min_ms.load(Ordering::Relaxed);

        AwaitStatistics {
            threads_blocked: self.blocked.load(Ordering::Relaxed),
            threads_interrupted: self.interrupted.load(Ordering::Relaxed),
            total_duration_ms: total,
            min_duration_ms: if finished == 0 { 0 } else { min },
            max_duration_ms: self.max_ms.load(Ordering::Relaxed),
            mean_duration_ms: total.checked_div(finished).unwrap_or(0),
        }
    }
}
