//! Owned metric primitives.
//!
//! The process-wide export path goes through the `metrics` facade (see
//! `observability`); these types exist for interfaces that hand out a
//! concrete histogram or gauge object, such as maintenance operations
//! and the operation driver. All updates are lock-free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Fixed-bucket duration histogram for fast percentile queries.
///
/// Buckets are in microseconds: [0, 100), [100, 200), ..., [9900, 10000),
/// then [10ms, 20ms), ..., [990ms, 1s), then a single ≥1s overflow bucket.
pub struct DurationHistogram {
    /// Fine-grained buckets: 0-10ms in 100µs steps.
    fine: [AtomicU64; 100],
    /// Coarse buckets: 10ms-1s in 10ms steps.
    coarse: [AtomicU64; 99],
    /// ≥1s.
    overflow: AtomicU64,
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl DurationHistogram {
    pub fn new() -> Self {
        Self {
            fine: std::array::from_fn(|_| AtomicU64::new(0)),
            coarse: std::array::from_fn(|_| AtomicU64::new(0)),
            overflow: AtomicU64::new(0),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    /// Record one observation.
    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);

        if us < 10_000 {
            let bucket = (us / 100) as usize;
            self.fine[bucket.min(99)].fetch_add(1, Ordering::Relaxed);
        } else if us < 1_000_000 {
            let bucket = ((us - 10_000) / 10_000) as usize;
            self.coarse[bucket.min(98)].fetch_add(1, Ordering::Relaxed);
        } else {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean observation in microseconds; 0 when empty.
    pub fn mean_us(&self) -> u64 {
        let c = self.count.load(Ordering::Relaxed);
        if c == 0 {
            0
        } else {
            self.sum_us.load(Ordering::Relaxed) / c
        }
    }

    /// Percentile (0.0-1.0) as the upper bound of the containing bucket,
    /// in microseconds.
    pub fn percentile_us(&self, p: f64) -> u64 {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        let target = (total as f64 * p).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, bucket) in self.fine.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return (i as u64 + 1) * 100;
            }
        }
        for (i, bucket) in self.coarse.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            if cumulative >= target {
                return 10_000 + (i as u64 + 1) * 10_000;
            }
        }
        1_000_000
    }
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DurationHistogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurationHistogram")
            .field("count", &self.count())
            .field("mean_us", &self.mean_us())
            .finish()
    }
}

/// Monotonic up/down gauge.
#[derive(Debug, Default)]
pub struct AtomicGauge {
    value: AtomicU64,
}

impl AtomicGauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        let prev = self.value.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "gauge decremented below zero");
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}
