//! Process-wide registry of in-flight operations.
//!
//! One lock covers the pending set and every counter, so the
//! conservation invariant (`total == Σ per-kind`, each counter ≥ 0)
//! holds at every observable instant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kestrel_common::observability;
use kestrel_common::types::OperationKind;

use crate::driver::OperationDriver;

/// In-flight operation counters: one total and one per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InFlightCounters {
    pub total: u64,
    pub write: u64,
    pub alter_schema: u64,
    pub change_config: u64,
}

impl InFlightCounters {
    pub(crate) fn increment(&mut self, kind: OperationKind) {
        self.total += 1;
        *self.slot(kind) += 1;
    }

    pub(crate) fn decrement(&mut self, kind: OperationKind) {
        assert!(self.total > 0, "total in-flight counter underflow");
        self.total -= 1;
        let slot = self.slot(kind);
        assert!(*slot > 0, "{kind} in-flight counter underflow");
        *slot -= 1;
    }

    fn slot(&mut self, kind: OperationKind) -> &mut u64 {
        match kind {
            OperationKind::Write => &mut self.write,
            OperationKind::AlterSchema => &mut self.alter_schema,
            OperationKind::ChangeConfig => &mut self.change_config,
        }
    }

    pub fn get(&self, kind: OperationKind) -> u64 {
        match kind {
            OperationKind::Write => self.write,
            OperationKind::AlterSchema => self.alter_schema,
            OperationKind::ChangeConfig => self.change_config,
        }
    }
}

struct TrackerInner {
    pending: HashMap<u64, Arc<OperationDriver>>,
    counters: InFlightCounters,
}

/// Outcome of a [`OperationTracker::wait_for_all_to_finish`] drain.
#[derive(Debug, Clone, Copy)]
pub struct DrainStats {
    pub waited: Duration,
    /// Slow-drain warnings logged: one per whole second of total wait.
    pub warnings: u32,
}

/// Thread-safe in-flight operation registry.
///
/// Every driver contributes exactly one increment on `add` and one
/// decrement on `release`. Dropping a tracker with pending operations is
/// a logic error.
pub struct OperationTracker {
    inner: Mutex<TrackerInner>,
}

impl OperationTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TrackerInner {
                pending: HashMap::new(),
                counters: InFlightCounters::default(),
            }),
        })
    }

    /// Register a driver. The tracker holds a shared handle until
    /// `release`.
    pub fn add(&self, driver: &Arc<OperationDriver>) {
        let counters = {
            let mut inner = self.inner.lock();
            inner.counters.increment(driver.kind());
            let previous = inner.pending.insert(driver.id(), driver.clone());
            assert!(previous.is_none(), "driver {} added twice", driver.id());
            inner.counters
        };
        export_gauges(&counters);
    }

    /// Remove a driver and decrement its counters. Releasing a driver
    /// that was never added is a logic error.
    pub fn release(&self, driver: &OperationDriver) {
        let counters = {
            let mut inner = self.inner.lock();
            inner.counters.decrement(driver.kind());
            let removed = inner.pending.remove(&driver.id());
            assert!(
                removed.is_some(),
                "released driver {} not in pending set",
                driver.id()
            );
            inner.counters
        };
        export_gauges(&counters);
    }

    /// Snapshot of the pending drivers (shared handles).
    pub fn get_pending(&self) -> Vec<Arc<OperationDriver>> {
        self.inner.lock().pending.values().cloned().collect()
    }

    pub fn num_pending_for_tests(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Consistent snapshot of all counters.
    pub fn counters(&self) -> InFlightCounters {
        self.inner.lock().counters
    }

    pub fn num_in_flight(&self) -> u64 {
        self.inner.lock().counters.total
    }

    pub fn num_in_flight_of(&self, kind: OperationKind) -> u64 {
        self.inner.lock().counters.get(kind)
    }

    /// Block until the pending set drains. Polls with exponential
    /// backoff (250 µs initial, ×5/4 per round, capped at 1 s) and logs
    /// a warning once per whole second of total wait, dumping the
    /// still-pending drivers. No deadline; wrap in an external timeout
    /// if one is needed.
    pub fn wait_for_all_to_finish(&self) -> DrainStats {
        const COMPLAIN_INTERVAL: Duration = Duration::from_secs(1);
        const MAX_WAIT: Duration = Duration::from_secs(1);

        let start = Instant::now();
        let mut wait = Duration::from_micros(250);
        let mut warnings = 0u32;
        loop {
            let pending = self.get_pending();
            if pending.is_empty() {
                break;
            }
            let waited = start.elapsed();
            if waited.as_millis() / COMPLAIN_INTERVAL.as_millis() > warnings as u128 {
                warnings += 1;
                tracing::warn!(
                    pending = pending.len(),
                    waited_ms = waited.as_millis() as u64,
                    "waiting for in-flight operations to complete"
                );
                for driver in &pending {
                    tracing::info!(driver = %driver, "still pending");
                }
            }
            std::thread::sleep(wait);
            wait = (wait * 5 / 4).min(MAX_WAIT);
        }
        DrainStats {
            waited: start.elapsed(),
            warnings,
        }
    }
}

impl Drop for OperationTracker {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let inner = self.inner.lock();
            assert!(
                inner.pending.is_empty(),
                "tracker dropped with {} pending operations",
                inner.pending.len()
            );
        }
    }
}

fn export_gauges(counters: &InFlightCounters) {
    observability::record_operations_inflight("all", counters.total);
    observability::record_operations_inflight(OperationKind::Write.as_str(), counters.write);
    observability::record_operations_inflight(
        OperationKind::AlterSchema.as_str(),
        counters.alter_schema,
    );
    observability::record_operations_inflight(
        OperationKind::ChangeConfig.as_str(),
        counters.change_config,
    );
}
