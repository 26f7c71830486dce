//! Background maintenance scheduling.
//!
//! Registered operations (flushes, compactions) are polled every
//! scheduling period for stats, ranked under resource pressure, and at
//! most one is dispatched per polling iteration onto a worker pool.
//! Selection policy, in order:
//!
//! 1. If the RAM anchored across all registered ops exceeds the memory
//!    target, run the op anchoring the most RAM regardless of perf.
//! 2. If any op anchors a transaction older than the configured age
//!    threshold, run the op with the oldest anchored age.
//! 3. Otherwise run the op with the best perf improvement; ops with no
//!    improvement are never chosen on this branch. Ties go to the first
//!    name in order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use kestrel_common::config::MaintenanceConfig;
use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::metrics::{AtomicGauge, DurationHistogram};
use kestrel_common::observability;
use kestrel_common::threadpool::ThreadPool;

/// Fraction of the memory limit used as the pressure target.
const MEMORY_TARGET_FRACTION: f64 = 0.5;

/// Stats a maintenance op reports when polled.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MaintenanceOpStats {
    /// True if this op can run now.
    pub runnable: bool,
    /// Approximate bytes of memory that running this op would release.
    pub ram_anchored: u64,
    /// Age in milliseconds of the oldest transaction retained because
    /// this op has not run.
    pub ts_anchored_ms: u64,
    /// Estimated performance improvement from running now; dimensionless.
    pub perf_improvement: f64,
}

impl MaintenanceOpStats {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A background operation the manager can schedule.
///
/// `update_stats` runs under the manager lock every polling period and
/// must be cheap and non-blocking. `prepare` runs on the monitor thread
/// without the lock and should be short; `perform` runs on a worker and
/// may take a long time.
pub trait MaintenanceOp: Send + Sync {
    /// Unique name; also the registry key.
    fn name(&self) -> &str;

    fn update_stats(&self, stats: &mut MaintenanceOpStats);

    /// Returning false drops this launch without running `perform`.
    fn prepare(&self) -> bool;

    fn perform(&self);

    /// Duration histogram for completed runs of this op.
    fn duration_histogram(&self) -> &DurationHistogram;

    /// Gauge tracking concurrent runs of this op.
    fn running_gauge(&self) -> &AtomicGauge;
}

/// One completed run, kept in the history ring.
#[derive(Debug, Clone)]
struct CompletedOp {
    name: String,
    duration: Duration,
    start_time: Instant,
}

struct RegisteredOp {
    op: Arc<dyn MaintenanceOp>,
    last_stats: MaintenanceOpStats,
}

struct RunningOp {
    count: u32,
    started: Vec<Instant>,
}

struct ManagerState {
    /// Registered ops in name order.
    ops: BTreeMap<String, RegisteredOp>,
    running: HashMap<String, RunningOp>,
    /// Circular history: slot `completed_count % capacity`.
    completed: Vec<Option<CompletedOp>>,
    completed_count: u64,
    shutdown: bool,
}

struct ManagerShared {
    state: Mutex<ManagerState>,
    cond: Condvar,
    polling_interval: Duration,
    mem_target: u64,
    max_ts_anchored_ms: u64,
    history_size: usize,
}

/// Snapshot row for a registered op.
#[derive(Debug, Clone)]
pub struct RegisteredOpStatus {
    pub name: String,
    pub stats: MaintenanceOpStats,
}

/// Snapshot row for a currently running op.
#[derive(Debug, Clone)]
pub struct RunningOpStatus {
    pub name: String,
    pub elapsed: Duration,
}

/// Snapshot row for a completed op, most recent first.
#[derive(Debug, Clone)]
pub struct CompletedOpStatus {
    pub name: String,
    pub duration: Duration,
    /// Time since the run started.
    pub age: Duration,
}

/// Full status dump.
#[derive(Debug, Clone)]
pub struct MaintenanceManagerStatus {
    pub registered: Vec<RegisteredOpStatus>,
    pub running: Vec<RunningOpStatus>,
    /// Most recent `min(count, history_size)` completions, reverse
    /// chronological.
    pub completed: Vec<CompletedOpStatus>,
}

/// Schedules background operations on a worker pool, driven by a single
/// monitor thread.
pub struct MaintenanceManager {
    shared: Arc<ManagerShared>,
    pool: Arc<ThreadPool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceManager {
    /// Build the manager and start its monitor thread. The memory
    /// target is computed once here: a fraction of the configured limit,
    /// or of total system memory when the limit is negative.
    pub fn new(config: MaintenanceConfig) -> KestrelResult<Self> {
        if config.num_threads == 0 || config.history_size == 0 {
            return Err(KestrelError::Config(
                "maintenance manager needs threads and history capacity".into(),
            ));
        }
        let base = if config.memory_limit < 0 {
            detect_total_memory()
        } else {
            config.memory_limit as u64
        };
        let mem_target = (base as f64 * MEMORY_TARGET_FRACTION) as u64;

        let shared = Arc::new(ManagerShared {
            state: Mutex::new(ManagerState {
                ops: BTreeMap::new(),
                running: HashMap::new(),
                completed: (0..config.history_size).map(|_| None).collect(),
                completed_count: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            polling_interval: Duration::from_millis(config.polling_interval_ms),
            mem_target,
            max_ts_anchored_ms: config.max_ts_anchored_secs * 1000,
            history_size: config.history_size,
        });
        let pool = Arc::new(ThreadPool::new("kestrel-maintenance", config.num_threads));

        let monitor = {
            let shared = shared.clone();
            let pool = pool.clone();
            std::thread::Builder::new()
                .name("kestrel-maintenance-monitor".into())
                .spawn(move || monitor_loop(&shared, &pool))
                .map_err(|e| KestrelError::Internal(format!("spawn monitor: {e}")))?
        };

        tracing::info!(
            threads = config.num_threads,
            polling_interval_ms = config.polling_interval_ms,
            mem_target,
            "maintenance manager started"
        );
        Ok(Self {
            shared,
            pool,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    /// Memory-pressure target in bytes.
    pub fn mem_target(&self) -> u64 {
        self.shared.mem_target
    }

    /// Register an op under its (unique) name. Wakes the monitor so the
    /// op is considered within one polling cycle.
    pub fn register_op(&self, op: Arc<dyn MaintenanceOp>) {
        let name = op.name().to_string();
        {
            let mut state = self.shared.state.lock();
            let previous = state.ops.insert(
                name.clone(),
                RegisteredOp {
                    op,
                    last_stats: MaintenanceOpStats::default(),
                },
            );
            assert!(previous.is_none(), "maintenance op {name} registered twice");
        }
        tracing::debug!(op = %name, "maintenance op registered");
        self.shared.cond.notify_all();
    }

    /// Remove an op from the registry. A running op is not interrupted;
    /// this blocks until every outstanding run of it has completed.
    pub fn unregister_op(&self, name: &str) {
        let mut state = self.shared.state.lock();
        let removed = state.ops.remove(name);
        assert!(removed.is_some(), "maintenance op {name} not registered");
        while state.running.contains_key(name) {
            self.shared.cond.wait(&mut state);
        }
        tracing::debug!(op = %name, "maintenance op unregistered");
    }

    /// Point-in-time status: registered op stats, running ops with
    /// elapsed times, and the recent completion history.
    pub fn status_dump(&self) -> MaintenanceManagerStatus {
        let state = self.shared.state.lock();
        let registered = state
            .ops
            .iter()
            .map(|(name, reg)| RegisteredOpStatus {
                name: name.clone(),
                stats: reg.last_stats,
            })
            .collect();
        let mut running: Vec<RunningOpStatus> = state
            .running
            .iter()
            .flat_map(|(name, info)| {
                info.started.iter().map(|started| RunningOpStatus {
                    name: name.clone(),
                    elapsed: started.elapsed(),
                })
            })
            .collect();
        running.sort_by(|a, b| a.name.cmp(&b.name));

        let n = state.completed_count.min(self.shared.history_size as u64);
        let mut completed = Vec::with_capacity(n as usize);
        for k in (state.completed_count - n..state.completed_count).rev() {
            let slot = (k % self.shared.history_size as u64) as usize;
            if let Some(record) = &state.completed[slot] {
                completed.push(CompletedOpStatus {
                    name: record.name.clone(),
                    duration: record.duration,
                    age: record.start_time.elapsed(),
                });
            }
        }
        MaintenanceManagerStatus {
            registered,
            running,
            completed,
        }
    }

    /// Stop the monitor, then drain and join the worker pool.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.monitor.lock().take() {
            if handle.join().is_err() {
                tracing::error!("maintenance monitor panicked");
            }
        }
        self.pool.shutdown();
        tracing::info!("maintenance manager shut down");
    }

    #[cfg(test)]
    pub(crate) fn completed_ring_names_for_tests(&self) -> Vec<Option<String>> {
        let state = self.shared.state.lock();
        state
            .completed
            .iter()
            .map(|slot| slot.as_ref().map(|c| c.name.clone()))
            .collect()
    }
}

impl Drop for MaintenanceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn monitor_loop(shared: &Arc<ManagerShared>, pool: &Arc<ThreadPool>) {
    loop {
        let candidate = {
            let mut state = shared.state.lock();
            if state.shutdown {
                return;
            }
            shared
                .cond
                .wait_for(&mut state, shared.polling_interval);
            if state.shutdown {
                return;
            }
            poll_stats(&mut state);
            let best = find_best_op(&state, shared);
            // Reserve the running slot while the selection lock is still
            // held, so unregister_op blocks until this launch resolves
            // one way or the other.
            best.map(|name| {
                let op = state.ops[&name].op.clone();
                let start = Instant::now();
                let info = state.running.entry(name.clone()).or_insert(RunningOp {
                    count: 0,
                    started: Vec::new(),
                });
                info.count += 1;
                info.started.push(start);
                (name, op, start)
            })
        };

        let Some((name, op, start)) = candidate else {
            continue;
        };

        // Prepare runs without the lock; it must be short since it holds
        // up the scheduling of every other op.
        if !op.prepare() {
            let mut state = shared.state.lock();
            release_running(&mut state, &name, start);
            drop(state);
            shared.cond.notify_all();
            tracing::debug!(op = %name, "maintenance op declined launch");
            continue;
        }

        op.running_gauge().increment();
        tracing::debug!(op = %name, "maintenance op launched");
        let task_shared = shared.clone();
        let task_name = name.clone();
        let task_op = op.clone();
        let submit =
            pool.submit(move || perform_task(&task_shared, &task_name, task_op.as_ref(), start));
        if let Err(e) = submit {
            op.running_gauge().decrement();
            let mut state = shared.state.lock();
            release_running(&mut state, &name, start);
            drop(state);
            shared.cond.notify_all();
            tracing::warn!(error = %e, "maintenance pool rejected op; shutting down");
            return;
        }
    }
}

fn perform_task(shared: &Arc<ManagerShared>, name: &str, op: &dyn MaintenanceOp, start: Instant) {
    op.perform();
    let duration = start.elapsed();
    op.duration_histogram().observe(duration);
    op.running_gauge().decrement();
    observability::record_maintenance_op(name, duration.as_micros() as u64);

    let mut state = shared.state.lock();
    let slot = (state.completed_count % shared.history_size as u64) as usize;
    state.completed[slot] = Some(CompletedOp {
        name: name.to_string(),
        duration,
        start_time: start,
    });
    state.completed_count += 1;

    release_running(&mut state, name, start);
    drop(state);
    shared.cond.notify_all();
    tracing::debug!(op = %name, duration_us = duration.as_micros() as u64, "maintenance op completed");
}

/// Drop one reserved/running slot for `name`, removing the entry when
/// the last slot goes.
fn release_running(state: &mut ManagerState, name: &str, start: Instant) {
    let remove = {
        let info = state
            .running
            .get_mut(name)
            .expect("launched op was marked running");
        info.count -= 1;
        if let Some(pos) = info.started.iter().position(|s| *s == start) {
            info.started.swap_remove(pos);
        }
        info.count == 0
    };
    if remove {
        state.running.remove(name);
    }
}

/// Refresh every registered op's stats. Runs under the manager lock;
/// ops are required to keep `update_stats` cheap.
fn poll_stats(state: &mut ManagerState) {
    for reg in state.ops.values_mut() {
        let mut stats = MaintenanceOpStats::default();
        reg.op.update_stats(&mut stats);
        reg.last_stats = stats;
    }
}

/// Pick the best op to run now, or `None` when nothing qualifies.
fn find_best_op(state: &ManagerState, shared: &ManagerShared) -> Option<String> {
    let runnable = || {
        state
            .ops
            .iter()
            .filter(|(_, reg)| reg.last_stats.runnable)
    };
    if runnable().next().is_none() {
        return None;
    }

    // Memory pressure override: total anchored RAM over all registered
    // ops, best candidate by RAM released.
    let total_ram: u64 = state.ops.values().map(|r| r.last_stats.ram_anchored).sum();
    if total_ram > shared.mem_target {
        let (name, _) = runnable().fold(None, best_by(|s| s.ram_anchored as f64))?;
        tracing::debug!(
            total_ram,
            mem_target = shared.mem_target,
            op = %name,
            "memory pressure override"
        );
        return Some(name.clone());
    }

    // Transaction-age override.
    let oldest = runnable()
        .filter(|(_, reg)| reg.last_stats.ts_anchored_ms >= shared.max_ts_anchored_ms)
        .fold(None, best_by(|s| s.ts_anchored_ms as f64));
    if let Some((name, _)) = oldest {
        return Some(name.clone());
    }

    // Best perf improvement; zero never qualifies here.
    let best = runnable()
        .filter(|(_, reg)| reg.last_stats.perf_improvement > 0.0)
        .fold(None, best_by(|s| s.perf_improvement));
    best.map(|(name, _)| name.clone())
}

/// Fold step keeping the maximum by `score`; strict comparison, so the
/// first name in registry order wins ties.
fn best_by<'a>(
    score: impl Fn(&MaintenanceOpStats) -> f64,
) -> impl FnMut(
    Option<(&'a String, &'a RegisteredOp)>,
    (&'a String, &'a RegisteredOp),
) -> Option<(&'a String, &'a RegisteredOp)> {
    move |best, candidate| match best {
        None => Some(candidate),
        Some(current) => {
            if score(&candidate.1.last_stats) > score(&current.1.last_stats) {
                Some(candidate)
            } else {
                Some(current)
            }
        }
    }
}

fn detect_total_memory() -> u64 {
    use sysinfo::{MemoryRefreshKind, RefreshKind, System};
    let system = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
    );
    let total = system.total_memory();
    if total == 0 {
        // Unreadable platform; fall back to a conservative budget.
        tracing::warn!("could not detect system memory; assuming 4 GiB");
        4 * 1024 * 1024 * 1024
    } else {
        total
    }
}
