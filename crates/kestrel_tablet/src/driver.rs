//! The per-operation driver.
//!
//! A driver coordinates one operation's execution across three
//! independent event sources: the prepare pipeline, consensus
//! replication, and the apply pipeline. The flow is:
//!
//! 1. The driver is constructed around an [`Operation`] with a role. A
//!    replica driver is born `Replicating` (the leader is already
//!    driving replication); a leader driver must trigger replication
//!    itself after prepare succeeds.
//! 2. `execute()` submits the prepare-and-start task and returns.
//! 3. The prepare task runs `prepare()` + `start()`, marks the prepare
//!    axis, and on a leader submits the operation to consensus.
//! 4. Consensus reports completion through [`ReplicationObserver`]. On a
//!    replica this can arrive before prepare finishes, so both sides
//!    re-examine the join condition; the state machine guarantees the
//!    apply task is scheduled exactly once.
//! 5. The apply task mutates in-memory state, then appends a commit
//!    record; once the record is durable, `finalize` updates metrics,
//!    releases the tracker entry, and completes the caller's callback.
//!
//! Failures before replication surface through the callback. Failures
//! after replication has succeeded are fatal: replicated state must
//! eventually be applied.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use kestrel_common::error::{fatal, OpError};
use kestrel_common::metrics::DurationHistogram;
use kestrel_common::observability;
use kestrel_common::threadpool::ThreadPool;
use kestrel_common::trace::TraceBuffer;
use kestrel_common::types::{DriverRole, OpId, OpIdCell, OperationKind};

use crate::consensus::{CommitMsg, Consensus, ReplicationObserver};
use crate::operation::Operation;
use crate::tracker::OperationTracker;

static NEXT_DRIVER_ID: AtomicU64 = AtomicU64::new(1);

/// Completion callback invoked exactly once with the terminal status.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), OpError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrepareState {
    NotPrepared,
    Prepared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplicationState {
    /// Not yet sent to consensus (leader before prepare completes).
    NotReplicating,
    /// Replication in flight: triggered by this driver (leader) or by
    /// the leader that this replica is following.
    Replicating,
    /// Replication failed before any other node could have received the
    /// operation.
    ReplicationFailed,
    /// Replication succeeded.
    Replicated,
}

/// The joined dual-axis state. Transitions are monotonic along each axis
/// and the apply decision latches, so apply is scheduled exactly once no
/// matter which signal wins the race.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DualAxisState {
    pub(crate) prepare: PrepareState,
    pub(crate) replication: ReplicationState,
    apply_scheduled: bool,
}

impl DualAxisState {
    pub(crate) fn new(role: DriverRole) -> Self {
        Self {
            prepare: PrepareState::NotPrepared,
            replication: match role {
                DriverRole::Leader => ReplicationState::NotReplicating,
                DriverRole::Replica => ReplicationState::Replicating,
            },
            apply_scheduled: false,
        }
    }

    /// Mark the prepare axis done. Returns true iff the caller must
    /// schedule the apply task.
    pub(crate) fn mark_prepared(&mut self) -> bool {
        assert_eq!(self.prepare, PrepareState::NotPrepared, "prepared twice");
        self.prepare = PrepareState::Prepared;
        self.take_apply_decision()
    }

    /// Leader-side transition when the operation is handed to consensus.
    pub(crate) fn begin_replicating(&mut self) {
        assert_eq!(self.replication, ReplicationState::NotReplicating);
        self.replication = ReplicationState::Replicating;
    }

    /// Fold a successful replication outcome. Returns true iff the
    /// caller must schedule the apply task.
    pub(crate) fn replication_succeeded(&mut self) -> bool {
        assert_eq!(self.replication, ReplicationState::Replicating);
        self.replication = ReplicationState::Replicated;
        self.take_apply_decision()
    }

    /// Fold a failed replication outcome (callback error or synchronous
    /// submission failure).
    pub(crate) fn replication_failed(&mut self) {
        assert!(matches!(
            self.replication,
            ReplicationState::NotReplicating | ReplicationState::Replicating
        ));
        self.replication = ReplicationState::ReplicationFailed;
    }

    fn take_apply_decision(&mut self) -> bool {
        if self.prepare == PrepareState::Prepared
            && self.replication == ReplicationState::Replicated
            && !self.apply_scheduled
        {
            self.apply_scheduled = true;
            true
        } else {
            false
        }
    }
}

struct DriverInner {
    state: DualAxisState,
    /// First non-OK status; later failures go to the trace only.
    status: Option<OpError>,
    /// True once the prepare task has finished (successfully or not).
    /// A failure observed before this point is surfaced by the prepare
    /// task's post-step rather than by the observer that recorded it.
    prepare_settled: bool,
}

/// Metrics shared by the drivers of one tablet.
#[derive(Debug, Default)]
pub struct DriverMetrics {
    /// Ingress-to-durable latency of successful operations.
    pub duration_histogram: DurationHistogram,
}

impl DriverMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Decision computed under the driver lock, acted on outside it.
enum AfterPrepare {
    Replicate,
    ScheduleApply,
    Wait,
    Fail(OpError),
}

/// Coordinates the execution of a single operation. Thread safe; shared
/// between the tracker, the pool tasks, and the consensus callback.
pub struct OperationDriver {
    id: u64,
    kind: OperationKind,
    description: String,
    role: DriverRole,
    tracker: Arc<OperationTracker>,
    consensus: Arc<dyn Consensus>,
    prepare_pool: Arc<ThreadPool>,
    apply_pool: Arc<ThreadPool>,
    operation: Mutex<Box<dyn Operation>>,
    inner: Mutex<DriverInner>,
    /// The op id has its own lock: `op_id()` is called by threads outside
    /// the driver's control and must not wait behind a long apply.
    op_id: OpIdCell,
    start_time: Instant,
    trace: TraceBuffer,
    responder: Mutex<Option<CompletionCallback>>,
    metrics: Arc<DriverMetrics>,
}

impl OperationDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        operation: Box<dyn Operation>,
        role: DriverRole,
        tracker: Arc<OperationTracker>,
        consensus: Arc<dyn Consensus>,
        prepare_pool: Arc<ThreadPool>,
        apply_pool: Arc<ThreadPool>,
        metrics: Arc<DriverMetrics>,
        responder: CompletionCallback,
    ) -> Arc<Self> {
        let kind = operation.kind();
        let description = operation.describe();
        Arc::new(Self {
            id: NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            description,
            role,
            tracker,
            consensus,
            prepare_pool,
            apply_pool,
            operation: Mutex::new(operation),
            inner: Mutex::new(DriverInner {
                state: DualAxisState::new(role),
                status: None,
                prepare_settled: false,
            }),
            op_id: OpIdCell::new(),
            start_time: Instant::now(),
            trace: TraceBuffer::new(),
            responder: Mutex::new(Some(responder)),
            metrics,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn role(&self) -> DriverRole {
        self.role
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn trace(&self) -> &TraceBuffer {
        &self.trace
    }

    /// The op id assigned by consensus, if any. Returns a copy; not for
    /// tight loops.
    pub fn op_id(&self) -> Option<OpId> {
        self.op_id.get()
    }

    /// Submit the operation for execution. Returns promptly; the
    /// operation completes asynchronously via the completion callback.
    /// A submission error is returned directly (the tracker entry is
    /// released and the callback will not fire); the caller must have
    /// registered the driver with the tracker first.
    pub fn execute(self: &Arc<Self>) -> Result<(), OpError> {
        self.trace.record("submitted to prepare pool");
        let this = self.clone();
        if let Err(e) = self.prepare_pool.submit(move || this.prepare_and_start_task()) {
            let err = OpError::Unavailable(format!("prepare pool rejected operation: {e}"));
            self.tracker.release(self);
            self.responder.lock().take();
            return Err(err);
        }
        Ok(())
    }

    /// Request cancellation. Records the first non-OK status; the
    /// operation actually terminates at its next synchronization point.
    /// Has no effect once replication has succeeded, and never
    /// interrupts a running apply.
    pub fn abort(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.status.is_none() {
            inner.status = Some(OpError::Aborted(reason.to_string()));
            self.trace.record(format!("abort requested: {reason}"));
        } else {
            self.trace.record(format!("abort requested (status already set): {reason}"));
        }
    }

    fn prepare_and_start_task(self: &Arc<Self>) {
        if let Err(e) = self.prepare_and_start() {
            self.inner.lock().prepare_settled = true;
            self.handle_failure(e);
        }
    }

    fn prepare_and_start(self: &Arc<Self>) -> Result<(), OpError> {
        self.trace.record("prepare started");
        {
            let mut operation = self.operation.lock();
            operation.prepare()?;
            operation.start()?;
        }
        self.trace.record("prepared and started");

        let decision = {
            let mut inner = self.inner.lock();
            inner.prepare_settled = true;
            let should_apply = inner.state.mark_prepared();
            if let Some(status) = inner.status.clone() {
                match inner.state.replication {
                    ReplicationState::NotReplicating | ReplicationState::ReplicationFailed => {
                        AfterPrepare::Fail(status)
                    }
                    // Too late to stop: the operation is already being
                    // replicated and must run to completion if consensus
                    // commits it.
                    ReplicationState::Replicating | ReplicationState::Replicated => {
                        if should_apply {
                            AfterPrepare::ScheduleApply
                        } else {
                            AfterPrepare::Wait
                        }
                    }
                }
            } else if should_apply {
                AfterPrepare::ScheduleApply
            } else {
                match inner.state.replication {
                    ReplicationState::NotReplicating => {
                        inner.state.begin_replicating();
                        AfterPrepare::Replicate
                    }
                    ReplicationState::Replicating => AfterPrepare::Wait,
                    ReplicationState::ReplicationFailed => {
                        unreachable!("replication failure always records a status")
                    }
                    ReplicationState::Replicated => {
                        unreachable!("join decision missed a replicated+prepared driver")
                    }
                }
            }
        };

        match decision {
            AfterPrepare::Replicate => {
                let payload = self.operation.lock().replicate_payload();
                self.trace.record("submitted to consensus");
                let observer: Arc<dyn ReplicationObserver> =
                    Arc::new(DriverObserver(self.clone()));
                if let Err(e) = self.consensus.replicate(payload, observer) {
                    self.inner.lock().state.replication_failed();
                    return Err(OpError::Replication(e.to_string()));
                }
            }
            AfterPrepare::ScheduleApply => self.schedule_apply(),
            AfterPrepare::Wait => {}
            AfterPrepare::Fail(status) => {
                self.finish(Err(status));
            }
        }
        Ok(())
    }

    /// Handle a failure in any stage. The first status wins and is kept
    /// in the driver; whether the callback fires here depends on how far
    /// replication got.
    fn handle_failure(self: &Arc<Self>, err: OpError) {
        let terminal = {
            let mut inner = self.inner.lock();
            if inner.status.is_none() {
                inner.status = Some(err.clone());
            } else {
                self.trace.record(format!("subsequent failure: {err}"));
            }
            match inner.state.replication {
                ReplicationState::NotReplicating | ReplicationState::ReplicationFailed => {
                    if inner.prepare_settled {
                        Some(inner.status.clone().expect("status recorded above"))
                    } else {
                        // The prepare task is still running; its post-step
                        // observes the status and surfaces it.
                        self.trace.record("failure deferred to prepare completion");
                        None
                    }
                }
                ReplicationState::Replicating | ReplicationState::Replicated => {
                    if matches!(err, OpError::Aborted(_)) {
                        self.trace.record("abort after replication started; ignored");
                        None
                    } else {
                        fatal("operation_driver", &err);
                    }
                }
            }
        };
        if let Some(status) = terminal {
            self.finish(Err(status));
        }
    }

    fn schedule_apply(self: &Arc<Self>) {
        self.trace.record("submitted to apply pool");
        let this = self.clone();
        if let Err(e) = self.apply_pool.submit(move || this.apply_task()) {
            // A replicated operation must apply; losing the pool is not
            // survivable.
            fatal(
                "operation_driver",
                &OpError::Apply(format!("apply pool rejected replicated operation: {e}")),
            );
        }
    }

    fn apply_task(self: &Arc<Self>) {
        let result = self.operation.lock().apply();
        let commit_payload = match result {
            Ok(payload) => payload,
            Err(e) => fatal(
                "operation_driver",
                &OpError::Apply(format!("apply of replicated operation failed: {e}")),
            ),
        };
        self.trace.record("applied; appending commit record");

        let op_id = self
            .op_id
            .get()
            .expect("replicated operation has an assigned op id");
        let msg = CommitMsg {
            op_id,
            kind: self.kind,
            result: commit_payload,
        };
        let this = self.clone();
        let submit = self
            .consensus
            .append_commit(msg, Box::new(move |result| this.commit_record_durable(result)));
        if let Err(e) = submit {
            fatal(
                "operation_driver",
                &OpError::CommitDurability(format!("commit record submission failed: {e}")),
            );
        }
    }

    fn commit_record_durable(self: &Arc<Self>, result: Result<(), OpError>) {
        if let Err(e) = result {
            fatal(
                "operation_driver",
                &OpError::CommitDurability(format!("commit record not durable: {e}")),
            );
        }
        self.finalize();
    }

    /// The commit record is durable: update metrics, clear the trace,
    /// release the tracker entry, and reply OK.
    fn finalize(self: &Arc<Self>) {
        let elapsed = self.start_time.elapsed();
        self.metrics.duration_histogram.observe(elapsed);
        observability::record_operation_finished(self.kind.as_str(), elapsed.as_micros() as u64, true);
        self.trace.clear();
        self.finish(Ok(()));
    }

    /// Deliver the terminal status exactly once and drop the tracker's
    /// reference. The driver handle does not outlive this call except
    /// through snapshots already taken.
    fn finish(self: &Arc<Self>, result: Result<(), OpError>) {
        let Some(responder) = self.responder.lock().take() else {
            debug_assert!(false, "driver finished twice");
            return;
        };
        if let Err(err) = &result {
            let elapsed = self.start_time.elapsed();
            observability::record_operation_finished(
                self.kind.as_str(),
                elapsed.as_micros() as u64,
                false,
            );
            tracing::debug!(driver = %self, error = %err, "operation failed");
        }
        self.tracker.release(self);
        responder(result);
    }
}

impl OperationDriver {
    /// Consensus assigned the operation its id.
    ///
    /// On a leader this arrives through the observer registered by
    /// `replicate`; on a replica the tablet's consensus wiring calls it
    /// directly for the round it is following.
    pub fn notify_op_id_assigned(&self, op_id: OpId) {
        self.op_id.set(op_id);
        self.trace.record(format!("op id assigned: {op_id}"));
    }

    /// Replication completed from the consensus perspective. An `Ok`
    /// outcome schedules apply if prepare already finished; the prepare
    /// task handles the other side of the race. Errors surface via the
    /// completion callback (or defer to the prepare post-step if prepare
    /// is still running).
    pub fn notify_replication_finished(self: &Arc<Self>, result: Result<(), OpError>) {
        match result {
            Ok(()) => {
                let should_apply = {
                    let mut inner = self.inner.lock();
                    inner.state.replication_succeeded()
                };
                self.trace.record("replication finished");
                if should_apply {
                    self.schedule_apply();
                }
            }
            Err(e) => {
                self.inner.lock().state.replication_failed();
                self.handle_failure(e);
            }
        }
    }
}

/// Adapter giving consensus a shared handle to the driver.
struct DriverObserver(Arc<OperationDriver>);

impl ReplicationObserver for DriverObserver {
    fn op_id_assigned(&self, op_id: OpId) {
        self.0.notify_op_id_assigned(op_id);
    }

    fn replication_finished(&self, result: Result<(), OpError>) {
        self.0.notify_replication_finished(result);
    }
}

impl fmt::Display for OperationDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prepare, replication) = {
            let inner = self.inner.lock();
            (inner.state.prepare, inner.state.replication)
        };
        let op_id = self
            .op_id
            .get()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unassigned".to_string());
        write!(
            f,
            "OperationDriver[{} op_id={op_id} {prepare:?}/{replication:?}]",
            self.description,
        )
    }
}
