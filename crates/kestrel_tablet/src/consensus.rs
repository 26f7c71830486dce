//! Interfaces to the consensus layer.
//!
//! The driver treats consensus as opaque: `replicate` is a synchronous
//! submission whose outcome arrives later on a registered observer, and
//! `append_commit` appends a commit record whose durability is signalled
//! through a one-shot callback. The consensus implementation lives
//! elsewhere; a tablet is wired up with whichever impl its deployment
//! uses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use kestrel_common::error::OpError;
use kestrel_common::types::{OpId, OperationKind};

/// Commit record appended to the log after an operation has applied.
/// Must be durably persisted before the client is replied to, and before
/// any in-memory state touched by the apply may be flushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMsg {
    pub op_id: OpId,
    pub kind: OperationKind,
    /// Opaque summary of the apply result, for recovery.
    pub result: Vec<u8>,
}

/// One-shot durability completion for [`Consensus::append_commit`].
pub type CommitDurableCallback = Box<dyn FnOnce(Result<(), OpError>) + Send>;

/// Continuation registered with a replication submission.
pub trait ReplicationObserver: Send + Sync {
    /// Consensus assigned the operation its id. Fires before
    /// `replication_finished`.
    fn op_id_assigned(&self, op_id: OpId);

    /// Replication completed. `Ok` means the operation is committed from
    /// the consensus perspective: it will be applied on every node and
    /// never truncated from the state machine history.
    fn replication_finished(&self, result: Result<(), OpError>);
}

/// The consensus operations the driver consumes.
pub trait Consensus: Send + Sync {
    /// Submit an operation for replication. The returned status covers
    /// submission only; completion arrives on `observer`, possibly
    /// before this call returns.
    fn replicate(
        &self,
        payload: Vec<u8>,
        observer: Arc<dyn ReplicationObserver>,
    ) -> Result<(), OpError>;

    /// Append a commit record. `on_durable` fires once the record is
    /// durably persisted (or with the failure that prevented it).
    fn append_commit(
        &self,
        msg: CommitMsg,
        on_durable: CommitDurableCallback,
    ) -> Result<(), OpError>;
}
