//! The operation interface consumed by the driver.

use kestrel_common::error::OpError;
use kestrel_common::types::OperationKind;

/// A single write, schema-change, or config-change operation.
///
/// The driver calls the lifecycle methods in a fixed order on pool
/// threads: `prepare`, `start`, then (after replication succeeds)
/// `apply`. Exactly one method runs at a time.
pub trait Operation: Send {
    /// The operation's kind; fixed for its lifetime.
    fn kind(&self) -> OperationKind;

    /// The bytes handed to consensus for replication.
    fn replicate_payload(&self) -> Vec<u8>;

    /// Acquire locks and decode; no externally visible effects yet.
    fn prepare(&mut self) -> Result<(), OpError>;

    /// Assign timestamps and begin execution.
    fn start(&mut self) -> Result<(), OpError>;

    /// Mutate in-memory state. Returns the commit-record summary. There
    /// is no rollback: a failure here is fatal to the process because
    /// the state may be partially modified.
    fn apply(&mut self) -> Result<Vec<u8>, OpError>;

    /// Human-readable description for traces and the pending-dump log.
    fn describe(&self) -> String {
        format!("{} operation", self.kind())
    }
}
