//! Core identifiers shared across the tablet and log layers.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Identifier assigned to a replicated operation by consensus.
///
/// Totally ordered by `(term, index)`. An operation has no id until
/// consensus assigns one; see [`OpIdCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    /// The smallest possible id; precedes every assigned id.
    pub fn min_value() -> Self {
        Self { term: 0, index: 0 }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// One-shot cell holding a driver's op id.
///
/// The cell has its own lock so external readers can query the id
/// without contending with the driver's state lock, which may be held
/// across long operations. Transitions `Unset -> Set(opid)` exactly once.
#[derive(Debug, Default)]
pub struct OpIdCell {
    inner: Mutex<Option<OpId>>,
}

impl OpIdCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Assign the id. Panics if an id was already assigned with a
    /// different value; assignment is idempotent for the same value.
    pub fn set(&self, op_id: OpId) {
        let mut slot = self.inner.lock();
        match *slot {
            None => *slot = Some(op_id),
            Some(existing) => {
                assert_eq!(
                    existing, op_id,
                    "op id reassigned: {existing} -> {op_id}"
                );
            }
        }
    }

    /// Returns a copy of the assigned id, or `None` if consensus has not
    /// assigned one yet. Returns a copy; not for tight loops.
    pub fn get(&self) -> Option<OpId> {
        *self.inner.lock()
    }
}

/// The kind of a replicated operation. Fixed for the operation's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Write,
    AlterSchema,
    ChangeConfig,
}

impl OperationKind {
    /// Stable label used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Write => "write",
            OperationKind::AlterSchema => "alter_schema",
            OperationKind::ChangeConfig => "change_config",
        }
    }

    pub const ALL: [OperationKind; 3] = [
        OperationKind::Write,
        OperationKind::AlterSchema,
        OperationKind::ChangeConfig,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether this node initiated replication for an operation (leader) or
/// is following a replication already driven elsewhere (replica).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverRole {
    Leader,
    Replica,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_ordering() {
        assert!(OpId::new(0, 10) < OpId::new(0, 20));
        assert!(OpId::new(0, 100) < OpId::new(1, 1));
        assert!(OpId::new(2, 1) > OpId::new(1, 999));
        assert_eq!(OpId::new(3, 7), OpId::new(3, 7));
    }

    #[test]
    fn test_op_id_display() {
        assert_eq!(OpId::new(0, 40).to_string(), "0.40");
    }

    #[test]
    fn test_op_id_cell_set_once() {
        let cell = OpIdCell::new();
        assert_eq!(cell.get(), None);
        cell.set(OpId::new(1, 5));
        assert_eq!(cell.get(), Some(OpId::new(1, 5)));
        // Same value is idempotent.
        cell.set(OpId::new(1, 5));
        assert_eq!(cell.get(), Some(OpId::new(1, 5)));
    }

    #[test]
    #[should_panic(expected = "op id reassigned")]
    fn test_op_id_cell_rejects_reassignment() {
        let cell = OpIdCell::new();
        cell.set(OpId::new(1, 5));
        cell.set(OpId::new(1, 6));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(OperationKind::Write.as_str(), "write");
        assert_eq!(OperationKind::AlterSchema.as_str(), "alter_schema");
        assert_eq!(OperationKind::ChangeConfig.as_str(), "change_config");
    }
}
