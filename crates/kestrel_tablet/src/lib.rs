//! Transaction execution core of a KestrelDB tablet server.
//!
//! An ingress handler constructs an [`driver::OperationDriver`] around an
//! [`operation::Operation`], registers it with the
//! [`tracker::OperationTracker`], and submits it. The driver coordinates
//! the prepare pipeline, consensus replication, and the apply pipeline
//! into a single linear ordering per operation; the
//! [`maintenance::MaintenanceManager`] independently schedules background
//! work against shared memory and anchored-age pressure signals.

pub mod consensus;
pub mod driver;
pub mod maintenance;
pub mod operation;
pub mod tracker;

pub use consensus::{CommitMsg, Consensus, ReplicationObserver};
pub use driver::{DriverMetrics, OperationDriver};
pub use maintenance::{
    CompletedOpStatus, MaintenanceManager, MaintenanceManagerStatus, MaintenanceOp,
    MaintenanceOpStats,
};
pub use operation::Operation;
pub use tracker::{DrainStats, OperationTracker};
