//! Shared plumbing for KestrelDB.
//!
//! - `error`: layered error taxonomy and classification
//! - `types`: operation identifiers and kinds
//! - `config`: TOML-backed configuration sections
//! - `metrics`: duration histograms and atomic gauges
//! - `threadpool`: bounded FIFO worker pool
//! - `trace`: per-operation trace buffer
//! - `cache`: single-writer multi-reader LRU artifact cache
//! - `observability`: tracing/metrics bootstrap

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod threadpool;
pub mod trace;
pub mod types;

pub use error::{ErrorKind, KestrelError, KestrelResult, LogError, OpError};
pub use types::{DriverRole, OpId, OperationKind};
