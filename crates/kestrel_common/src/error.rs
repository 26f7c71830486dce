use thiserror::Error;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for surfacing/escalation decisions.
///
/// - `Transient` — prepare/replication failures; the caller may retry the
///   operation from scratch
/// - `Aborted`   — externally requested cancellation, observed at the next
///   synchronization point
/// - `NotFound`  — a requested op-id range has no corresponding segment
/// - `Fatal`     — the process cannot continue (replicated state that can
///   no longer be applied, or a commit record that cannot be made durable)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Aborted,
    NotFound,
    Fatal,
}

/// Failures visible to the submitter of an operation.
///
/// These carry string payloads only so the first failure can be recorded
/// once and cloned into the completion callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("Prepare failed: {0}")]
    Prepare(String),

    #[error("Start failed: {0}")]
    Start(String),

    #[error("Replication failed: {0}")]
    Replication(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Apply failed: {0}")]
    Apply(String),

    #[error("Commit record not durable: {0}")]
    CommitDurability(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl OpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::Prepare(_) | OpError::Start(_) => ErrorKind::Transient,
            OpError::Replication(_) => ErrorKind::Transient,
            OpError::Unavailable(_) => ErrorKind::Transient,
            OpError::Aborted(_) => ErrorKind::Aborted,
            OpError::Apply(_) | OpError::CommitDurability(_) => ErrorKind::Fatal,
        }
    }

    /// True if this failure may not surface through the completion
    /// callback: the process is expected to terminate instead.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }
}

/// Log reader / segment errors.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corruption in segment {segment}: {reason}")]
    Corruption { segment: u64, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid segment sequence: {0}")]
    InvalidSequence(String),
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Operation error: {0}")]
    Op(#[from] OpError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KestrelError {
    /// Classify this error for surfacing decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Op(e) => e.kind(),
            KestrelError::Log(LogError::NotFound(_)) => ErrorKind::NotFound,
            KestrelError::Log(_) => ErrorKind::Transient,
            KestrelError::Config(_) => ErrorKind::Transient,
            KestrelError::Internal(_) => ErrorKind::Fatal,
        }
    }
}

/// Log a fatal condition and terminate the process.
///
/// Used for failures after which in-memory state may be partially
/// modified with no rollback path: a replicated operation whose apply
/// failed, or a commit record that cannot be made durable.
pub fn fatal(component: &str, err: &OpError) -> ! {
    tracing::error!(
        component,
        error = %err,
        "FATAL: unrecoverable failure, terminating"
    );
    std::process::abort();
}
