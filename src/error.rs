//! Engine error taxonomy.
//!
//! Propagation policy: workflow-logic faults are funneled into the executor's
//! fault-handling path and may be fully absorbed (the instance ends up
//! faulted but alive); infrastructure faults (persistence, transaction
//! commit) always roll back in-memory status and propagate to the operation's
//! caller. An ambiguous persistence outcome is never treated as success.

use thiserror::Error;

use crate::providers::PersistenceError;

/// Errors surfaced by queue operations on the queuing service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue '{0}' not found")]
    NotFound(String),
    #[error("queue '{0}' already exists")]
    AlreadyExists(String),
    /// The queue is shadowed by an open atomic region; direct root access is
    /// forbidden until the region commits or rolls back.
    #[error("queue '{0}' is busy (shadowed by an open atomic region)")]
    Busy(String),
    #[error("queue '{0}' is disabled")]
    Disabled(String),
}

/// Top-level error type for executor, scheduler and transaction operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Exhaustion of memory/stack or external forced thread termination.
    /// Never caught by fault handling; always propagates.
    #[error("irrecoverable system error: {0}")]
    Irrecoverable(String),

    /// The ambient transaction was observed aborted and not yet processed.
    #[error("atomic region transaction aborted: {0}")]
    TransactionAborted(String),

    /// Transaction coordinator failure outside the aborted-observation path.
    #[error("transaction coordinator error: {0}")]
    Transaction(String),

    /// Persistence provider failure. The executor restores the pre-attempt
    /// status before rethrowing this.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// Instance invalid, operation issued from the wrong execution context,
    /// or operation attempted while an atomic region is open.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Workflow-logic fault raised by a scheduled work item; routed to the
    /// executor's fault-handling path rather than the caller.
    #[error("workflow fault: {0}")]
    Fault(String),
}

impl EngineError {
    pub fn invalid_instance() -> Self {
        EngineError::InvalidOperation("workflow instance is not valid".into())
    }

    /// Whether this error must bypass fault handling entirely.
    pub fn is_irrecoverable(&self) -> bool {
        matches!(self, EngineError::Irrecoverable(_))
    }
}
