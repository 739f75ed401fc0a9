//! Lifecycle event dispatch.
//!
//! Events decided while the scheduler lock is held are buffered on the
//! executor and flushed by the caller immediately after the critical section,
//! so observer callbacks never run under an instance lock.

use uuid::Uuid;

/// Lifecycle notifications raised by the executor, in rough lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    Creating,
    Created,
    Loading,
    Loaded,
    Starting,
    Started,
    Runnable,
    Executing,
    NotExecuting,
    Suspending,
    Suspended,
    Resuming,
    Resumed,
    Terminating,
    Terminated,
    Aborting,
    Aborted,
    Completing,
    Completed,
    Persisting,
    Persisted,
    Idle,
    Unloading,
    Unloaded,
}

impl std::fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Payload delivered to observers for one event.
#[derive(Debug, Clone)]
pub struct WorkflowEventArgs {
    pub instance_id: Uuid,
    pub event: WorkflowEvent,
    /// Event-specific detail: reason for suspend/terminate, activity id for
    /// Executing/NotExecuting, error text on failure paths.
    pub info: Option<String>,
}

/// Host-registered lifecycle observer. Callbacks run outside instance locks
/// and must not block the calling thread for long.
pub trait WorkflowObserver: Send + Sync {
    fn on_event(&self, args: &WorkflowEventArgs);
}
