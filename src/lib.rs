//! Per-instance workflow execution core.
//!
//! `weftrun` owns the part of a workflow engine that decides what runs next
//! for a single instance, under what transactional guarantees, with what
//! locking discipline, and when it is safe to checkpoint or unload. It is
//! built from four pieces:
//!
//! - [`locks`]: a named, priority-ordered instance lock with an explicit
//!   held-lock ledger that forbids priority inversion before it can deadlock.
//! - [`schedule`]: a dual-tier FIFO scheduler (elevated work from open
//!   atomic regions always preempts normal work) with cooperative
//!   cancellation checked at every dequeue.
//! - [`queuing`]: named per-instance message queues with a private,
//!   rollback-able shadow for the one open atomic region.
//! - [`executor`]: the lifecycle state machine composing the above and
//!   exposing start/suspend/resume/terminate/abort/unload/persist.
//!
//! The engine never spawns threads: a host-supplied [`hosting::SchedulerService`]
//! donates the thread that drives the run loop, and persistence goes through
//! a host-supplied [`providers::PersistenceService`].

use serde::{Deserialize, Serialize};

pub mod activity;
pub mod error;
pub mod executor;
pub mod hosting;
pub mod locks;
pub mod providers;
pub mod queuing;
pub mod schedule;
pub mod transaction;

pub use error::{EngineError, QueueError};
pub use executor::events::{WorkflowEvent, WorkflowEventArgs, WorkflowObserver};
pub use executor::{WorkflowExecutor, WorkflowServices};
pub use hosting::{Pending, WaitHandle};
pub use schedule::SchedulableItem;

/// Lifecycle status of a workflow instance.
///
/// `Completed` and `Terminated` are absorbing with respect to status; the
/// separate validity flag on the executor is the stronger "no further
/// processing" signal (an instance can be `Running` yet invalid mid-teardown,
/// or unloaded and later reloaded with the same status).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Created,
    Running,
    Suspended,
    Completed,
    Terminated,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Created => "Created",
            WorkflowStatus::Running => "Running",
            WorkflowStatus::Suspended => "Suspended",
            WorkflowStatus::Completed => "Completed",
            WorkflowStatus::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}
