//! Execution state machine for one workflow instance.
//!
//! [`WorkflowExecutor`] composes the three instance locks, the dual-tier
//! scheduler, the queuing service, the optional open atomic region and the
//! host collaborators. Control operations (suspend, terminate, abort,
//! unload) come in two layers: the public entry point acquires the locks it
//! needs, while the `-on-idle` variant assumes the scheduler lock is already
//! held and takes the [`LockContext`] that proves it.
//!
//! The run loop never runs observer callbacks or queue listeners while an
//! instance lock is held: lifecycle events decided inside a critical section
//! are buffered and flushed after the guards drop.

pub mod events;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activity::{ActivityId, ActivityTree, CompletedContext, ExecutionResult, ExecutionStatus};
use crate::error::{EngineError, QueueError};
use crate::hosting::{Pending, SchedulerService, TimerDeliveryGate};
use crate::locks::{InstanceLock, LockContext};
use crate::providers::{InstanceSnapshot, PersistenceService};
use crate::queuing::{LocalQueuingService, Message, QueuingService};
use crate::schedule::{SchedulableItem, Scheduler};
use crate::transaction::{
    IsolationLevel, TransactionContext, TransactionCoordinator, TransactionState, WorkBatch,
};
use crate::WorkflowStatus;

use events::{WorkflowEvent, WorkflowEventArgs, WorkflowObserver};

/// Host collaborators handed to the executor at construction.
#[derive(Clone)]
pub struct WorkflowServices {
    pub scheduler: Arc<dyn SchedulerService>,
    pub persistence: Arc<dyn PersistenceService>,
    pub transactions: Arc<dyn TransactionCoordinator>,
}

/// Mutable instance state behind one short-held mutex. Instance locks gate
/// the operations; this mutex only protects the fields themselves.
struct ExecState {
    status: WorkflowStatus,
    /// Cleared on terminate/abort/complete/unload; an invalid executor
    /// refuses all further processing regardless of status.
    is_valid: bool,
    state_changed_since_persistence: bool,
    suspend_or_terminate_info: Option<String>,
    suspend_requested: bool,
    /// Persisted idle, waiting on queue arrivals.
    is_blocked: bool,
    tree: Option<ActivityTree>,
    /// The at-most-one open atomic region.
    atomic: Option<TransactionContext>,
    /// Contexts fully closed since the last checkpoint, saved out for
    /// compensation at the next persist.
    completed_contexts: Vec<CompletedContext>,
    batch: WorkBatch,
    /// Events decided under a lock, flushed after the critical section.
    pending_events: Vec<WorkflowEventArgs>,
}

/// The per-instance execution core.
pub struct WorkflowExecutor {
    instance_id: Uuid,
    executor_lock: InstanceLock,
    scheduler_lock: InstanceLock,
    msg_delivery_lock: InstanceLock,
    scheduler: Scheduler,
    queuing: Arc<QueuingService>,
    services: WorkflowServices,
    observers: Mutex<Vec<Arc<dyn WorkflowObserver>>>,
    timer_gate: TimerDeliveryGate,
    state: Mutex<ExecState>,
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl WorkflowExecutor {
    /// Create a fresh instance around `tree`. Fires Creating/Created.
    pub fn initialize(
        instance_id: Uuid,
        tree: ActivityTree,
        services: WorkflowServices,
        observers: Vec<Arc<dyn WorkflowObserver>>,
    ) -> Arc<Self> {
        let exec = Self::build(
            instance_id,
            services,
            observers,
            ExecState {
                status: WorkflowStatus::Created,
                is_valid: true,
                state_changed_since_persistence: true,
                suspend_or_terminate_info: None,
                suspend_requested: false,
                is_blocked: false,
                tree: Some(tree),
                atomic: None,
                completed_contexts: Vec::new(),
                batch: WorkBatch::new(),
                pending_events: Vec::new(),
            },
            false,
        );
        info!(instance = %instance_id, "initialized workflow instance");
        exec.buffer_event(WorkflowEvent::Creating, None);
        exec.buffer_event(WorkflowEvent::Created, None);
        exec.flush_events();
        exec
    }

    /// Rehydrate a previously persisted instance. Status is preserved; fires
    /// Loading/Loaded.
    pub fn reload(
        instance_id: Uuid,
        services: WorkflowServices,
        observers: Vec<Arc<dyn WorkflowObserver>>,
    ) -> Result<Arc<Self>, EngineError> {
        let snapshot = services.persistence.load_instance_state(instance_id)?;
        let can_run = snapshot.status == WorkflowStatus::Running;
        let exec = Self::build(
            instance_id,
            services,
            observers,
            ExecState {
                status: snapshot.status,
                is_valid: true,
                state_changed_since_persistence: false,
                suspend_or_terminate_info: snapshot.suspend_or_terminate_info,
                suspend_requested: false,
                is_blocked: snapshot.is_blocked,
                tree: snapshot.tree,
                atomic: None,
                completed_contexts: Vec::new(),
                batch: WorkBatch::new(),
                pending_events: Vec::new(),
            },
            can_run,
        );
        exec.queuing.restore(&snapshot.queue_state);
        if snapshot.status == WorkflowStatus::Suspended {
            exec.timer_gate.suspend_delivery();
        }
        info!(instance = %instance_id, status = %exec.status(), "reloaded workflow instance");
        exec.buffer_event(WorkflowEvent::Loading, None);
        exec.buffer_event(WorkflowEvent::Loaded, None);
        exec.flush_events();
        Ok(exec)
    }

    fn build(
        instance_id: Uuid,
        services: WorkflowServices,
        observers: Vec<Arc<dyn WorkflowObserver>>,
        state: ExecState,
        can_run: bool,
    ) -> Arc<Self> {
        let exec = Arc::new(Self {
            instance_id,
            executor_lock: InstanceLock::executor_lock(instance_id),
            scheduler_lock: InstanceLock::scheduler_lock(instance_id),
            msg_delivery_lock: InstanceLock::message_delivery_lock(instance_id),
            scheduler: Scheduler::new(instance_id, can_run),
            queuing: Arc::new(QueuingService::new(instance_id)),
            services,
            observers: Mutex::new(observers),
            timer_gate: TimerDeliveryGate::default(),
            state: Mutex::new(state),
        });
        // Worker threads come from the host's scheduling collaborator; the
        // scheduler only knows how to ask.
        let weak = Arc::downgrade(&exec);
        let host = Arc::clone(&exec.services.scheduler);
        exec.scheduler.set_thread_request(Box::new(move || {
            if let Some(strong) = weak.upgrade() {
                let runner = Arc::clone(&strong);
                host.request_thread(strong.instance_id, Box::new(move || runner.run_scheduler()));
            }
        }));
        exec
    }

    // ---- introspection -----------------------------------------------------

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn status(&self) -> WorkflowStatus {
        self.state.lock().status
    }

    pub fn is_valid(&self) -> bool {
        self.state.lock().is_valid
    }

    pub fn suspend_or_terminate_info(&self) -> Option<String> {
        self.state.lock().suspend_or_terminate_info.clone()
    }

    pub fn queuing(&self) -> &Arc<QueuingService> {
        &self.queuing
    }

    pub fn timer_gate(&self) -> &TimerDeliveryGate {
        &self.timer_gate
    }

    pub fn tree_snapshot(&self) -> Option<ActivityTree> {
        self.state.lock().tree.clone()
    }

    pub fn add_observer(&self, observer: Arc<dyn WorkflowObserver>) {
        self.observers.lock().push(observer);
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Start a freshly created instance: Created→Running, Starting then
    /// Started exactly once each, root work node scheduled. On failure the
    /// instance is terminated with the error text and the error propagates.
    pub fn start(&self) -> Result<(), EngineError> {
        let result = self.start_inner();
        self.flush_events();
        if let Err(e) = &result {
            // Only a failure after the Created→Running transition leaves a
            // half-started instance behind; validation failures do not.
            if self.status() == WorkflowStatus::Running {
                let _ = self.terminate(&e.to_string());
            }
        }
        result
    }

    fn start_inner(&self) -> Result<(), EngineError> {
        let cx = LockContext::new();
        let _eg = self.executor_lock.enter(&cx)?;
        let root = {
            let mut st = self.state.lock();
            if !st.is_valid {
                return Err(EngineError::invalid_instance());
            }
            if st.status != WorkflowStatus::Created {
                return Err(EngineError::InvalidOperation(format!(
                    "cannot start an instance in status {}",
                    st.status
                )));
            }
            let root = st
                .tree
                .as_ref()
                .ok_or_else(|| EngineError::InvalidOperation("no activity tree loaded".into()))?
                .root_id();
            Self::push_event(&mut st, self.instance_id, WorkflowEvent::Starting, None);
            st.status = WorkflowStatus::Running;
            st.state_changed_since_persistence = true;
            Self::push_event(&mut st, self.instance_id, WorkflowEvent::Started, None);
            Self::push_event(&mut st, self.instance_id, WorkflowEvent::Runnable, None);
            root
        };
        self.scheduler.set_can_run(true);
        self.scheduler
            .schedule_item(SchedulableItem::new(root, 0, |_| Ok(())), false, true);
        Ok(())
    }

    /// Request suspension. `Busy` carries the wait handle of the open atomic
    /// region; status is never mutated on the busy path. Created/Suspended
    /// instances report `Ready(false)`.
    pub fn suspend(&self, reason: &str) -> Result<Pending<bool>, EngineError> {
        let result = self.suspend_inner(reason);
        self.flush_events();
        result
    }

    fn suspend_inner(&self, reason: &str) -> Result<Pending<bool>, EngineError> {
        let cx = LockContext::new();
        let _eg = self.executor_lock.enter(&cx)?;
        {
            let mut st = self.state.lock();
            if !st.is_valid {
                return Err(EngineError::invalid_instance());
            }
            match st.status {
                WorkflowStatus::Created | WorkflowStatus::Suspended => {
                    return Ok(Pending::Ready(false))
                }
                WorkflowStatus::Completed | WorkflowStatus::Terminated => {
                    return Err(EngineError::InvalidOperation(format!(
                        "cannot suspend an instance in status {}",
                        st.status
                    )))
                }
                WorkflowStatus::Running => {}
            }
            st.suspend_requested = true;
            st.suspend_or_terminate_info = Some(reason.to_string());
        }
        self.scheduler.set_can_run(false);
        let _sg = self.scheduler_lock.enter(&cx)?;
        {
            let mut st = self.state.lock();
            if let Some(tx) = st.atomic.as_ref() {
                // Busy exit: withdraw the request and leave the scheduler
                // runnable, otherwise nothing restarts normal work after the
                // region closes. The caller retries once the handle signals.
                let handle = tx.region_event.clone();
                st.suspend_requested = false;
                st.suspend_or_terminate_info = None;
                drop(st);
                self.scheduler.set_can_run(true);
                return Ok(Pending::Busy(handle));
            }
            // The draining worker may have suspended on our behalf.
            if !(st.suspend_requested && st.status == WorkflowStatus::Running) {
                return Ok(Pending::Ready(true));
            }
        }
        self.suspend_on_idle(&cx)?;
        Ok(Pending::Ready(true))
    }

    /// Suspend from a context that already holds the scheduler lock. Refused
    /// while an atomic region is open; a deferred request stays pending
    /// until the region closes.
    pub fn suspend_on_idle(&self, cx: &LockContext) -> Result<(), EngineError> {
        self.scheduler_lock.assert_is_locked(cx);
        if self.state.lock().atomic.is_some() {
            return Err(EngineError::InvalidOperation(
                "cannot suspend while an atomic region is open".into(),
            ));
        }
        self.scheduler.set_can_run(false);
        self.timer_gate.suspend_delivery();
        let mut st = self.state.lock();
        let info = st.suspend_or_terminate_info.clone();
        Self::push_event(&mut st, self.instance_id, WorkflowEvent::Suspending, info.clone());
        st.status = WorkflowStatus::Suspended;
        st.suspend_requested = false;
        st.state_changed_since_persistence = true;
        Self::push_event(&mut st, self.instance_id, WorkflowEvent::Suspended, info);
        debug!(instance = %self.instance_id, "instance suspended");
        Ok(())
    }

    /// Resume a suspended instance (or restart a stopped scheduler).
    pub fn resume(&self) -> Result<(), EngineError> {
        let result = self.resume_inner();
        self.flush_events();
        result
    }

    fn resume_inner(&self) -> Result<(), EngineError> {
        let cx = LockContext::new();
        let _eg = self.executor_lock.enter(&cx)?;
        {
            let mut st = self.state.lock();
            if !st.is_valid {
                return Err(EngineError::invalid_instance());
            }
            match st.status {
                WorkflowStatus::Suspended => {}
                WorkflowStatus::Running if !self.scheduler.can_run() => {}
                _ => {
                    return Err(EngineError::InvalidOperation(format!(
                        "cannot resume an instance in status {}",
                        st.status
                    )))
                }
            }
            Self::push_event(&mut st, self.instance_id, WorkflowEvent::Resuming, None);
            st.status = WorkflowStatus::Running;
            st.suspend_requested = false;
            st.suspend_or_terminate_info = None;
            st.state_changed_since_persistence = true;
            Self::push_event(&mut st, self.instance_id, WorkflowEvent::Resumed, None);
            Self::push_event(&mut st, self.instance_id, WorkflowEvent::Runnable, None);
        }
        self.timer_gate.resume_delivery();
        self.resume_on_idle(true);
        Ok(())
    }

    /// Restart the scheduler. From an outside thread this also requests a
    /// worker; from the run loop itself the bare flag is enough.
    pub fn resume_on_idle(&self, outside_thread: bool) {
        if outside_thread {
            self.scheduler.resume();
        } else {
            self.scheduler.set_can_run(true);
        }
    }

    /// Terminate the instance. Termination wins over everything in flight:
    /// queued work (even elevated) is abandoned and an open atomic region is
    /// rolled back before the final state is persisted and unlocked.
    /// Remaining queued messages move to the pending bucket and the instance
    /// becomes invalid. Returns `false` if the terminal persist failed and
    /// the instance was aborted instead.
    pub fn terminate(&self, reason: &str) -> Result<bool, EngineError> {
        let result = self.terminate_inner(reason);
        self.flush_events();
        result
    }

    fn terminate_inner(&self, reason: &str) -> Result<bool, EngineError> {
        let cx = LockContext::new();
        let _eg = self.executor_lock.enter(&cx)?;
        if !self.is_valid() {
            return Err(EngineError::invalid_instance());
        }
        // Stop dequeuing before taking the scheduler lock so the worker
        // drains promptly; queued elevated work is intentionally abandoned.
        self.scheduler.set_abort_or_terminate_requested(true);
        self.scheduler.set_can_run(false);
        let _sg = self.scheduler_lock.enter(&cx)?;
        if !self.is_valid() {
            return Err(EngineError::invalid_instance());
        }
        self.terminate_on_idle(&cx, reason)
    }

    /// Terminate from a context that already holds the scheduler lock.
    /// Returns `false` if the terminal persist failed and the instance was
    /// aborted instead.
    pub fn terminate_on_idle(&self, cx: &LockContext, reason: &str) -> Result<bool, EngineError> {
        self.scheduler_lock.assert_is_locked(cx);
        self.scheduler.set_abort_or_terminate_requested(true);
        self.scheduler.set_can_run(false);
        self.timer_gate.suspend_delivery();
        // Termination wins over an open atomic region: roll it back and
        // signal anyone blocked on it.
        self.rollback_open_region();
        let old_status = {
            let mut st = self.state.lock();
            let old = st.status;
            Self::push_event(
                &mut st,
                self.instance_id,
                WorkflowEvent::Terminating,
                Some(reason.to_string()),
            );
            st.status = WorkflowStatus::Terminated;
            st.suspend_or_terminate_info = Some(reason.to_string());
            st.state_changed_since_persistence = true;
            old
        };
        let persisted = self.persist(cx, true, false);
        match persisted {
            Ok(()) => {
                self.queuing.move_all_messages_to_pending();
                let mut st = self.state.lock();
                Self::push_event(
                    &mut st,
                    self.instance_id,
                    WorkflowEvent::Terminated,
                    Some(reason.to_string()),
                );
                st.is_valid = false;
                info!(instance = %self.instance_id, reason, "instance terminated");
                Ok(true)
            }
            Err(e) => {
                warn!(instance = %self.instance_id, error = %e, "terminal persist failed; aborting instead");
                // persist restored the status it saw at entry (Terminated);
                // roll further back to the pre-terminate status.
                self.state.lock().status = old_status;
                self.abort_on_idle(cx)?;
                Ok(false)
            }
        }
    }

    /// Abort: roll back any open region, discard the work batch, unlock the
    /// persisted state without saving, mark invalid.
    pub fn abort(&self) -> Result<(), EngineError> {
        let result = self.abort_inner();
        self.flush_events();
        result
    }

    fn abort_inner(&self) -> Result<(), EngineError> {
        let cx = LockContext::new();
        let _eg = self.executor_lock.enter(&cx)?;
        if !self.is_valid() {
            return Err(EngineError::invalid_instance());
        }
        self.scheduler.set_abort_or_terminate_requested(true);
        self.scheduler.set_can_run(false);
        let _sg = self.scheduler_lock.enter(&cx)?;
        self.abort_on_idle(&cx)
    }

    /// Abort from a context that already holds the scheduler lock.
    pub fn abort_on_idle(&self, cx: &LockContext) -> Result<(), EngineError> {
        self.scheduler_lock.assert_is_locked(cx);
        self.scheduler.set_abort_or_terminate_requested(true);
        self.scheduler.set_can_run(false);
        self.timer_gate.suspend_delivery();
        {
            let mut st = self.state.lock();
            Self::push_event(&mut st, self.instance_id, WorkflowEvent::Aborting, None);
        }
        self.rollback_open_region();
        {
            let mut st = self.state.lock();
            st.batch.clear();
            st.completed_contexts.clear();
        }
        if let Err(e) = self.services.persistence.unlock_instance_state(self.instance_id) {
            warn!(instance = %self.instance_id, error = %e, "failed to unlock persisted state during abort");
        }
        let mut st = self.state.lock();
        st.is_valid = false;
        Self::push_event(&mut st, self.instance_id, WorkflowEvent::Aborted, None);
        info!(instance = %self.instance_id, "instance aborted");
        Ok(())
    }

    /// Unload to the persistence provider. Legal only when the scheduler is
    /// drained (and no region is open) or the instance is suspended.
    pub fn unload(&self) -> Result<Pending<bool>, EngineError> {
        let result = self.unload_inner();
        self.flush_events();
        result
    }

    fn unload_inner(&self) -> Result<Pending<bool>, EngineError> {
        let cx = LockContext::new();
        let _eg = self.executor_lock.enter(&cx)?;
        let _sg = self.scheduler_lock.enter(&cx)?;
        {
            let st = self.state.lock();
            if !st.is_valid {
                return Err(EngineError::invalid_instance());
            }
            if let Some(tx) = st.atomic.as_ref() {
                return Ok(Pending::Busy(tx.region_event.clone()));
            }
            if !(self.scheduler.is_empty() || st.status == WorkflowStatus::Suspended) {
                return Err(EngineError::InvalidOperation(
                    "cannot unload an instance with runnable work".into(),
                ));
            }
        }
        self.unload_locked(&cx)?;
        Ok(Pending::Ready(true))
    }

    /// Non-blocking unload: `Ready(false)` when the instance is busy in any
    /// way (runnable work, contended scheduler lock); `Busy` only for an
    /// open atomic region.
    pub fn try_unload(&self) -> Result<Pending<bool>, EngineError> {
        let result = self.try_unload_inner();
        self.flush_events();
        result
    }

    fn try_unload_inner(&self) -> Result<Pending<bool>, EngineError> {
        let cx = LockContext::new();
        let _eg = self.executor_lock.enter(&cx)?;
        let Some(_sg) = self.scheduler_lock.try_enter(&cx)? else {
            return Ok(Pending::Ready(false));
        };
        {
            let st = self.state.lock();
            if !st.is_valid {
                return Err(EngineError::invalid_instance());
            }
            if let Some(tx) = st.atomic.as_ref() {
                return Ok(Pending::Busy(tx.region_event.clone()));
            }
            if !(self.scheduler.is_empty() || st.status == WorkflowStatus::Suspended) {
                return Ok(Pending::Ready(false));
            }
        }
        self.unload_locked(&cx)?;
        Ok(Pending::Ready(true))
    }

    fn unload_locked(&self, cx: &LockContext) -> Result<(), EngineError> {
        {
            let mut st = self.state.lock();
            Self::push_event(&mut st, self.instance_id, WorkflowEvent::Unloading, None);
        }
        self.persist(cx, true, true)?;
        self.timer_gate.suspend_delivery();
        let mut st = self.state.lock();
        st.tree = None;
        st.is_valid = false;
        Self::push_event(&mut st, self.instance_id, WorkflowEvent::Unloaded, None);
        info!(instance = %self.instance_id, "instance unloaded");
        Ok(())
    }

    // ---- persistence -------------------------------------------------------

    /// Checkpoint the instance. Promotes Running→Completed when the root is
    /// closed, saves fully-closed nested contexts when `needs_compensation`,
    /// commits the work batch through the coordinator, then writes the
    /// snapshot. Any failure restores in-memory state (status, queue state,
    /// scheduler pseudo-rollback, batch) and withholds the attempt's events
    /// before the error propagates.
    ///
    /// Runs under the message-delivery lock: live deliveries must not
    /// interleave with the queue reconcile.
    pub fn persist(
        &self,
        cx: &LockContext,
        unlock: bool,
        needs_compensation: bool,
    ) -> Result<(), EngineError> {
        self.scheduler_lock.assert_is_locked(cx);
        let _mg = self.msg_delivery_lock.enter(cx)?;
        let (old_status, event_mark, contexts, mut batch, snapshot) = {
            let mut st = self.state.lock();
            if !unlock && !st.batch.is_dirty() && !st.state_changed_since_persistence {
                return Ok(());
            }
            let event_mark = st.pending_events.len();
            let old_status = st.status;
            let root_closed = st.tree.as_ref().map(|t| t.is_root_closed()).unwrap_or(false);
            if root_closed && st.status == WorkflowStatus::Running {
                Self::push_event(&mut st, self.instance_id, WorkflowEvent::Completing, None);
                st.status = WorkflowStatus::Completed;
            }
            Self::push_event(&mut st, self.instance_id, WorkflowEvent::Persisting, None);
            let contexts: Vec<CompletedContext> = if needs_compensation {
                st.completed_contexts.drain(..).collect()
            } else {
                Vec::new()
            };
            let batch = std::mem::take(&mut st.batch);
            self.queuing.pre_persist();
            let snapshot = self.build_snapshot(&st);
            (old_status, event_mark, contexts, batch, snapshot)
        };

        // Provider and coordinator calls run without the state mutex held;
        // their implementations may read back through the public accessors.
        let mut failure: Option<EngineError> = None;
        for ctx in &contexts {
            if let Err(e) = self
                .services
                .persistence
                .save_completed_context(self.instance_id, ctx)
            {
                failure = Some(e.into());
                break;
            }
        }
        if failure.is_none() {
            if let Err(e) = self.services.transactions.commit_batch(&mut batch) {
                failure = Some(e);
            }
        }
        if failure.is_none() {
            if let Err(e) = self.services.persistence.save_instance_state(&snapshot, unlock) {
                failure = Some(e.into());
            }
        }
        match failure {
            None => {
                self.queuing.post_persist(true);
                self.scheduler.post_persist();
                let mut st = self.state.lock();
                st.state_changed_since_persistence = false;
                Self::push_event(&mut st, self.instance_id, WorkflowEvent::Persisted, None);
                if st.status == WorkflowStatus::Completed && old_status != WorkflowStatus::Completed
                {
                    Self::push_event(&mut st, self.instance_id, WorkflowEvent::Completed, None);
                }
                Ok(())
            }
            Some(e) => {
                self.queuing.post_persist(false);
                self.scheduler.rollback();
                let mut st = self.state.lock();
                st.status = old_status;
                // Uncommitted batch work survives for the next attempt, and
                // the attempt's provisional events never reach observers.
                st.batch = batch;
                st.pending_events.truncate(event_mark);
                // Put drained contexts back in their original order.
                let mut restored = contexts;
                restored.append(&mut st.completed_contexts);
                st.completed_contexts = restored;
                warn!(instance = %self.instance_id, error = %e, "persistence attempt failed; state restored");
                Err(e)
            }
        }
    }

    fn build_snapshot(&self, st: &ExecState) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: self.instance_id,
            status: st.status,
            suspend_or_terminate_info: st.suspend_or_terminate_info.clone(),
            is_blocked: st.is_blocked,
            tree: st.tree.clone(),
            queue_state: self.queuing.snapshot(),
        }
    }

    // ---- message delivery --------------------------------------------------

    /// Deliver a message into a named queue under the message-delivery lock.
    pub fn enqueue_item(&self, queue: &str, payload: impl Into<String>) -> Result<u64, EngineError> {
        let cx = LockContext::new();
        let id = {
            let _mg = self.msg_delivery_lock.enter(&cx)?;
            let mut st = self.state.lock();
            if !st.is_valid {
                return Err(EngineError::invalid_instance());
            }
            st.is_blocked = false;
            drop(st);
            self.queuing.enqueue(queue, payload)?
        };
        self.deliver_async_notifications();
        Ok(id)
    }

    /// Deliver a message once the scheduler has stalled: blocks on the
    /// message-delivery lock's condition variable, which the run loop pulses
    /// every time it goes idle.
    pub fn enqueue_item_on_idle(
        &self,
        queue: &str,
        payload: impl Into<String>,
    ) -> Result<u64, EngineError> {
        let payload = payload.into();
        let cx = LockContext::new();
        let id = {
            let mut mg = self.msg_delivery_lock.enter(&cx)?;
            loop {
                {
                    let st = self.state.lock();
                    if !st.is_valid {
                        return Err(EngineError::invalid_instance());
                    }
                    if self.scheduler.is_empty() && st.atomic.is_none() {
                        break;
                    }
                }
                mg.wait()?;
            }
            let mut st = self.state.lock();
            st.is_blocked = false;
            drop(st);
            self.queuing.enqueue(queue, payload)?
        };
        self.deliver_async_notifications();
        Ok(id)
    }

    /// Schedule host work onto the normal tier.
    pub fn schedule_work(&self, item: SchedulableItem) -> Result<u64, EngineError> {
        {
            let mut st = self.state.lock();
            if !st.is_valid {
                return Err(EngineError::invalid_instance());
            }
            st.is_blocked = false;
            st.state_changed_since_persistence = true;
        }
        Ok(self.scheduler.schedule_item(item, false, true))
    }

    // ---- run loop ----------------------------------------------------------

    /// Host-thread entry: drain the scheduler under the scheduler lock, then
    /// handle the idle transition. Buffered events and deferred queue
    /// notifications are delivered after the lock is released.
    pub fn run_scheduler(&self) {
        let cx = LockContext::new();
        self.scheduler.worker_thread_started();
        if let Err(e) = self.run_scheduler_inner(&cx) {
            error!(instance = %self.instance_id, error = %e, "run loop failed irrecoverably");
        }
        self.flush_events();
        self.deliver_async_notifications();
        // Cover items scheduled while a competing thread request bounced off
        // the scheduler lock we were holding.
        self.scheduler.ensure_thread_if_runnable();
    }

    fn run_scheduler_inner(&self, cx: &LockContext) -> Result<(), EngineError> {
        // Another donated thread is already draining; nothing to do.
        let Some(_sg) = self.scheduler_lock.try_enter(cx)? else {
            return Ok(());
        };
        loop {
            if !self.is_valid() {
                return Ok(());
            }
            let Some(item) = self.scheduler.get_item_to_run() else {
                break;
            };
            self.run_one(cx, item)?;
        }
        self.on_idle(cx)
    }

    fn run_one(&self, cx: &LockContext, item: SchedulableItem) -> Result<(), EngineError> {
        // Abort observation is poll-based, checked at every dequeue. The
        // coordinator is consulted outside the state mutex.
        let handle = self.state.lock().atomic.as_ref().map(|tx| tx.handle);
        let poll = match handle {
            Some(h) => {
                let status = self.services.transactions.status(h);
                let mut st = self.state.lock();
                match st.atomic.as_mut() {
                    Some(tx) => tx.check_at_dequeue(status),
                    None => Ok(()),
                }
            }
            None => Ok(()),
        };
        if let Err(e) = poll {
            self.handle_fault(item.activity, e);
            return Ok(());
        }
        {
            let mut st = self.state.lock();
            if let Some(tree) = st.tree.as_mut() {
                tree.set_status(item.activity, ExecutionStatus::Executing);
            }
            Self::push_event(
                &mut st,
                self.instance_id,
                WorkflowEvent::Executing,
                Some(item.activity.to_string()),
            );
        }
        let activity = item.activity;
        let mut run_cx = RunContext {
            exec: self,
            cx,
            activity,
            context_id: item.context_id,
        };
        let result = (item.work)(&mut run_cx);
        {
            let mut st = self.state.lock();
            Self::push_event(
                &mut st,
                self.instance_id,
                WorkflowEvent::NotExecuting,
                Some(activity.to_string()),
            );
        }
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_irrecoverable() => Err(e),
            Err(e) => {
                self.handle_fault(activity, e);
                Ok(())
            }
        }
    }

    /// Route a workflow-logic fault: mark the responsible activity, record
    /// the error, roll back an open region.
    fn handle_fault(&self, activity: ActivityId, err: EngineError) {
        warn!(instance = %self.instance_id, activity, error = %err, "work item faulted");
        {
            let mut st = self.state.lock();
            if let Some(tree) = st.tree.as_mut() {
                tree.set_status(activity, ExecutionStatus::Faulting);
                if let Some(node) = tree.get_mut(activity) {
                    node.extensions
                        .insert("fault_message".to_string(), err.to_string());
                }
                tree.close(activity, ExecutionResult::Faulted);
            }
            st.state_changed_since_persistence = true;
        }
        self.rollback_open_region();
    }

    /// Idle transition after the scheduler drains: wake §5(b)-style message
    /// waiters, complete if the root closed, otherwise raise Idle and run
    /// the auto-unload / checkpoint / deferred-suspend ladder.
    fn on_idle(&self, cx: &LockContext) -> Result<(), EngineError> {
        {
            let mg = self.msg_delivery_lock.enter(cx)?;
            mg.pulse_all();
        }
        if self.scheduler.abort_or_terminate_requested() {
            // terminate/abort owns the teardown from here.
            return Ok(());
        }
        let (valid, root_closed, dirty) = {
            let st = self.state.lock();
            let root_closed = st.tree.as_ref().map(|t| t.is_root_closed()).unwrap_or(false);
            (
                st.is_valid,
                root_closed,
                st.batch.is_dirty() || st.state_changed_since_persistence,
            )
        };
        if !valid {
            return Ok(());
        }
        if root_closed {
            return self.complete_on_idle(cx);
        }
        let unload_candidate = {
            let mut st = self.state.lock();
            Self::push_event(&mut st, self.instance_id, WorkflowEvent::Idle, None);
            st.is_blocked = true;
            let unloadable = st.atomic.is_none()
                && matches!(st.status, WorkflowStatus::Running | WorkflowStatus::Suspended);
            unloadable.then(|| self.build_snapshot(&st))
        };
        // Consult the provider without the state mutex held.
        let unload_wanted = match unload_candidate {
            Some(snapshot) => self.services.persistence.unload_on_idle(&snapshot),
            None => false,
        };
        if unload_wanted {
            match self.unload_locked(cx) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(instance = %self.instance_id, error = %e, "auto-unload failed");
                    return self.protected_persist_fallback(cx, e);
                }
            }
        }
        if dirty {
            if let Err(e) = self.persist(cx, false, true) {
                return self.protected_persist_fallback(cx, e);
            }
        }
        let suspend_requested = {
            let st = self.state.lock();
            // A request made inside a still-open region stays pending until
            // the region closes.
            st.suspend_requested && st.atomic.is_none()
        };
        if suspend_requested {
            self.suspend_on_idle(cx)?;
        }
        Ok(())
    }

    fn complete_on_idle(&self, cx: &LockContext) -> Result<(), EngineError> {
        match self.persist(cx, true, true) {
            Ok(()) => {
                self.queuing.move_all_messages_to_pending();
                self.timer_gate.suspend_delivery();
                let mut st = self.state.lock();
                st.is_valid = false;
                info!(instance = %self.instance_id, "instance completed");
                Ok(())
            }
            Err(e) => self.protected_persist_fallback(cx, e),
        }
    }

    /// A persistence failure on the idle path terminates the instance with
    /// the error text; if the terminal persist also fails, terminate_on_idle
    /// falls back to abort.
    fn protected_persist_fallback(
        &self,
        cx: &LockContext,
        err: EngineError,
    ) -> Result<(), EngineError> {
        warn!(instance = %self.instance_id, error = %err, "idle checkpoint failed; terminating");
        let reason = err.to_string();
        self.terminate_on_idle(cx, &reason)?;
        Ok(())
    }

    // ---- atomic region plumbing --------------------------------------------

    fn open_region(
        &self,
        activity: ActivityId,
        isolation: IsolationLevel,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        {
            let st = self.state.lock();
            if st.atomic.is_some() {
                return Err(EngineError::InvalidOperation(
                    "an atomic region is already open for this instance".into(),
                ));
            }
        }
        let handle = self.services.transactions.begin(isolation, timeout)?;
        let local = self.queuing.open_region()?;
        self.scheduler.set_atomic_region_open(true);
        let mut st = self.state.lock();
        st.atomic = Some(TransactionContext::new(activity, handle, isolation, local));
        debug!(instance = %self.instance_id, activity, "atomic region opened");
        Ok(())
    }

    fn commit_region(&self) -> Result<(), EngineError> {
        let Some(tx) = self.state.lock().atomic.take() else {
            return Err(EngineError::InvalidOperation(
                "no atomic region is open for this instance".into(),
            ));
        };
        if let Err(e) = self.services.transactions.commit(tx.handle) {
            // Commit refused (aborted/expired): discard the region's effects.
            let _ = tx.local_queues.complete(false);
            self.scheduler.set_atomic_region_open(false);
            tx.region_event.set();
            return Err(e);
        }
        tx.local_queues.complete(true)?;
        self.scheduler.set_atomic_region_open(false);
        for (item, transacted) in tx.deferred_items {
            self.scheduler.schedule_item(item, false, transacted);
        }
        tx.region_event.set();
        debug!(instance = %self.instance_id, activity = tx.activity, "atomic region committed");
        Ok(())
    }

    fn rollback_open_region(&self) {
        let tx = self.state.lock().atomic.take();
        if let Some(mut tx) = tx {
            let _ = self.services.transactions.rollback(tx.handle);
            tx.state = TransactionState::AbortProcessed;
            tx.deferred_items.clear();
            if let Err(e) = tx.local_queues.clone().complete(false) {
                warn!(instance = %self.instance_id, error = %e, "region rollback reconciliation failed");
            }
            self.scheduler.set_atomic_region_open(false);
            tx.region_event.set();
            debug!(instance = %self.instance_id, activity = tx.activity, "atomic region rolled back");
        }
    }

    // ---- event plumbing ----------------------------------------------------

    fn push_event(
        st: &mut ExecState,
        instance_id: Uuid,
        event: WorkflowEvent,
        info: Option<String>,
    ) {
        st.pending_events.push(WorkflowEventArgs {
            instance_id,
            event,
            info,
        });
    }

    fn buffer_event(&self, event: WorkflowEvent, info: Option<String>) {
        let mut st = self.state.lock();
        Self::push_event(&mut st, self.instance_id, event, info);
    }

    /// Dispatch buffered events to observers, outside all locks.
    fn flush_events(&self) {
        let events = std::mem::take(&mut self.state.lock().pending_events);
        if events.is_empty() {
            return;
        }
        let observers: Vec<Arc<dyn WorkflowObserver>> = self.observers.lock().clone();
        for args in &events {
            debug!(instance = %args.instance_id, event = %args.event, info = ?args.info, "workflow event");
            for obs in &observers {
                obs.on_event(args);
            }
        }
    }

    fn deliver_async_notifications(&self) {
        for n in self.queuing.drain_notifications() {
            n.deliver();
        }
    }
}

/// Execution context handed to a running work item. Borrows the lock ledger
/// so everything the item does stays inside the run loop's discipline.
pub struct RunContext<'a> {
    exec: &'a WorkflowExecutor,
    /// Lock ledger of the run-loop thread; `-on-idle` helpers reachable from
    /// here use it to prove the scheduler lock is held.
    cx: &'a LockContext,
    activity: ActivityId,
    context_id: u32,
}

impl RunContext<'_> {
    pub fn instance_id(&self) -> Uuid {
        self.exec.instance_id
    }

    pub fn activity(&self) -> ActivityId {
        self.activity
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    /// Schedule follow-up work. Inside an open atomic region, work targeting
    /// the region runs elevated; work targeting the outside is deferred until
    /// the region commits (returns 0 until then).
    pub fn schedule(&mut self, item: SchedulableItem) -> u64 {
        let elevated = {
            let mut st = self.exec.state.lock();
            st.state_changed_since_persistence = true;
            let in_region = match (&st.atomic, &st.tree) {
                (Some(tx), Some(tree)) => Some(tree.is_descendant(item.activity, tx.activity)),
                (Some(_), None) => Some(false),
                (None, _) => None,
            };
            match in_region {
                Some(false) => {
                    // Escapes the region: only materializes on commit.
                    if let Some(tx) = st.atomic.as_mut() {
                        tx.deferred_items.push((item, true));
                    }
                    return 0;
                }
                Some(true) => true,
                None => false,
            }
        };
        self.exec.scheduler.schedule_item(item, elevated, !elevated)
    }

    /// Open an atomic region rooted at the current activity.
    pub fn begin_atomic(
        &mut self,
        isolation: IsolationLevel,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.exec.open_region(self.activity, isolation, timeout)
    }

    /// Commit the open atomic region: merge its queue shadow, release the
    /// normal tier, schedule its deferred items, signal blocked control
    /// operations.
    pub fn commit_atomic(&mut self) -> Result<(), EngineError> {
        self.exec.commit_region()
    }

    /// Close an activity. Fully-closed nested contexts are remembered for
    /// compensation at the next checkpoint.
    pub fn close_activity(&mut self, id: ActivityId, result: ExecutionResult) {
        let mut guard = self.exec.state.lock();
        let st = &mut *guard;
        if let Some(tree) = st.tree.as_mut() {
            tree.close(id, result);
            let completed = tree.completed_context(id).filter(|ctx| {
                ctx.context_id != 0 && tree.context_activity_of(id).map(|a| a.id) == Some(id)
            });
            if let Some(ctx) = completed {
                st.completed_contexts.push(ctx);
            }
        }
        st.state_changed_since_persistence = true;
    }

    pub fn add_activity(&mut self, parent: ActivityId, name: &str) -> Option<ActivityId> {
        let mut st = self.exec.state.lock();
        st.state_changed_since_persistence = true;
        st.tree.as_mut()?.add_child(parent, name)
    }

    pub fn add_atomic_activity(&mut self, parent: ActivityId, name: &str) -> Option<ActivityId> {
        let mut st = self.exec.state.lock();
        st.state_changed_since_persistence = true;
        st.tree.as_mut()?.add_atomic_child(parent, name)
    }

    pub fn add_context_activity(
        &mut self,
        parent: ActivityId,
        name: &str,
        context_id: u32,
    ) -> Option<ActivityId> {
        let mut st = self.exec.state.lock();
        st.state_changed_since_persistence = true;
        st.tree.as_mut()?.add_context_child(parent, name, context_id)
    }

    /// Request suspension once the scheduler drains. The public `suspend`
    /// entry acquires the scheduler lock and would self-deadlock if called
    /// from a work item; this sets the flag the idle path honors instead.
    pub fn request_suspend(&mut self, reason: &str) {
        let mut st = self.exec.state.lock();
        st.suspend_requested = true;
        st.suspend_or_terminate_info = Some(reason.to_string());
    }

    /// Checkpoint from inside a work item (persist-on-close). Illegal while
    /// an atomic region is open.
    pub fn checkpoint(&mut self) -> Result<(), EngineError> {
        if self.exec.state.lock().atomic.is_some() {
            return Err(EngineError::InvalidOperation(
                "cannot checkpoint while an atomic region is open".into(),
            ));
        }
        self.exec.persist(self.cx, false, true)
    }

    /// Record a side effect committed only at the next successful checkpoint.
    pub fn add_batch_work<F>(&mut self, description: &str, commit: F)
    where
        F: FnMut() -> Result<(), String> + Send + 'static,
    {
        let mut st = self.exec.state.lock();
        st.batch.add(description, commit);
    }

    fn region_route(&self) -> Option<LocalQueuingService> {
        let st = self.exec.state.lock();
        match (&st.atomic, &st.tree) {
            (Some(tx), Some(tree)) if tree.is_descendant(self.activity, tx.activity) => {
                Some(tx.local_queues.clone())
            }
            _ => None,
        }
    }

    pub fn create_queue(&mut self, name: &str, transactional: bool) -> Result<(), QueueError> {
        match self.region_route() {
            Some(local) => local.create_queue(name, transactional),
            None => self.exec.queuing.create_queue(name, transactional),
        }
    }

    pub fn delete_queue(&mut self, name: &str) -> Result<(), QueueError> {
        match self.region_route() {
            Some(local) => local.delete_queue(name),
            None => self.exec.queuing.delete_queue(name),
        }
    }

    pub fn enqueue(&mut self, name: &str, payload: impl Into<String>) -> Result<u64, QueueError> {
        match self.region_route() {
            Some(local) => local.enqueue(name, payload),
            None => self.exec.queuing.enqueue(name, payload),
        }
    }

    pub fn dequeue(&mut self, name: &str) -> Result<Option<Message>, QueueError> {
        match self.region_route() {
            Some(local) => local.dequeue(name),
            None => self.exec.queuing.dequeue(name),
        }
    }

    pub fn peek(&mut self, name: &str) -> Result<Option<Message>, QueueError> {
        match self.region_route() {
            Some(local) => local.peek(name),
            None => self.exec.queuing.peek(name),
        }
    }
}

#[path = "executor_tests.rs"]
mod executor_tests;
