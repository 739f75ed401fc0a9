//! Dual-tier work scheduler for one instance.
//!
//! Two FIFO tiers: `elevated` carries work scheduled from inside an open
//! atomic region and always preempts `normal`. Cancellation is cooperative
//! and checked only at dequeue boundaries: once abort-or-terminate is
//! requested, dequeuing stops unconditionally, abandoning even queued
//! elevated work so shutdown is prompt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::activity::ActivityId;
use crate::error::EngineError;
use crate::executor::RunContext;

/// Work body of a schedulable item.
pub type WorkFn = Box<dyn FnOnce(&mut RunContext<'_>) -> Result<(), EngineError> + Send>;

/// An opaque runnable unit tagged with its owning activity and execution
/// context. Owned by the scheduler's queue until run, discarded after.
pub struct SchedulableItem {
    pub activity: ActivityId,
    pub context_id: u32,
    pub(crate) id: u64,
    pub(crate) work: WorkFn,
}

impl SchedulableItem {
    pub fn new<F>(activity: ActivityId, context_id: u32, work: F) -> Self
    where
        F: FnOnce(&mut RunContext<'_>) -> Result<(), EngineError> + Send + 'static,
    {
        Self {
            activity,
            context_id,
            id: 0,
            work: Box::new(work),
        }
    }
}

impl std::fmt::Debug for SchedulableItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulableItem")
            .field("id", &self.id)
            .field("activity", &self.activity)
            .field("context_id", &self.context_id)
            .finish()
    }
}

#[derive(Default)]
struct SchedulerQueues {
    elevated: VecDeque<SchedulableItem>,
    normal: VecDeque<SchedulableItem>,
    /// Item ids scheduled since the last successful persistence commit;
    /// removed from the normal tier by [`Scheduler::rollback`].
    transacted_entries: Vec<u64>,
}

/// Priority-aware scheduler for one instance. Decides what runs next; the
/// run loop itself lives on the executor.
pub struct Scheduler {
    instance_id: Uuid,
    queues: Mutex<SchedulerQueues>,
    can_run: AtomicBool,
    empty: AtomicBool,
    abort_or_terminate_requested: AtomicBool,
    /// Coarse per-instance flag: while an atomic region is open anywhere in
    /// the instance, normal-tier dequeue is forbidden.
    atomic_region_open: AtomicBool,
    thread_requested: AtomicBool,
    next_item_id: AtomicU64,
    /// Installed by the executor; invoking it asks the host's scheduling
    /// collaborator for a worker thread.
    thread_request: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Scheduler {
    pub fn new(instance_id: Uuid, can_run: bool) -> Self {
        Self {
            instance_id,
            queues: Mutex::new(SchedulerQueues::default()),
            can_run: AtomicBool::new(can_run),
            empty: AtomicBool::new(true),
            abort_or_terminate_requested: AtomicBool::new(false),
            atomic_region_open: AtomicBool::new(false),
            thread_requested: AtomicBool::new(false),
            next_item_id: AtomicU64::new(1),
            thread_request: Mutex::new(None),
        }
    }

    pub(crate) fn set_thread_request(&self, f: Box<dyn Fn() + Send + Sync>) {
        *self.thread_request.lock() = Some(f);
    }

    /// Append `item` to the chosen tier. Transacted items are remembered for
    /// pseudo-rollback after a failed persistence attempt. Requests a worker
    /// thread if none is outstanding and the scheduler may run.
    pub fn schedule_item(&self, mut item: SchedulableItem, elevated: bool, transacted: bool) -> u64 {
        let id = self.next_item_id.fetch_add(1, Ordering::SeqCst);
        item.id = id;
        {
            let mut q = self.queues.lock();
            if transacted {
                q.transacted_entries.push(id);
            }
            if elevated {
                q.elevated.push_back(item);
            } else {
                q.normal.push_back(item);
            }
        }
        self.empty.store(false, Ordering::SeqCst);
        trace!(instance = %self.instance_id, item = id, elevated, transacted, "scheduled item");
        if self.can_run.load(Ordering::SeqCst) {
            self.request_worker_thread();
        }
        id
    }

    /// Dequeue decision. Termination wins over everything; elevated work
    /// preempts normal work unconditionally; normal work additionally
    /// requires `can_run` and no open atomic region.
    pub fn get_item_to_run(&self) -> Option<SchedulableItem> {
        let mut q = self.queues.lock();
        if self.abort_or_terminate_requested.load(Ordering::SeqCst) {
            // Abandon queued work, including in-flight elevated items.
            return None;
        }
        let item = if let Some(item) = q.elevated.pop_front() {
            Some(item)
        } else if self.can_run.load(Ordering::SeqCst) && !self.atomic_region_open.load(Ordering::SeqCst)
        {
            q.normal.pop_front()
        } else {
            None
        };
        if item.is_none() && q.elevated.is_empty() && q.normal.is_empty() {
            self.empty.store(true, Ordering::SeqCst);
        }
        item
    }

    /// Allow running and ask the host for a thread if work is queued.
    pub fn resume(&self) {
        self.can_run.store(true, Ordering::SeqCst);
        if !self.queues_empty() {
            self.request_worker_thread();
        }
    }

    /// Ask for a thread only if already allowed to run (post-load path).
    pub fn resume_if_runnable(&self) {
        if self.can_run.load(Ordering::SeqCst) && !self.queues_empty() {
            self.request_worker_thread();
        }
    }

    /// Undo items scheduled since the last successful persistence commit:
    /// remove from the normal tier exactly the remembered entries, keeping
    /// the relative order of the rest. The elevated tier is never touched.
    pub fn rollback(&self) {
        let mut q = self.queues.lock();
        if q.transacted_entries.is_empty() {
            return;
        }
        let before = q.normal.len();
        let transacted = std::mem::take(&mut q.transacted_entries);
        q.normal.retain(|item| !transacted.contains(&item.id));
        debug!(
            instance = %self.instance_id,
            removed = before - q.normal.len(),
            "scheduler rollback removed transacted items"
        );
    }

    /// Forget the pseudo-rollback set after a successful persistence commit.
    pub fn post_persist(&self) {
        self.queues.lock().transacted_entries.clear();
    }

    pub fn can_run(&self) -> bool {
        self.can_run.load(Ordering::SeqCst)
    }

    pub fn set_can_run(&self, value: bool) {
        self.can_run.store(value, Ordering::SeqCst);
    }

    /// Both tiers drained at the last dequeue decision.
    pub fn is_empty(&self) -> bool {
        self.empty.load(Ordering::SeqCst)
    }

    pub fn abort_or_terminate_requested(&self) -> bool {
        self.abort_or_terminate_requested.load(Ordering::SeqCst)
    }

    pub fn set_abort_or_terminate_requested(&self, value: bool) {
        self.abort_or_terminate_requested.store(value, Ordering::SeqCst);
    }

    pub fn atomic_region_open(&self) -> bool {
        self.atomic_region_open.load(Ordering::SeqCst)
    }

    pub(crate) fn set_atomic_region_open(&self, value: bool) {
        self.atomic_region_open.store(value, Ordering::SeqCst);
    }

    /// Called at run-loop entry so later `schedule_item` calls can request a
    /// fresh thread once this one drains.
    pub(crate) fn worker_thread_started(&self) {
        self.thread_requested.store(false, Ordering::SeqCst);
    }

    /// A dequeue would yield an item right now.
    fn has_runnable_work(&self) -> bool {
        if self.abort_or_terminate_requested.load(Ordering::SeqCst) {
            return false;
        }
        let q = self.queues.lock();
        if !q.elevated.is_empty() {
            return true;
        }
        self.can_run.load(Ordering::SeqCst)
            && !self.atomic_region_open.load(Ordering::SeqCst)
            && !q.normal.is_empty()
    }

    /// Ask for a worker if runnable work is queued. Called by a departing
    /// worker to cover items scheduled while a contending thread request was
    /// bouncing off the held scheduler lock.
    pub(crate) fn ensure_thread_if_runnable(&self) {
        if self.has_runnable_work() {
            self.request_worker_thread();
        }
    }

    pub(crate) fn queues_empty(&self) -> bool {
        let q = self.queues.lock();
        q.elevated.is_empty() && q.normal.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn queue_depths(&self) -> (usize, usize) {
        let q = self.queues.lock();
        (q.elevated.len(), q.normal.len())
    }

    fn request_worker_thread(&self) {
        if self.thread_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(f) = self.thread_request.lock().as_ref() {
            debug!(instance = %self.instance_id, "requesting worker thread");
            f();
        } else {
            // No executor installed yet (construction window); clear so the
            // request is not lost forever.
            self.thread_requested.store(false, Ordering::SeqCst);
        }
    }
}

#[path = "schedule_tests.rs"]
mod schedule_tests;
