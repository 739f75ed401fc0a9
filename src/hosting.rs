//! Host collaborators: thread supply, retry signals, timer delivery gating.
//!
//! The engine never spawns threads itself. A [`SchedulerService`] donates the
//! thread that drives the executor's run loop; hosts that want deterministic
//! control (tests, single-threaded embeddings) can use
//! [`ManualSchedulerService`] and pump callbacks explicitly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Callback handed to the host when the engine needs a worker thread.
pub type ThreadCallback = Box<dyn FnOnce() + Send>;

/// Host-supplied thread pool ("scheduling collaborator").
pub trait SchedulerService: Send + Sync {
    /// Request a thread to run `callback` for the given instance. The host
    /// may run it on any thread, but must run it exactly once and must not
    /// run it synchronously inside this call while the requester still holds
    /// instance locks.
    fn request_thread(&self, instance_id: Uuid, callback: ThreadCallback);
}

/// Default host scheduler: one named OS thread per request.
#[derive(Debug, Default)]
pub struct DefaultSchedulerService;

impl SchedulerService for DefaultSchedulerService {
    fn request_thread(&self, instance_id: Uuid, callback: ThreadCallback) {
        debug!(instance = %instance_id, "spawning worker thread");
        let _ = std::thread::Builder::new()
            .name(format!("weftrun-{instance_id}"))
            .spawn(callback);
    }
}

/// Collects thread requests for explicit pumping. Deterministic: callbacks
/// run on the pumping thread, in request order.
#[derive(Default)]
pub struct ManualSchedulerService {
    pending: Mutex<VecDeque<(Uuid, ThreadCallback)>>,
}

impl ManualSchedulerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of callbacks waiting to be pumped.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run queued callbacks until none remain (callbacks may enqueue more).
    /// Returns the number of callbacks run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some((instance, cb)) => {
                    debug!(instance = %instance, "running pumped worker callback");
                    cb();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl SchedulerService for ManualSchedulerService {
    fn request_thread(&self, instance_id: Uuid, callback: ThreadCallback) {
        self.pending.lock().push_back((instance_id, callback));
    }
}

/// One-shot signal used as the payload of [`Pending::Busy`]: becomes signaled
/// when the condition blocking the control operation (an open atomic region)
/// has cleared.
#[derive(Clone, Default)]
pub struct WaitHandle {
    inner: Arc<WaitHandleInner>,
}

#[derive(Default)]
struct WaitHandleInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl WaitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        *self.inner.signaled.lock()
    }

    /// Signal every current and future waiter.
    pub fn set(&self) {
        let mut s = self.inner.signaled.lock();
        *s = true;
        self.inner.cond.notify_all();
    }

    /// Block until signaled.
    pub fn wait(&self) {
        let mut s = self.inner.signaled.lock();
        while !*s {
            self.inner.cond.wait(&mut s);
        }
    }

    /// Block until signaled or the timeout elapses; `true` if signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut s = self.inner.signaled.lock();
        if *s {
            return true;
        }
        let _ = self.inner.cond.wait_for(&mut s, timeout);
        *s
    }
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle").field("signaled", &self.is_set()).finish()
    }
}

/// Typed result of a control operation that may be blocked by an open atomic
/// region. Callers retry explicitly: wait on the handle, then call again.
#[derive(Debug)]
pub enum Pending<T> {
    Ready(T),
    Busy(WaitHandle),
}

impl<T> Pending<T> {
    pub fn is_busy(&self) -> bool {
        matches!(self, Pending::Busy(_))
    }

    /// Unwrap the ready value; panics on `Busy`. Test/int-host convenience.
    pub fn expect_ready(self, msg: &str) -> T {
        match self {
            Pending::Ready(v) => v,
            Pending::Busy(_) => panic!("{msg}: operation is busy"),
        }
    }
}

/// Gate consulted by the host's timer service before delivering expired
/// timers to the instance. Suspend/terminate/abort close the gate; resume
/// reopens it.
#[derive(Debug, Default)]
pub struct TimerDeliveryGate {
    suspended: std::sync::atomic::AtomicBool,
}

impl TimerDeliveryGate {
    pub fn suspend_delivery(&self) {
        self.suspended.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn resume_delivery(&self) {
        self.suspended.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(std::sync::atomic::Ordering::SeqCst)
    }
}
