//! Priority-ordered, instance-scoped locks.
//!
//! Every lock carries a declared priority and an acquisition policy. Before
//! any acquisition the calling thread's ledger of currently-held locks for
//! the same instance is audited: a held `StrictlyGreater` lock forbids
//! acquiring anything at the same or lower priority, a held
//! `GreaterOrReentrant` lock forbids acquiring anything at strictly lower
//! priority. A violation fails immediately with
//! [`EngineError::InvalidOperation`] instead of blocking: this is a static
//! discipline, not deadlock detection.
//!
//! The ledger is an explicit [`LockContext`] value created at each external
//! entry point and threaded through internal calls, rather than ambient
//! thread-local state.

use std::cell::RefCell;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::EngineError;

/// Acquisition policy declared by a lock, enforced against later
/// acquisitions on the same thread of control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// While held, only strictly-higher-priority locks may be acquired.
    StrictlyGreater,
    /// While held, equal-priority locks (including this one again) may also
    /// be acquired.
    GreaterOrReentrant,
}

/// Descriptor of a held lock as recorded in a [`LockContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub instance_id: Uuid,
    pub name: &'static str,
    pub priority: u8,
    pub policy: LockPolicy,
}

/// Per-thread-of-control ledger of currently-held instance locks.
///
/// One context is created at each external entry point (and at run-loop
/// thread start) and passed down; `-on-idle` operations take the context
/// that proves the scheduler lock is already held.
#[derive(Debug, Default)]
pub struct LockContext {
    held: RefCell<Vec<HeldLock>>,
}

impl LockContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holds(&self, lock: &InstanceLock) -> bool {
        self.held
            .borrow()
            .iter()
            .any(|h| h.instance_id == lock.instance_id && h.name == lock.name)
    }

    fn push(&self, held: HeldLock) {
        self.held.borrow_mut().push(held);
    }

    fn pop(&self, lock: &InstanceLock) {
        let mut held = self.held.borrow_mut();
        if let Some(pos) = held
            .iter()
            .rposition(|h| h.instance_id == lock.instance_id && h.name == lock.name)
        {
            held.remove(pos);
        }
    }

    /// Audit the ledger before acquiring `next`. Only locks for the same
    /// instance participate.
    fn enforce_guard(&self, next: &InstanceLock) -> Result<(), EngineError> {
        for held in self.held.borrow().iter() {
            if held.instance_id != next.instance_id {
                continue;
            }
            let violation = match held.policy {
                LockPolicy::StrictlyGreater => held.priority <= next.priority,
                LockPolicy::GreaterOrReentrant => held.priority < next.priority,
            };
            if violation {
                return Err(EngineError::InvalidOperation(format!(
                    "operation not valid from this execution context: cannot acquire '{}' (priority {}) while holding '{}' (priority {}, {:?})",
                    next.name, next.priority, held.name, held.priority, held.policy
                )));
            }
        }
        Ok(())
    }
}

/// A named mutual-exclusion primitive scoped to one workflow instance.
pub struct InstanceLock {
    instance_id: Uuid,
    name: &'static str,
    priority: u8,
    policy: LockPolicy,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock")
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Executor-control lock priority.
pub const EXECUTOR_LOCK_PRIORITY: u8 = 50;
/// Scheduler lock priority.
pub const SCHEDULER_LOCK_PRIORITY: u8 = 40;
/// Message-delivery lock priority.
pub const MESSAGE_DELIVERY_LOCK_PRIORITY: u8 = 35;

impl InstanceLock {
    pub fn new(instance_id: Uuid, name: &'static str, priority: u8, policy: LockPolicy) -> Self {
        Self {
            instance_id,
            name,
            priority,
            policy,
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// The executor-control lock (50, reentrant).
    pub fn executor_lock(instance_id: Uuid) -> Self {
        Self::new(
            instance_id,
            "executor",
            EXECUTOR_LOCK_PRIORITY,
            LockPolicy::GreaterOrReentrant,
        )
    }

    /// The scheduler lock (40, strict).
    pub fn scheduler_lock(instance_id: Uuid) -> Self {
        Self::new(
            instance_id,
            "scheduler",
            SCHEDULER_LOCK_PRIORITY,
            LockPolicy::StrictlyGreater,
        )
    }

    /// The message-delivery lock (35, reentrant).
    pub fn message_delivery_lock(instance_id: Uuid) -> Self {
        Self::new(
            instance_id,
            "message_delivery",
            MESSAGE_DELIVERY_LOCK_PRIORITY,
            LockPolicy::GreaterOrReentrant,
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    fn descriptor(&self) -> HeldLock {
        HeldLock {
            instance_id: self.instance_id,
            name: self.name,
            priority: self.priority,
            policy: self.policy,
        }
    }

    /// Acquire the lock, blocking. Fails without blocking if acquisition
    /// would violate the priority discipline recorded in `cx`.
    ///
    /// A reentrant acquisition (this lock is already in `cx` and its policy
    /// permits it) returns a guard that releases only the ledger entry.
    pub fn enter<'a>(&'a self, cx: &'a LockContext) -> Result<InstanceLockGuard<'a>, EngineError> {
        if cx.holds(self) {
            if self.policy == LockPolicy::GreaterOrReentrant {
                cx.push(self.descriptor());
                return Ok(InstanceLockGuard {
                    lock: self,
                    cx,
                    inner: None,
                });
            }
            return Err(EngineError::InvalidOperation(format!(
                "operation not valid from this execution context: lock '{}' is not reentrant",
                self.name
            )));
        }
        cx.enforce_guard(self)?;
        let inner = self.mutex.lock();
        cx.push(self.descriptor());
        Ok(InstanceLockGuard {
            lock: self,
            cx,
            inner: Some(inner),
        })
    }

    /// Non-blocking acquisition. Returns `Ok(None)` if the lock is currently
    /// held by another thread; guard violations still fail.
    pub fn try_enter<'a>(
        &'a self,
        cx: &'a LockContext,
    ) -> Result<Option<InstanceLockGuard<'a>>, EngineError> {
        if cx.holds(self) {
            // Delegate to enter for the reentrant bookkeeping.
            return self.enter(cx).map(Some);
        }
        cx.enforce_guard(self)?;
        match self.mutex.try_lock() {
            Some(inner) => {
                cx.push(self.descriptor());
                Ok(Some(InstanceLockGuard {
                    lock: self,
                    cx,
                    inner: Some(inner),
                }))
            }
            None => Ok(None),
        }
    }

    /// Debug invariant: the caller must hold this lock.
    pub fn assert_is_locked(&self, cx: &LockContext) {
        debug_assert!(
            cx.holds(self),
            "lock '{}' must be held at this point",
            self.name
        );
    }
}

/// Scoped handle for a held [`InstanceLock`]. Dropping it removes the lock
/// from the ledger and releases the underlying mutex on every exit path.
pub struct InstanceLockGuard<'a> {
    lock: &'a InstanceLock,
    cx: &'a LockContext,
    /// `None` for a reentrant acquisition; the outermost guard owns the mutex.
    inner: Option<MutexGuard<'a, ()>>,
}

impl<'a> InstanceLockGuard<'a> {
    /// Block until pulsed, releasing the underlying mutex for the duration
    /// but keeping the ownership record in the ledger.
    pub fn wait(&mut self) -> Result<(), EngineError> {
        match self.inner.as_mut() {
            Some(inner) => {
                self.lock.cond.wait(inner);
                Ok(())
            }
            None => Err(EngineError::InvalidOperation(format!(
                "cannot wait on reentrant acquisition of '{}'",
                self.lock.name
            ))),
        }
    }

    /// As [`wait`](Self::wait) with a timeout; returns `Ok(true)` if pulsed
    /// before the timeout elapsed.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<bool, EngineError> {
        match self.inner.as_mut() {
            Some(inner) => {
                let res = self.lock.cond.wait_for(inner, timeout);
                Ok(!res.timed_out())
            }
            None => Err(EngineError::InvalidOperation(format!(
                "cannot wait on reentrant acquisition of '{}'",
                self.lock.name
            ))),
        }
    }

    /// Wake one waiter.
    pub fn pulse(&self) {
        self.lock.cond.notify_one();
    }

    /// Wake every waiter.
    pub fn pulse_all(&self) {
        self.lock.cond.notify_all();
    }
}

impl Drop for InstanceLockGuard<'_> {
    fn drop(&mut self) {
        self.cx.pop(self.lock);
        // `inner` drops after the ledger entry is gone, releasing the mutex.
    }
}

#[path = "locks_tests.rs"]
mod locks_tests;
