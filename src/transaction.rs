//! Atomic-region transaction support.
//!
//! One [`TransactionContext`] is attached to the single activity currently
//! running as an atomic region (at most one per instance). The ambient
//! transaction lives behind the [`TransactionCoordinator`] seam; abort
//! observation is poll-based, checked at dequeue boundaries by the run loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::activity::ActivityId;
use crate::error::EngineError;
use crate::hosting::WaitHandle;
use crate::queuing::LocalQueuingService;
use crate::schedule::SchedulableItem;

/// Observation state of the region's ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Ok,
    /// Observed aborted; the fault path has not yet reacted.
    Aborted,
    /// The fault path has rolled the region back.
    AbortProcessed,
}

/// Isolation requested for an atomic region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
    ReadCommitted,
}

/// Status reported by the coordinator for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    Aborted,
}

/// Opaque handle to an ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHandle(u64);

/// Platform seam for transaction begin/commit/rollback and batched
/// side-effect commit.
pub trait TransactionCoordinator: Send + Sync {
    fn begin(&self, isolation: IsolationLevel, timeout: Duration) -> Result<TxHandle, EngineError>;
    fn commit(&self, tx: TxHandle) -> Result<(), EngineError>;
    fn rollback(&self, tx: TxHandle) -> Result<(), EngineError>;
    fn status(&self, tx: TxHandle) -> TxStatus;
    /// Commit the instance's batched side effects. Clears the batch on
    /// success; on failure the batch is left intact for the caller's
    /// rollback handling.
    fn commit_batch(&self, batch: &mut WorkBatch) -> Result<(), EngineError>;
}

/// One batched side-effect item: committed through the coordinator at
/// persistence points, discarded wholesale by abort.
pub struct BatchItem {
    pub description: String,
    commit: Box<dyn FnMut() -> Result<(), String> + Send>,
}

/// Ordered pending side effects accumulated since the last commit.
#[derive(Default)]
pub struct WorkBatch {
    items: Vec<BatchItem>,
}

impl WorkBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, description: impl Into<String>, commit: F)
    where
        F: FnMut() -> Result<(), String> + Send + 'static,
    {
        self.items.push(BatchItem {
            description: description.into(),
            commit: Box::new(commit),
        });
    }

    pub fn is_dirty(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Discard all batched work (abort path).
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub(crate) fn commit_all(&mut self) -> Result<(), String> {
        for item in &mut self.items {
            (item.commit)().map_err(|e| format!("batch item '{}' failed: {e}", item.description))?;
        }
        self.items.clear();
        Ok(())
    }
}

impl std::fmt::Debug for WorkBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkBatch").field("items", &self.items.len()).finish()
    }
}

struct TxRecord {
    status: TxStatus,
    deadline: Instant,
}

/// In-process coordinator: good enough for hosts without a distributed
/// transaction manager, and for tests. Timeout-driven rollback is observed
/// lazily: an expired active transaction reports `Aborted` from `status`.
#[derive(Default)]
pub struct LocalTransactionCoordinator {
    transactions: Mutex<HashMap<TxHandle, TxRecord>>,
    next_id: AtomicU64,
    fail_next_batch_commit: AtomicBool,
}

impl LocalTransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Externally abort a transaction (test hook; the engine itself only
    /// observes aborts at dequeue boundaries).
    pub fn abort(&self, tx: TxHandle) {
        if let Some(rec) = self.transactions.lock().get_mut(&tx) {
            rec.status = TxStatus::Aborted;
        }
    }

    /// Fail the next `commit_batch` call (test hook).
    pub fn fail_next_batch_commit(&self) {
        self.fail_next_batch_commit.store(true, Ordering::SeqCst);
    }
}

impl TransactionCoordinator for LocalTransactionCoordinator {
    fn begin(&self, isolation: IsolationLevel, timeout: Duration) -> Result<TxHandle, EngineError> {
        let tx = TxHandle(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        debug!(?tx, ?isolation, ?timeout, "beginning transaction");
        self.transactions.lock().insert(
            tx,
            TxRecord {
                status: TxStatus::Active,
                deadline: Instant::now() + timeout,
            },
        );
        Ok(tx)
    }

    fn commit(&self, tx: TxHandle) -> Result<(), EngineError> {
        let mut txs = self.transactions.lock();
        let rec = txs
            .get_mut(&tx)
            .ok_or_else(|| EngineError::Transaction(format!("unknown transaction {tx:?}")))?;
        match rec.status {
            TxStatus::Active if Instant::now() <= rec.deadline => {
                rec.status = TxStatus::Committed;
                Ok(())
            }
            TxStatus::Active | TxStatus::Aborted => {
                rec.status = TxStatus::Aborted;
                Err(EngineError::TransactionAborted(format!(
                    "transaction {tx:?} aborted before commit"
                )))
            }
            TxStatus::Committed => Ok(()),
        }
    }

    fn rollback(&self, tx: TxHandle) -> Result<(), EngineError> {
        if let Some(rec) = self.transactions.lock().get_mut(&tx) {
            rec.status = TxStatus::Aborted;
        }
        Ok(())
    }

    fn status(&self, tx: TxHandle) -> TxStatus {
        let txs = self.transactions.lock();
        match txs.get(&tx) {
            Some(rec) if rec.status == TxStatus::Active && Instant::now() > rec.deadline => {
                TxStatus::Aborted
            }
            Some(rec) => rec.status,
            None => TxStatus::Aborted,
        }
    }

    fn commit_batch(&self, batch: &mut WorkBatch) -> Result<(), EngineError> {
        if self.fail_next_batch_commit.swap(false, Ordering::SeqCst) {
            return Err(EngineError::Transaction("injected batch commit failure".into()));
        }
        batch
            .commit_all()
            .map_err(EngineError::Transaction)
    }
}

/// State attached to the one activity currently running as an atomic region.
pub struct TransactionContext {
    pub activity: ActivityId,
    pub handle: TxHandle,
    pub isolation: IsolationLevel,
    /// A per-item transaction scope is currently open on the running thread.
    pub scope_open: bool,
    pub state: TransactionState,
    pub local_queues: LocalQueuingService,
    /// Items to schedule only if/when the region commits.
    pub deferred_items: Vec<(SchedulableItem, bool)>,
    /// Signaled when the region closes; handed out as the retryable signal
    /// for control operations blocked by the open region.
    pub region_event: WaitHandle,
}

impl TransactionContext {
    pub fn new(
        activity: ActivityId,
        handle: TxHandle,
        isolation: IsolationLevel,
        local_queues: LocalQueuingService,
    ) -> Self {
        Self {
            activity,
            handle,
            isolation,
            scope_open: false,
            state: TransactionState::Ok,
            local_queues,
            deferred_items: Vec::new(),
            region_event: WaitHandle::new(),
        }
    }

    /// Fold the coordinator's answer for the ambient transaction into the
    /// region state at a dequeue boundary. On the first observation of an
    /// abort, flips to `Aborted` and reports the error so the fault path can
    /// roll the region back. The caller fetches `status` without holding its
    /// own state lock.
    pub fn check_at_dequeue(&mut self, status: TxStatus) -> Result<(), EngineError> {
        if self.state == TransactionState::Ok && status == TxStatus::Aborted {
            warn!(activity = self.activity, "ambient transaction observed aborted");
            self.state = TransactionState::Aborted;
            return Err(EngineError::TransactionAborted(
                "ambient transaction aborted".into(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("activity", &self.activity)
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("scope_open", &self.scope_open)
            .field("deferred_items", &self.deferred_items.len())
            .finish()
    }
}
