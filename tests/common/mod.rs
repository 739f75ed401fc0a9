//! Shared helpers for the integration suites.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use weftrun::activity::ActivityTree;
use weftrun::executor::{WorkflowExecutor, WorkflowServices};
use weftrun::hosting::ManualSchedulerService;
use weftrun::providers::in_memory::InMemoryPersistenceService;
use weftrun::transaction::LocalTransactionCoordinator;
use weftrun::{WorkflowEvent, WorkflowEventArgs, WorkflowObserver};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Observer that records every lifecycle event for later assertions.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<WorkflowEventArgs>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<WorkflowEvent> {
        self.events.lock().iter().map(|a| a.event).collect()
    }

    pub fn count(&self, event: WorkflowEvent) -> usize {
        self.kinds().iter().filter(|e| **e == event).count()
    }

    pub fn info_of_first(&self, event: WorkflowEvent) -> Option<String> {
        self.events
            .lock()
            .iter()
            .find(|a| a.event == event)
            .and_then(|a| a.info.clone())
    }

    /// Assert `earlier` occurs before `later` (both must be present).
    pub fn assert_order(&self, earlier: WorkflowEvent, later: WorkflowEvent) {
        let kinds = self.kinds();
        let e = kinds
            .iter()
            .position(|k| *k == earlier)
            .unwrap_or_else(|| panic!("event {earlier} never fired"));
        let l = kinds
            .iter()
            .position(|k| *k == later)
            .unwrap_or_else(|| panic!("event {later} never fired"));
        assert!(e < l, "{earlier} (index {e}) should precede {later} (index {l})");
    }
}

impl WorkflowObserver for EventLog {
    fn on_event(&self, args: &WorkflowEventArgs) {
        self.events.lock().push(args.clone());
    }
}

/// One deterministic host: manual thread pumping, in-memory persistence,
/// local transactions, a recording observer.
pub struct TestHost {
    pub pump: Arc<ManualSchedulerService>,
    pub store: Arc<InMemoryPersistenceService>,
    pub coord: Arc<LocalTransactionCoordinator>,
    pub log: Arc<EventLog>,
}

impl TestHost {
    pub fn new() -> Self {
        init_tracing();
        Self {
            pump: Arc::new(ManualSchedulerService::new()),
            store: Arc::new(InMemoryPersistenceService::new()),
            coord: Arc::new(LocalTransactionCoordinator::new()),
            log: EventLog::new(),
        }
    }

    pub fn services(&self) -> WorkflowServices {
        WorkflowServices {
            scheduler: self.pump.clone(),
            persistence: self.store.clone(),
            transactions: self.coord.clone(),
        }
    }

    pub fn spawn(&self, tree: ActivityTree) -> Arc<WorkflowExecutor> {
        WorkflowExecutor::initialize(Uuid::new_v4(), tree, self.services(), vec![self.log.clone()])
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
