//! In-memory persistence provider for tests and single-process hosts.
//!
//! State is stored serialized, the way a real provider would persist it, so
//! snapshot round-trips are exercised even without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use super::{InstanceSnapshot, PersistenceError, PersistenceService};
use crate::activity::CompletedContext;

struct StoredInstance {
    json: String,
    locked: bool,
}

/// Simple locked-snapshot store. Each instance slot carries an ownership
/// flag so load/unlock semantics can be exercised without a real database.
#[derive(Default)]
pub struct InMemoryPersistenceService {
    instances: Mutex<HashMap<Uuid, StoredInstance>>,
    contexts: Mutex<HashMap<(Uuid, u32), String>>,
    fail_next_save: AtomicBool,
    unload_on_idle: AtomicBool,
}

impl InMemoryPersistenceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `save_instance_state` call with a retryable error
    /// (test hook).
    pub fn fail_next_save(&self) {
        self.fail_next_save.store(true, Ordering::SeqCst);
    }

    /// Ask the executor to unload instances whenever they persist idle.
    pub fn set_unload_on_idle(&self, unload: bool) {
        self.unload_on_idle.store(unload, Ordering::SeqCst);
    }

    /// Peek at the last persisted snapshot without locking it.
    pub fn stored_snapshot(&self, instance_id: Uuid) -> Option<InstanceSnapshot> {
        self.instances
            .lock()
            .get(&instance_id)
            .and_then(|s| serde_json::from_str(&s.json).ok())
    }

    pub fn is_locked(&self, instance_id: Uuid) -> bool {
        self.instances.lock().get(&instance_id).map(|s| s.locked).unwrap_or(false)
    }
}

impl PersistenceService for InMemoryPersistenceService {
    fn save_instance_state(
        &self,
        snapshot: &InstanceSnapshot,
        unlock: bool,
    ) -> Result<(), PersistenceError> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(PersistenceError::retryable(
                "save_instance_state",
                "injected save failure",
            ));
        }
        let json = serde_json::to_string(snapshot).map_err(|e| {
            PersistenceError::permanent("save_instance_state", format!("serialization failed: {e}"))
        })?;
        let mut g = self.instances.lock();
        g.insert(
            snapshot.instance_id,
            StoredInstance {
                json,
                locked: !unlock,
            },
        );
        Ok(())
    }

    fn unlock_instance_state(&self, instance_id: Uuid) -> Result<(), PersistenceError> {
        let mut g = self.instances.lock();
        match g.get_mut(&instance_id) {
            Some(stored) => {
                stored.locked = false;
                Ok(())
            }
            // Nothing was ever saved; unlocking is a no-op.
            None => Ok(()),
        }
    }

    fn load_instance_state(&self, instance_id: Uuid) -> Result<InstanceSnapshot, PersistenceError> {
        let mut g = self.instances.lock();
        let stored = g.get_mut(&instance_id).ok_or_else(|| {
            PersistenceError::permanent(
                "load_instance_state",
                format!("instance not found: {instance_id}"),
            )
        })?;
        if stored.locked {
            return Err(PersistenceError::retryable(
                "load_instance_state",
                format!("instance is locked by another owner: {instance_id}"),
            ));
        }
        let snapshot = serde_json::from_str(&stored.json).map_err(|e| {
            PersistenceError::permanent("load_instance_state", format!("corrupt snapshot: {e}"))
        })?;
        stored.locked = true;
        Ok(snapshot)
    }

    fn save_completed_context(
        &self,
        instance_id: Uuid,
        context: &CompletedContext,
    ) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(context).map_err(|e| {
            PersistenceError::permanent(
                "save_completed_context",
                format!("serialization failed: {e}"),
            )
        })?;
        self.contexts
            .lock()
            .insert((instance_id, context.context_id), json);
        Ok(())
    }

    fn load_completed_context(
        &self,
        instance_id: Uuid,
        context_id: u32,
    ) -> Result<CompletedContext, PersistenceError> {
        let g = self.contexts.lock();
        let json = g.get(&(instance_id, context_id)).ok_or_else(|| {
            PersistenceError::permanent(
                "load_completed_context",
                format!("completed context not found: {instance_id}/{context_id}"),
            )
        })?;
        serde_json::from_str(json).map_err(|e| {
            PersistenceError::permanent("load_completed_context", format!("corrupt context: {e}"))
        })
    }

    fn unload_on_idle(&self, _snapshot: &InstanceSnapshot) -> bool {
        self.unload_on_idle.load(Ordering::SeqCst)
    }
}
