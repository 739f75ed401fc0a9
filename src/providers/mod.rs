//! Persistence seam.
//!
//! The executor persists one [`InstanceSnapshot`] per instance at persistence
//! points (idle, suspend, completion, explicit unload) and reloads it when an
//! unloaded instance is touched again. Providers report failures through
//! [`PersistenceError`] with a retry classification; the executor restores
//! the pre-attempt in-memory status before surfacing any save failure.

mod error;
pub mod in_memory;

pub use error::PersistenceError;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::{ActivityTree, CompletedContext};
use crate::queuing::QueuingSnapshot;
use crate::WorkflowStatus;

/// Everything needed to rehydrate one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: Uuid,
    pub status: WorkflowStatus,
    /// Reason string carried by a pending suspend or terminate request.
    pub suspend_or_terminate_info: Option<String>,
    /// True when the instance was persisted idle, waiting on queue arrivals.
    pub is_blocked: bool,
    pub tree: Option<ActivityTree>,
    pub queue_state: QueuingSnapshot,
}

/// Host-pluggable persistence provider.
pub trait PersistenceService: Send + Sync {
    /// Save the instance snapshot. When `unlock` is set the provider also
    /// releases its ownership lock in the same operation (unload path).
    fn save_instance_state(
        &self,
        snapshot: &InstanceSnapshot,
        unlock: bool,
    ) -> Result<(), PersistenceError>;

    /// Release the ownership lock without writing state (abort path).
    fn unlock_instance_state(&self, instance_id: Uuid) -> Result<(), PersistenceError>;

    /// Load and lock the instance snapshot.
    fn load_instance_state(&self, instance_id: Uuid) -> Result<InstanceSnapshot, PersistenceError>;

    /// Save a completed activity context for later compensation.
    fn save_completed_context(
        &self,
        instance_id: Uuid,
        context: &CompletedContext,
    ) -> Result<(), PersistenceError>;

    /// Load a previously saved completed context.
    fn load_completed_context(
        &self,
        instance_id: Uuid,
        context_id: u32,
    ) -> Result<CompletedContext, PersistenceError>;

    /// Whether the host wants the instance unloaded after persisting idle.
    fn unload_on_idle(&self, snapshot: &InstanceSnapshot) -> bool {
        let _ = snapshot;
        false
    }
}
