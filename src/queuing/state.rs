//! Per-queue state and the persisted snapshot shapes.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A delivered unit: opaque string payload with a service-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub payload: String,
}

/// Subscriber notified when a message arrives on a queue.
///
/// Synchronous listeners run inline at enqueue (outside the queue-service
/// lock); asynchronous listeners are deferred onto a pending-notification
/// buffer drained by the executor strictly outside any lock.
pub trait QueueListener: Send + Sync {
    fn on_message(&self, queue: &str, message: &Message);
}

#[derive(Clone)]
pub(crate) struct QueueState {
    pub name: String,
    pub messages: VecDeque<Message>,
    pub sync_listeners: Vec<Arc<dyn QueueListener>>,
    pub async_listeners: Vec<Arc<dyn QueueListener>>,
    pub enabled: bool,
    pub transactional: bool,
    /// Shadowed by the open atomic region; direct root access forbidden.
    pub dirty: bool,
}

impl QueueState {
    pub(crate) fn new(name: impl Into<String>, transactional: bool) -> Self {
        Self {
            name: name.into(),
            messages: VecDeque::new(),
            sync_listeners: Vec::new(),
            async_listeners: Vec::new(),
            enabled: true,
            transactional,
            dirty: false,
        }
    }
}

impl std::fmt::Debug for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueState")
            .field("name", &self.name)
            .field("messages", &self.messages.len())
            .field("enabled", &self.enabled)
            .field("transactional", &self.transactional)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Serializable view of one queue, as handed to the persistence provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub messages: Vec<Message>,
    pub enabled: bool,
    pub transactional: bool,
}

/// Serializable view of the whole queuing service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuingSnapshot {
    pub queues: Vec<QueueSnapshot>,
    pub pending: Vec<Message>,
}

impl QueueState {
    pub(crate) fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            name: self.name.clone(),
            messages: self.messages.iter().cloned().collect(),
            enabled: self.enabled,
            transactional: self.transactional,
        }
    }

    pub(crate) fn from_snapshot(snap: &QueueSnapshot) -> Self {
        Self {
            name: snap.name.clone(),
            messages: snap.messages.iter().cloned().collect(),
            sync_listeners: Vec::new(),
            async_listeners: Vec::new(),
            enabled: snap.enabled,
            transactional: snap.transactional,
            dirty: false,
        }
    }
}
