//! Transactional queuing service.
//!
//! The root service owns the authoritative map of named queues plus one
//! pending bucket for zombie messages (deleted queues, terminated
//! instances). Each open atomic region gets a private
//! [`LocalQueuingService`]: operations on a transactional queue are served
//! from a copy created on first touch within the region, while the root's
//! entry is marked dirty for the region's duration. Commit merges the local
//! view back over the root; rollback discards it.
//!
//! Listener callbacks never run while the service lock is held: synchronous
//! listeners are invoked inline after the lock drops, asynchronous ones are
//! deferred onto a pending-notification buffer drained by the executor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{EngineError, QueueError};

pub mod state;

pub use state::{Message, QueueListener, QueueSnapshot, QueuingSnapshot};
use state::QueueState;

/// A deferred asynchronous delivery; drained and delivered outside any lock.
pub struct QueueNotification {
    pub queue: String,
    pub message: Message,
    listener: Arc<dyn QueueListener>,
}

impl QueueNotification {
    pub fn deliver(self) {
        self.listener.on_message(&self.queue, &self.message);
    }
}

impl std::fmt::Debug for QueueNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueNotification")
            .field("queue", &self.queue)
            .field("message", &self.message)
            .finish()
    }
}

struct RegionState {
    id: u64,
    /// Local copies of touched transactional queues.
    shadow: HashMap<String, QueueState>,
    /// Queues created inside the region (exist only on commit).
    created: HashSet<String>,
    /// Queues deleted inside the region (removed from the root on commit).
    deleted: HashSet<String>,
    /// Zombie messages produced inside the region.
    pending: VecDeque<Message>,
}

struct QueueBackup {
    pending: VecDeque<Message>,
    queues: HashMap<String, QueueState>,
}

#[derive(Default)]
struct QueuingState {
    queues: HashMap<String, QueueState>,
    pending: VecDeque<Message>,
    next_message_id: u64,
    next_region_id: u64,
    region: Option<RegionState>,
    backup: Option<QueueBackup>,
    notifications: Vec<QueueNotification>,
}

/// Root (authoritative) queuing service for one instance.
pub struct QueuingService {
    instance_id: Uuid,
    inner: Mutex<QueuingState>,
}

/// Sync listeners to invoke once the service lock has been dropped.
type InlineDeliveries = Vec<(Arc<dyn QueueListener>, String, Message)>;

impl QueuingService {
    pub fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            inner: Mutex::new(QueuingState {
                next_message_id: 1,
                next_region_id: 1,
                ..Default::default()
            }),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    // ---- root queue surface ------------------------------------------------

    pub fn create_queue(&self, name: &str, transactional: bool) -> Result<(), QueueError> {
        let mut s = self.inner.lock();
        if s.queues.contains_key(name) {
            return Err(QueueError::AlreadyExists(name.to_string()));
        }
        debug!(instance = %self.instance_id, queue = name, transactional, "creating queue");
        s.queues.insert(name.to_string(), QueueState::new(name, transactional));
        Ok(())
    }

    /// Delete a queue; any remaining messages move to the pending bucket.
    pub fn delete_queue(&self, name: &str) -> Result<(), QueueError> {
        let mut s = self.inner.lock();
        Self::check_not_dirty(&s, name)?;
        let mut q = s
            .queues
            .remove(name)
            .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
        let zombies: Vec<Message> = q.messages.drain(..).collect();
        s.pending.extend(zombies);
        Ok(())
    }

    /// Enqueue at the root. If the queue is shadowed by the open region the
    /// message is forwarded into the local snapshot immediately (live
    /// cross-boundary delivery); the root copy stays untouched.
    pub fn enqueue(&self, name: &str, payload: impl Into<String>) -> Result<u64, QueueError> {
        let mut inline: InlineDeliveries = Vec::new();
        let id = {
            let mut s = self.inner.lock();
            let id = s.next_message_id;
            s.next_message_id += 1;
            let message = Message { id, payload: payload.into() };

            let shadowed = s
                .region
                .as_ref()
                .map(|r| r.shadow.contains_key(name) && !r.deleted.contains(name))
                .unwrap_or(false);
            let state = &mut *s;
            if shadowed {
                trace!(instance = %self.instance_id, queue = name, message = id, "forwarding message into open region");
                let q = state
                    .region
                    .as_mut()
                    .unwrap()
                    .shadow
                    .get_mut(name)
                    .unwrap();
                if !q.enabled {
                    return Err(QueueError::Disabled(name.to_string()));
                }
                q.messages.push_back(message.clone());
                Self::collect_deliveries(q, name, &message, &mut inline, &mut state.notifications);
            } else {
                let q = state
                    .queues
                    .get_mut(name)
                    .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
                if q.dirty {
                    // Shadow exists but the region deleted the queue locally;
                    // direct root delivery is forbidden for the duration.
                    return Err(QueueError::Busy(name.to_string()));
                }
                if !q.enabled {
                    return Err(QueueError::Disabled(name.to_string()));
                }
                q.messages.push_back(message.clone());
                Self::collect_deliveries(q, name, &message, &mut inline, &mut state.notifications);
            }
            id
        };
        // Lock released; run synchronous subscribers inline.
        for (listener, queue, message) in inline {
            listener.on_message(&queue, &message);
        }
        Ok(id)
    }

    pub fn dequeue(&self, name: &str) -> Result<Option<Message>, QueueError> {
        let mut s = self.inner.lock();
        Self::check_not_dirty(&s, name)?;
        let q = s
            .queues
            .get_mut(name)
            .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
        Ok(q.messages.pop_front())
    }

    pub fn peek(&self, name: &str) -> Result<Option<Message>, QueueError> {
        let s = self.inner.lock();
        Self::check_not_dirty(&s, name)?;
        let q = s
            .queues
            .get(name)
            .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
        Ok(q.messages.front().cloned())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), QueueError> {
        let mut s = self.inner.lock();
        Self::check_not_dirty(&s, name)?;
        let q = s
            .queues
            .get_mut(name)
            .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
        q.enabled = enabled;
        Ok(())
    }

    pub fn subscribe_sync(&self, name: &str, listener: Arc<dyn QueueListener>) -> Result<(), QueueError> {
        let mut s = self.inner.lock();
        Self::check_not_dirty(&s, name)?;
        let q = s
            .queues
            .get_mut(name)
            .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
        q.sync_listeners.push(listener);
        Ok(())
    }

    pub fn subscribe_async(&self, name: &str, listener: Arc<dyn QueueListener>) -> Result<(), QueueError> {
        let mut s = self.inner.lock();
        Self::check_not_dirty(&s, name)?;
        let q = s
            .queues
            .get_mut(name)
            .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
        q.async_listeners.push(listener);
        Ok(())
    }

    pub fn contains_queue(&self, name: &str) -> bool {
        self.inner.lock().queues.contains_key(name)
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.inner
            .lock()
            .queues
            .get(name)
            .map(|q| q.dirty)
            .unwrap_or(false)
    }

    pub fn queue_messages(&self, name: &str) -> Result<Vec<Message>, QueueError> {
        let s = self.inner.lock();
        let q = s
            .queues
            .get(name)
            .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
        Ok(q.messages.iter().cloned().collect())
    }

    pub fn pending_messages(&self) -> Vec<Message> {
        self.inner.lock().pending.iter().cloned().collect()
    }

    /// Move every remaining queued message into the pending bucket
    /// (terminate/complete path: anything still queued is a zombie).
    pub fn move_all_messages_to_pending(&self) {
        let mut s = self.inner.lock();
        let mut zombies: Vec<Message> = Vec::new();
        for q in s.queues.values_mut() {
            zombies.extend(q.messages.drain(..));
        }
        if !zombies.is_empty() {
            debug!(instance = %self.instance_id, count = zombies.len(), "moving queued messages to pending bucket");
        }
        s.pending.extend(zombies);
    }

    /// Drain deferred asynchronous notifications. The caller delivers them
    /// outside any lock.
    pub fn drain_notifications(&self) -> Vec<QueueNotification> {
        std::mem::take(&mut self.inner.lock().notifications)
    }

    // ---- atomic-region shadow ----------------------------------------------

    /// Open the private shadow for a new atomic region. At most one region
    /// may be open per instance.
    pub fn open_region(self: &Arc<Self>) -> Result<LocalQueuingService, EngineError> {
        let mut s = self.inner.lock();
        if s.region.is_some() {
            return Err(EngineError::InvalidOperation(
                "an atomic region is already open for this instance".into(),
            ));
        }
        let id = s.next_region_id;
        s.next_region_id += 1;
        s.region = Some(RegionState {
            id,
            shadow: HashMap::new(),
            created: HashSet::new(),
            deleted: HashSet::new(),
            pending: VecDeque::new(),
        });
        debug!(instance = %self.instance_id, region = id, "opened local queuing region");
        Ok(LocalQueuingService {
            root: Arc::clone(self),
            region_id: id,
        })
    }

    /// Commit (`success == true`) or roll back the open region.
    fn complete_region(&self, region_id: u64, success: bool) -> Result<(), EngineError> {
        let mut s = self.inner.lock();
        let region = match s.region.take() {
            Some(r) if r.id == region_id => r,
            Some(r) => {
                s.region = Some(r);
                return Err(EngineError::InvalidOperation(
                    "local queuing service does not own the open region".into(),
                ));
            }
            None => {
                return Err(EngineError::InvalidOperation(
                    "no atomic region is open for this instance".into(),
                ))
            }
        };
        if success {
            debug!(instance = %self.instance_id, region = region_id, "committing local queuing region");
            for name in &region.deleted {
                // The first-touch copy already routed the root copy's
                // messages through the region's pending list.
                s.queues.remove(name);
            }
            for (name, mut q) in region.shadow {
                q.dirty = false;
                s.queues.insert(name, q);
            }
            s.pending.extend(region.pending);
        } else {
            debug!(instance = %self.instance_id, region = region_id, "rolling back local queuing region");
            for name in region.shadow.keys().chain(region.deleted.iter()) {
                if let Some(q) = s.queues.get_mut(name) {
                    q.dirty = false;
                }
            }
        }
        Ok(())
    }

    /// First-touch snapshot: copy the root entry into the region's shadow
    /// and mark the root entry dirty for the region's duration.
    fn touch<'s>(
        s: &'s mut QueuingState,
        region_id: u64,
        name: &str,
    ) -> Result<&'s mut QueueState, QueueError> {
        let region_matches = s.region.as_ref().map(|r| r.id == region_id).unwrap_or(false);
        if !region_matches {
            return Err(QueueError::NotFound(name.to_string()));
        }
        {
            let region = s.region.as_ref().unwrap();
            if region.deleted.contains(name) {
                return Err(QueueError::NotFound(name.to_string()));
            }
        }
        if !s.region.as_ref().unwrap().shadow.contains_key(name) {
            let copy = {
                let root_q = s
                    .queues
                    .get_mut(name)
                    .ok_or_else(|| QueueError::NotFound(name.to_string()))?;
                root_q.dirty = true;
                let mut copy = root_q.clone();
                copy.dirty = false;
                copy
            };
            s.region.as_mut().unwrap().shadow.insert(name.to_string(), copy);
        }
        Ok(s.region.as_mut().unwrap().shadow.get_mut(name).unwrap())
    }

    fn check_not_dirty(s: &QueuingState, name: &str) -> Result<(), QueueError> {
        if let Some(q) = s.queues.get(name) {
            if q.dirty {
                return Err(QueueError::Busy(name.to_string()));
            }
        }
        Ok(())
    }

    fn is_transactional(&self, name: &str) -> Option<bool> {
        let s = self.inner.lock();
        if let Some(r) = &s.region {
            if let Some(q) = r.shadow.get(name) {
                return Some(q.transactional);
            }
        }
        s.queues.get(name).map(|q| q.transactional)
    }

    // ---- persistence reconciliation ----------------------------------------

    /// Take a full backup of the pending bucket and the queue map, then
    /// provisionally reconcile the open region's local state into the root
    /// so the persisted snapshot reflects it. The backup is restored
    /// verbatim by [`post_persist`](Self::post_persist) if the surrounding
    /// persistence attempt fails.
    pub fn pre_persist(&self) {
        let mut s = self.inner.lock();
        s.backup = Some(QueueBackup {
            pending: s.pending.clone(),
            queues: s.queues.clone(),
        });
        if let Some(region) = s.region.take() {
            for name in &region.deleted {
                s.queues.remove(name);
            }
            for (name, q) in &region.shadow {
                let mut provisional = q.clone();
                // Direct access stays forbidden while the region is open.
                provisional.dirty = true;
                s.queues.insert(name.clone(), provisional);
            }
            let provisional_pending: Vec<Message> = region.pending.iter().cloned().collect();
            s.pending.extend(provisional_pending);
            s.region = Some(region);
        }
    }

    /// Discard the pre-persist backup on success; restore it verbatim on
    /// failure.
    pub fn post_persist(&self, success: bool) {
        let mut s = self.inner.lock();
        match s.backup.take() {
            Some(backup) if !success => {
                s.pending = backup.pending;
                s.queues = backup.queues;
            }
            _ => {}
        }
    }

    /// Serializable view for the instance snapshot.
    pub fn snapshot(&self) -> QueuingSnapshot {
        let s = self.inner.lock();
        let mut queues: Vec<QueueSnapshot> = s.queues.values().map(|q| q.snapshot()).collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        QueuingSnapshot {
            queues,
            pending: s.pending.iter().cloned().collect(),
        }
    }

    /// Rebuild queue state from a persisted snapshot (reload path).
    /// Subscriptions are not persisted; hosts re-subscribe after load.
    pub fn restore(&self, snapshot: &QueuingSnapshot) {
        let mut s = self.inner.lock();
        s.queues = snapshot
            .queues
            .iter()
            .map(|q| (q.name.clone(), QueueState::from_snapshot(q)))
            .collect();
        s.pending = snapshot.pending.iter().cloned().collect();
        let max_id = snapshot
            .queues
            .iter()
            .flat_map(|q| q.messages.iter())
            .chain(snapshot.pending.iter())
            .map(|m| m.id)
            .max()
            .unwrap_or(0);
        s.next_message_id = max_id + 1;
    }

    fn collect_deliveries(
        q: &QueueState,
        name: &str,
        message: &Message,
        inline: &mut InlineDeliveries,
        deferred: &mut Vec<QueueNotification>,
    ) {
        for l in &q.sync_listeners {
            inline.push((Arc::clone(l), name.to_string(), message.clone()));
        }
        for l in &q.async_listeners {
            deferred.push(QueueNotification {
                queue: name.to_string(),
                message: message.clone(),
                listener: Arc::clone(l),
            });
        }
    }
}

/// Private queuing view scoped to one open atomic region.
///
/// Operations on transactional queues are served from the region's shadow
/// (created on first touch); operations on non-transactional queues always
/// delegate straight to the root.
pub struct LocalQueuingService {
    root: Arc<QueuingService>,
    region_id: u64,
}

impl Clone for LocalQueuingService {
    fn clone(&self) -> Self {
        Self {
            root: Arc::clone(&self.root),
            region_id: self.region_id,
        }
    }
}

impl LocalQueuingService {
    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn create_queue(&self, name: &str, transactional: bool) -> Result<(), QueueError> {
        if !transactional {
            return self.root.create_queue(name, false);
        }
        let mut s = self.root.inner.lock();
        let region_ok = s.region.as_ref().map(|r| r.id == self.region_id).unwrap_or(false);
        if !region_ok {
            return Err(QueueError::NotFound(name.to_string()));
        }
        let region = s.region.as_mut().unwrap();
        if region.deleted.remove(name) {
            // Recreated inside the region: fresh local state.
            region.shadow.insert(name.to_string(), QueueState::new(name, true));
            return Ok(());
        }
        if region.shadow.contains_key(name) || region.created.contains(name) {
            return Err(QueueError::AlreadyExists(name.to_string()));
        }
        if s.queues.contains_key(name) {
            return Err(QueueError::AlreadyExists(name.to_string()));
        }
        let region = s.region.as_mut().unwrap();
        region.created.insert(name.to_string());
        region.shadow.insert(name.to_string(), QueueState::new(name, true));
        Ok(())
    }

    pub fn delete_queue(&self, name: &str) -> Result<(), QueueError> {
        match self.root.is_transactional(name) {
            Some(false) => return self.root.delete_queue(name),
            Some(true) => {}
            None => return Err(QueueError::NotFound(name.to_string())),
        }
        let mut s = self.root.inner.lock();
        let q = QueuingService::touch(&mut s, self.region_id, name)?;
        let zombies: Vec<Message> = q.messages.drain(..).collect();
        let region = s.region.as_mut().unwrap();
        region.shadow.remove(name);
        region.pending.extend(zombies);
        if !region.created.remove(name) {
            region.deleted.insert(name.to_string());
        }
        Ok(())
    }

    pub fn enqueue(&self, name: &str, payload: impl Into<String>) -> Result<u64, QueueError> {
        match self.root.is_transactional(name) {
            Some(false) => return self.root.enqueue(name, payload),
            Some(true) => {}
            None => return Err(QueueError::NotFound(name.to_string())),
        }
        let mut inline: InlineDeliveries = Vec::new();
        let id = {
            let mut s = self.root.inner.lock();
            let id = s.next_message_id;
            s.next_message_id += 1;
            let message = Message { id, payload: payload.into() };
            let mut deferred = Vec::new();
            let q = QueuingService::touch(&mut s, self.region_id, name)?;
            if !q.enabled {
                return Err(QueueError::Disabled(name.to_string()));
            }
            q.messages.push_back(message.clone());
            QueuingService::collect_deliveries(q, name, &message, &mut inline, &mut deferred);
            s.notifications.extend(deferred);
            id
        };
        for (listener, queue, message) in inline {
            listener.on_message(&queue, &message);
        }
        Ok(id)
    }

    pub fn dequeue(&self, name: &str) -> Result<Option<Message>, QueueError> {
        match self.root.is_transactional(name) {
            Some(false) => return self.root.dequeue(name),
            Some(true) => {}
            None => return Err(QueueError::NotFound(name.to_string())),
        }
        let mut s = self.root.inner.lock();
        let q = QueuingService::touch(&mut s, self.region_id, name)?;
        Ok(q.messages.pop_front())
    }

    pub fn peek(&self, name: &str) -> Result<Option<Message>, QueueError> {
        match self.root.is_transactional(name) {
            Some(false) => return self.root.peek(name),
            Some(true) => {}
            None => return Err(QueueError::NotFound(name.to_string())),
        }
        let mut s = self.root.inner.lock();
        let q = QueuingService::touch(&mut s, self.region_id, name)?;
        Ok(q.messages.front().cloned())
    }

    pub fn subscribe_sync(&self, name: &str, listener: Arc<dyn QueueListener>) -> Result<(), QueueError> {
        match self.root.is_transactional(name) {
            Some(false) => return self.root.subscribe_sync(name, listener),
            Some(true) => {}
            None => return Err(QueueError::NotFound(name.to_string())),
        }
        let mut s = self.root.inner.lock();
        let q = QueuingService::touch(&mut s, self.region_id, name)?;
        q.sync_listeners.push(listener);
        Ok(())
    }

    pub fn subscribe_async(&self, name: &str, listener: Arc<dyn QueueListener>) -> Result<(), QueueError> {
        match self.root.is_transactional(name) {
            Some(false) => return self.root.subscribe_async(name, listener),
            Some(true) => {}
            None => return Err(QueueError::NotFound(name.to_string())),
        }
        let mut s = self.root.inner.lock();
        let q = QueuingService::touch(&mut s, self.region_id, name)?;
        q.async_listeners.push(listener);
        Ok(())
    }

    /// Messages visible inside the region for `name` (test/introspection).
    pub fn queue_messages(&self, name: &str) -> Result<Vec<Message>, QueueError> {
        match self.root.is_transactional(name) {
            Some(false) => return self.root.queue_messages(name),
            Some(true) => {}
            None => return Err(QueueError::NotFound(name.to_string())),
        }
        let mut s = self.root.inner.lock();
        let q = QueuingService::touch(&mut s, self.region_id, name)?;
        Ok(q.messages.iter().cloned().collect())
    }

    /// Reconcile the region against the root: merge on `success`, discard
    /// otherwise. Consumes the handle; the root's dirty marks clear either
    /// way.
    pub fn complete(self, success: bool) -> Result<(), EngineError> {
        self.root.complete_region(self.region_id, success)
    }
}

impl std::fmt::Debug for LocalQueuingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalQueuingService")
            .field("region_id", &self.region_id)
            .finish()
    }
}
