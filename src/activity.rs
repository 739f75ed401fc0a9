//! Minimal activity-tree collaborator.
//!
//! The activity object model proper is the host's concern; the executor only
//! needs identity, parent/child navigation, execution status and a small
//! extension-attribute map for genuinely dynamic engine metadata. Fields are
//! explicit and typed rather than a reflective property bag.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Identifier of a node in the instance's activity tree.
pub type ActivityId = u64;

/// Execution status of one activity node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Initialized,
    Executing,
    Canceling,
    Closed,
    Compensating,
    Faulting,
}

/// Outcome recorded when an activity closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionResult {
    None,
    Succeeded,
    Canceled,
    Faulted,
}

/// One node of the executable tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub name: String,
    pub parent: Option<ActivityId>,
    pub children: Vec<ActivityId>,
    /// Numeric execution-context id: which nested context activity (e.g. a
    /// loop iteration) this node belongs to. Context 0 is the root context.
    pub context_id: u32,
    /// Whether this node opens an atomic (transactional) region when it runs.
    pub atomic: bool,
    pub status: ExecutionStatus,
    pub result: ExecutionResult,
    /// Dynamic engine metadata; kept deliberately small and string-typed.
    pub extensions: BTreeMap<String, String>,
}

impl Activity {
    fn new(id: ActivityId, name: impl Into<String>, parent: Option<ActivityId>) -> Self {
        Self {
            id,
            name: name.into(),
            parent,
            children: Vec::new(),
            context_id: 0,
            atomic: false,
            status: ExecutionStatus::Initialized,
            result: ExecutionResult::None,
            extensions: BTreeMap::new(),
        }
    }
}

/// A fully-closed nested execution context saved out at persistence points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedContext {
    pub context_id: u32,
    pub activity: Activity,
}

/// The per-instance tree of work nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityTree {
    root: ActivityId,
    next_id: ActivityId,
    nodes: HashMap<ActivityId, Activity>,
}

impl ActivityTree {
    pub fn new(root_name: impl Into<String>) -> Self {
        let root = 1;
        let mut nodes = HashMap::new();
        nodes.insert(root, Activity::new(root, root_name, None));
        Self {
            root,
            next_id: root + 1,
            nodes,
        }
    }

    pub fn root_id(&self) -> ActivityId {
        self.root
    }

    pub fn root(&self) -> &Activity {
        &self.nodes[&self.root]
    }

    pub fn get(&self, id: ActivityId) -> Option<&Activity> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: ActivityId) -> Option<&mut Activity> {
        self.nodes.get_mut(&id)
    }

    /// Add a child node under `parent`. Returns `None` if the parent does
    /// not exist.
    pub fn add_child(&mut self, parent: ActivityId, name: impl Into<String>) -> Option<ActivityId> {
        if !self.nodes.contains_key(&parent) {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        let mut node = Activity::new(id, name, Some(parent));
        node.context_id = self.nodes[&parent].context_id;
        self.nodes.insert(id, node);
        self.nodes.get_mut(&parent).unwrap().children.push(id);
        Some(id)
    }

    /// Add an atomic child: running it opens a transactional region.
    pub fn add_atomic_child(
        &mut self,
        parent: ActivityId,
        name: impl Into<String>,
    ) -> Option<ActivityId> {
        let id = self.add_child(parent, name)?;
        self.nodes.get_mut(&id).unwrap().atomic = true;
        Some(id)
    }

    /// Add a context activity (e.g. one loop iteration) with its own
    /// execution-context id.
    pub fn add_context_child(
        &mut self,
        parent: ActivityId,
        name: impl Into<String>,
        context_id: u32,
    ) -> Option<ActivityId> {
        let id = self.add_child(parent, name)?;
        self.nodes.get_mut(&id).unwrap().context_id = context_id;
        Some(id)
    }

    pub fn set_status(&mut self, id: ActivityId, status: ExecutionStatus) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.status = status;
        }
    }

    /// Close an activity with the given result.
    pub fn close(&mut self, id: ActivityId, result: ExecutionResult) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.status = ExecutionStatus::Closed;
            node.result = result;
        }
    }

    pub fn is_root_closed(&self) -> bool {
        self.root().status == ExecutionStatus::Closed
    }

    /// Whether `id` is `ancestor` itself or sits anywhere below it.
    pub fn is_descendant(&self, id: ActivityId, ancestor: ActivityId) -> bool {
        let mut current = id;
        loop {
            if current == ancestor {
                return true;
            }
            match self.get(current).and_then(|n| n.parent) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Walk up from `id` to the nearest enclosing context activity (a node
    /// whose context id differs from its parent's, or the root).
    pub fn context_activity_of(&self, id: ActivityId) -> Option<&Activity> {
        let mut current = self.get(id)?;
        loop {
            match current.parent {
                Some(parent_id) => {
                    let parent = self.get(parent_id)?;
                    if parent.context_id != current.context_id {
                        return Some(current);
                    }
                    current = parent;
                }
                None => return Some(current),
            }
        }
    }

    /// Snapshot a closed context activity for `save_completed_context`.
    pub fn completed_context(&self, id: ActivityId) -> Option<CompletedContext> {
        let node = self.get(id)?;
        if node.status != ExecutionStatus::Closed {
            return None;
        }
        Some(CompletedContext {
            context_id: node.context_id,
            activity: node.clone(),
        })
    }
}
