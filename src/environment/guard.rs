//! Mutation guard
//!
//! The only legal path for attaching nodes into the shared environment.
//! Every check and the attach itself run under one lock, so an ancestry walk
//! can never race a concurrent attach or detach.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::errors::GuardError;
use crate::environment::{Environment, EnvironmentNode};

/// Result of a successful attach
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachOutcome {
    /// A stale node with the same id was removed first
    pub replaced: bool,
}

/// Lock-disciplined access to the shared environment
#[derive(Clone)]
pub struct MutationGuard {
    env: Arc<Mutex<Box<dyn Environment>>>,
}

impl MutationGuard {
    pub fn new<E: Environment + 'static>(env: E) -> Self {
        Self {
            env: Arc::new(Mutex::new(Box::new(env))),
        }
    }

    /// Attach `child` under `parent`.
    ///
    /// Rejects self-reference, unknown parents, and any attach where `child`
    /// is already an ancestor of `parent`. On rejection the environment is
    /// untouched. A live node with the child's id is replaced, never
    /// duplicated.
    pub async fn attach(
        &self,
        parent: &str,
        child: EnvironmentNode,
    ) -> Result<AttachOutcome, GuardError> {
        if parent == child.id {
            warn!(node = %child.id, "Rejected self-referencing attach");
            return Err(GuardError::SelfReference { node_id: child.id });
        }

        let mut env = self.env.lock().await;

        if env.find_by_id(parent).is_none() {
            warn!(parent = %parent, node = %child.id, "Rejected attach under unknown parent");
            return Err(GuardError::UnknownParent {
                parent: parent.to_string(),
            });
        }

        if is_ancestor(&**env, &child.id, parent) {
            warn!(parent = %parent, node = %child.id, "Rejected attach that would create a cycle");
            return Err(GuardError::Cycle {
                parent: parent.to_string(),
                child: child.id,
            });
        }

        let replaced = env.find_by_id(&child.id).is_some();
        if replaced {
            env.detach(&child.id);
            debug!(node = %child.id, "Removed stale node before re-attaching");
        }
        debug!(parent = %parent, node = %child.id, "Attached node");
        env.attach(parent, child);

        Ok(AttachOutcome { replaced })
    }

    pub async fn detach(&self, id: &str) -> Option<EnvironmentNode> {
        self.env.lock().await.detach(id)
    }

    pub async fn parent_of(&self, id: &str) -> Option<String> {
        self.env.lock().await.get_parent(id)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.env.lock().await.find_by_id(id).is_some()
    }

    /// Distance from `id` to the top of its tree
    pub async fn depth_of(&self, id: &str) -> Option<usize> {
        let env = self.env.lock().await;
        env.find_by_id(id)?;
        let mut depth = 0;
        let mut seen = HashSet::new();
        let mut current = env.get_parent(id);
        while let Some(next) = current {
            if !seen.insert(next.clone()) {
                break;
            }
            depth += 1;
            current = env.get_parent(&next);
        }
        Some(depth)
    }
}

/// Walk the parent chain upward from `start` looking for `candidate`.
/// A chain that revisits a node is already corrupt and counts as a cycle.
fn is_ancestor(env: &dyn Environment, candidate: &str, start: &str) -> bool {
    let mut seen = HashSet::new();
    let mut current = Some(start.to_string());
    while let Some(id) = current {
        if id == candidate {
            return true;
        }
        if !seen.insert(id.clone()) {
            return true;
        }
        current = env.get_parent(&id);
    }
    false
}
