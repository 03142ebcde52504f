//! Shared environment tree
//!
//! The environment is the host structure resources attach nodes into. The
//! coordinator only ever touches it through the four operations of
//! [`Environment`], and only from inside a [`MutationGuard`].

pub mod guard;

pub use guard::{AttachOutcome, MutationGuard};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A node resources can attach into the environment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentNode {
    /// Logical identity; at most one node per id lives in the tree
    pub id: String,
    /// Free-form node type, e.g. "container" or "canvas"
    #[serde(default)]
    pub kind: String,
    /// Resource that produced the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl EnvironmentNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: String::new(),
            owner: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Host capability over the shared tree.
///
/// Implementations perform the raw operation with no validation; cycle and
/// duplicate protection is the guard's job.
pub trait Environment: Send + Sync {
    fn get_parent(&self, id: &str) -> Option<String>;
    fn attach(&mut self, parent: &str, child: EnvironmentNode);
    /// Remove a node and everything below it
    fn detach(&mut self, id: &str) -> Option<EnvironmentNode>;
    fn find_by_id(&self, id: &str) -> Option<EnvironmentNode>;
}

struct NodeRecord {
    node: EnvironmentNode,
    parent: Option<String>,
    children: Vec<String>,
}

/// Environment kept entirely in memory, rooted at a single node
pub struct InMemoryEnvironment {
    root: String,
    nodes: HashMap<String, NodeRecord>,
}

impl InMemoryEnvironment {
    pub const DEFAULT_ROOT: &'static str = "root";

    pub fn new() -> Self {
        Self::with_root(Self::DEFAULT_ROOT)
    }

    pub fn with_root(root: impl Into<String>) -> Self {
        let root = root.into();
        let mut nodes = HashMap::new();
        nodes.insert(
            root.clone(),
            NodeRecord {
                node: EnvironmentNode::new(root.clone()).with_kind("root"),
                parent: None,
                children: Vec::new(),
            },
        );
        Self { root, nodes }
    }

    pub fn root_id(&self) -> &str {
        &self.root
    }

    pub fn children(&self, id: &str) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|record| record.children.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for InMemoryEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for InMemoryEnvironment {
    fn get_parent(&self, id: &str) -> Option<String> {
        self.nodes.get(id).and_then(|record| record.parent.clone())
    }

    fn attach(&mut self, parent: &str, child: EnvironmentNode) {
        if self.nodes.contains_key(&child.id) {
            self.detach(&child.id);
        }
        let Some(parent_record) = self.nodes.get_mut(parent) else {
            return;
        };
        parent_record.children.push(child.id.clone());
        self.nodes.insert(
            child.id.clone(),
            NodeRecord {
                node: child,
                parent: Some(parent.to_string()),
                children: Vec::new(),
            },
        );
    }

    fn detach(&mut self, id: &str) -> Option<EnvironmentNode> {
        if id == self.root {
            return None;
        }
        let record = self.nodes.remove(id)?;
        if let Some(parent) = record.parent.as_deref().and_then(|p| self.nodes.get_mut(p)) {
            parent.children.retain(|c| c != id);
        }

        let mut stack = record.children;
        while let Some(next) = stack.pop() {
            if let Some(removed) = self.nodes.remove(&next) {
                stack.extend(removed.children);
            }
        }
        Some(record.node)
    }

    fn find_by_id(&self, id: &str) -> Option<EnvironmentNode> {
        self.nodes.get(id).map(|record| record.node.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_find() {
        let mut env = InMemoryEnvironment::new();
        env.attach("root", EnvironmentNode::new("panel").with_kind("container"));

        assert_eq!(env.get_parent("panel").as_deref(), Some("root"));
        assert_eq!(env.find_by_id("panel").unwrap().kind, "container");
        assert_eq!(env.children("root"), vec!["panel".to_string()]);
    }

    #[test]
    fn test_detach_removes_subtree() {
        let mut env = InMemoryEnvironment::new();
        env.attach("root", EnvironmentNode::new("a"));
        env.attach("a", EnvironmentNode::new("b"));
        env.attach("b", EnvironmentNode::new("c"));

        assert!(env.detach("a").is_some());
        assert!(env.find_by_id("b").is_none());
        assert!(env.find_by_id("c").is_none());
        assert!(env.children("root").is_empty());
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_root_cannot_be_detached() {
        let mut env = InMemoryEnvironment::with_root("body");
        assert!(env.detach("body").is_none());
        assert_eq!(env.root_id(), "body");
    }

    #[test]
    fn test_attach_under_missing_parent_is_ignored() {
        let mut env = InMemoryEnvironment::new();
        env.attach("ghost", EnvironmentNode::new("a"));
        assert!(env.find_by_id("a").is_none());
    }
}
