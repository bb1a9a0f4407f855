//! Plan graph: an arena of [`PlanNode`]s indexed by composite scope key.
//!
//! Edges are indices into the arena. A node's key encodes the scope it was
//! visited under, so one object can appear as several nodes (one per scope)
//! while repeated visits under the same scope share a node.

use std::collections::HashMap;
use std::fmt;

use fleet_core::{ObjectClass, ObjectId};
use fleet_renderer::TemplateContext;

/// Index of a node inside a [`PlanGraph`].
pub type NodeIndex = usize;

/// Key of the synthetic root node.
pub const ROOT_KEY: &str = "root";

/// Composite scope key, e.g. `10001.10004.10007`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn root() -> Self {
        Self(ROOT_KEY.to_string())
    }

    /// Join a scope path of ids with `.`.
    pub fn from_path(path: &[ObjectId]) -> Self {
        let parts: Vec<String> = path.iter().map(ObjectId::to_string).collect();
        Self(parts.join("."))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One scheduling vertex.
#[derive(Debug, Clone)]
pub struct PlanNode {
    pub key: NodeKey,
    /// `None` only for a synthetic root when the store has no root object.
    pub object: Option<ObjectId>,
    pub class: ObjectClass,
    /// Owning host; `None` for the root node.
    pub host: Option<ObjectId>,
    /// Successors: nodes that must run after this one.
    pub next: Vec<NodeIndex>,
    pub variables: TemplateContext,
}

impl PlanNode {
    pub fn class_order(&self) -> u32 {
        self.class.class_order()
    }
}

/// Arena of plan nodes with a key index.
#[derive(Debug, Clone)]
pub struct PlanGraph {
    nodes: Vec<PlanNode>,
    by_key: HashMap<NodeKey, NodeIndex>,
    root: NodeIndex,
}

impl PlanGraph {
    /// A graph holding only the synthetic root.
    pub fn new(root_object: Option<ObjectId>, root_variables: TemplateContext) -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            by_key: HashMap::new(),
            root: 0,
        };
        graph.root = graph.insert(PlanNode {
            key: NodeKey::root(),
            object: root_object,
            class: ObjectClass::Root,
            host: None,
            next: Vec::new(),
            variables: root_variables,
        });
        graph
    }

    pub fn root(&self) -> NodeIndex {
        self.root
    }

    /// Add a node. The caller checks [`PlanGraph::lookup`] first; inserting an
    /// existing key repoints the index at the new node.
    pub fn insert(&mut self, node: PlanNode) -> NodeIndex {
        let idx = self.nodes.len();
        self.by_key.insert(node.key.clone(), idx);
        self.nodes.push(node);
        idx
    }

    pub fn lookup(&self, key: &NodeKey) -> Option<NodeIndex> {
        self.by_key.get(key).copied()
    }

    /// Add `from -> to`, ignoring duplicates.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) {
        let next = &mut self.nodes[from].next;
        if !next.contains(&to) {
            next.push(to);
        }
    }

    pub fn node(&self, idx: NodeIndex) -> &PlanNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &PlanNode)> {
        self.nodes.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key: &str, id: i64) -> PlanNode {
        PlanNode {
            key: NodeKey(key.to_string()),
            object: Some(ObjectId(id)),
            class: ObjectClass::File,
            host: Some(ObjectId(2)),
            next: Vec::new(),
            variables: TemplateContext::new(),
        }
    }

    #[test]
    fn keys_join_path_with_dots() {
        let key = NodeKey::from_path(&[ObjectId(2), ObjectId(10_001), ObjectId(10_005)]);
        assert_eq!(key.as_str(), "2.10001.10005");
        assert_eq!(NodeKey::root().to_string(), "root");
    }

    #[test]
    fn edges_are_deduplicated() {
        let mut graph = PlanGraph::new(Some(ObjectId(1)), TemplateContext::new());
        let a = graph.insert(node("2.3", 3));
        graph.add_edge(graph.root(), a);
        graph.add_edge(graph.root(), a);
        assert_eq!(graph.node(graph.root()).next, vec![a]);
        assert_eq!(graph.lookup(&NodeKey("2.3".into())), Some(a));
        assert_eq!(graph.len(), 2);
    }
}
