//! The `Plan`: a DAG of [`NodeSpec`]s submitted for execution.

use crate::node::{NodeId, NodeSpec};
use serde::{Deserialize, Serialize};

/// A declarative execution plan: an acyclic graph of node specifications.
///
/// `nodes` is kept in stable declaration order — this is *not* execution
/// order, only the order used to serialize the plan and to break ties
/// between nodes at the same topological level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Nodes, in declaration order.
    pub nodes: Vec<NodeSpec>,
    /// Directed edges `(from, to)` between node IDs declared above.
    #[serde(default)]
    pub edges: Vec<(NodeId, NodeId)>,
}

impl Plan {
    /// Creates a plan from nodes and edges, performing no validation.
    ///
    /// Use [`crate::Planner::validate`] before scheduling a plan built this
    /// way.
    #[must_use]
    pub fn new(nodes: Vec<NodeSpec>, edges: Vec<(NodeId, NodeId)>) -> Self {
        Self { nodes, edges }
    }

    /// Returns the node with the given ID, if present.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Returns true if the plan declares no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeSpec;

    #[test]
    fn plan_serde_roundtrip() {
        let plan = Plan::new(
            vec![NodeSpec::agent("a", "x"), NodeSpec::agent("b", "y")],
            vec![(NodeId::new("a"), NodeId::new("b"))],
        );
        let json = serde_json::to_string(&plan).expect("serialize");
        let parsed: Plan = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(plan, parsed);
    }

    #[test]
    fn empty_plan_has_no_nodes() {
        let plan = Plan::new(vec![], vec![]);
        assert!(plan.is_empty());
    }

    #[test]
    fn node_lookup_by_id() {
        let plan = Plan::new(vec![NodeSpec::agent("a", "x")], vec![]);
        assert!(plan.node(&NodeId::new("a")).is_some());
        assert!(plan.node(&NodeId::new("missing")).is_none());
    }
}
