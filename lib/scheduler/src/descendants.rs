//! Downstream-of-failure reachability over a [`mentatlab_plan::Plan`]'s
//! edges.
//!
//! Grounded on the workflow engine's `RemainingWorkGraph::blocked_nodes`:
//! a failed node blocks everything reachable from it, computed by BFS over
//! outgoing edges rather than by incrementally rebuilding the whole graph,
//! since the scheduler already has the plan's edge list in hand.

use mentatlab_plan::{NodeId, Plan};
use std::collections::{HashSet, VecDeque};

/// Returns every node transitively reachable from `failed` by following
/// the plan's edges — the set that must never be dispatched once `failed`
/// has exhausted its retries.
#[must_use]
pub fn descendants_of(plan: &Plan, failed: &NodeId) -> Vec<NodeId> {
    let mut adjacency: std::collections::HashMap<&NodeId, Vec<&NodeId>> = std::collections::HashMap::new();
    for (from, to) in &plan.edges {
        adjacency.entry(from).or_default().push(to);
    }

    let mut visited: HashSet<&NodeId> = HashSet::new();
    let mut queue: VecDeque<&NodeId> = VecDeque::new();
    queue.push_back(failed);

    while let Some(current) = queue.pop_front() {
        if let Some(successors) = adjacency.get(current) {
            for next in successors {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }

    visited.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mentatlab_plan::NodeSpec;

    fn plan(node_ids: &[&str], edges: &[(&str, &str)]) -> Plan {
        Plan::new(
            node_ids.iter().map(|id| NodeSpec::agent(*id, "x")).collect(),
            edges.iter().map(|(a, b)| (NodeId::new(*a), NodeId::new(*b))).collect(),
        )
    }

    #[test]
    fn diamond_failure_blocks_only_the_shared_sink() {
        let p = plan(&["a", "b", "c", "d"], &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        let mut descendants = descendants_of(&p, &NodeId::new("b"));
        descendants.sort();
        assert_eq!(descendants, vec![NodeId::new("d")]);
    }

    #[test]
    fn linear_failure_blocks_everything_downstream() {
        let p = plan(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let mut descendants = descendants_of(&p, &NodeId::new("a"));
        descendants.sort();
        assert_eq!(descendants, vec![NodeId::new("b"), NodeId::new("c")]);
    }

    #[test]
    fn leaf_failure_has_no_descendants() {
        let p = plan(&["a", "b"], &[("a", "b")]);
        assert!(descendants_of(&p, &NodeId::new("b")).is_empty());
    }

    #[test]
    fn unrelated_branch_is_unaffected() {
        let p = plan(&["a", "b", "c", "d"], &[("a", "b"), ("c", "d")]);
        assert!(descendants_of(&p, &NodeId::new("a")) == vec![NodeId::new("b")]);
        assert!(descendants_of(&p, &NodeId::new("c")) == vec![NodeId::new("d")]);
    }
}
