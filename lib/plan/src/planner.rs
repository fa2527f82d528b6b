//! The DAG Planner: plan validation and level computation.
//!
//! Grounded on the petgraph-based graph construction in the workflow
//! engine this crate descends from, simplified to plain node-ID edges (no
//! port-schema compatibility — plans here carry no port system).

use crate::error::PlanError;
use crate::node::NodeId;
use crate::plan::Plan;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet, VecDeque};

/// Stateless entry point for plan validation and level computation.
pub struct Planner;

impl Planner {
    /// Validates a plan: node-ID uniqueness, edge endpoint existence,
    /// absence of self-loops, and acyclicity.
    ///
    /// # Errors
    ///
    /// Returns the first [`PlanError`] found.
    pub fn validate(plan: &Plan) -> Result<(), PlanError> {
        let (graph, index) = build_graph(plan)?;
        if petgraph::algo::is_cyclic_directed(&graph) {
            let residual = index.keys().cloned().collect();
            return Err(PlanError::Cycle(residual));
        }
        Ok(())
    }

    /// Computes topological levels via Kahn's algorithm: O(V+E).
    ///
    /// Each level is the set of nodes whose predecessors are all in earlier
    /// levels; nodes within a level are independent and may execute in
    /// parallel. Ties within a level are broken by the plan's node
    /// declaration order.
    ///
    /// An empty plan yields `[]`. A plan with nodes but no edges yields a
    /// single level containing every node.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] naming every node left in the residual
    /// graph if a cycle prevents full levelization, or any structural error
    /// [`Planner::validate`] would report.
    pub fn levels(plan: &Plan) -> Result<Vec<Vec<NodeId>>, PlanError> {
        let (graph, index) = build_graph(plan)?;

        let declaration_order: HashMap<&NodeId, usize> = plan
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (&n.id, i))
            .collect();

        let mut in_degree: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|idx| (idx, graph.edges_directed(idx, Direction::Incoming).count()))
            .collect();

        let mut remaining: HashSet<NodeIndex> = graph.node_indices().collect();
        let mut levels = Vec::new();

        loop {
            let mut ready: Vec<NodeIndex> = remaining
                .iter()
                .copied()
                .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) == 0)
                .collect();
            if ready.is_empty() {
                break;
            }
            ready.sort_by_key(|idx| declaration_order.get(&graph[*idx]).copied().unwrap_or(0));

            for idx in &ready {
                remaining.remove(idx);
                for succ in graph.neighbors_directed(*idx, Direction::Outgoing) {
                    if let Some(d) = in_degree.get_mut(&succ) {
                        *d = d.saturating_sub(1);
                    }
                }
            }

            levels.push(ready.into_iter().map(|idx| graph[idx].clone()).collect());
        }

        if !remaining.is_empty() {
            let mut residual: Vec<NodeId> = remaining.into_iter().map(|idx| graph[idx].clone()).collect();
            residual.sort_by_key(|id| declaration_order.get(id).copied().unwrap_or(usize::MAX));
            return Err(PlanError::Cycle(residual));
        }

        Ok(levels)
    }
}

fn build_graph(plan: &Plan) -> Result<(DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>), PlanError> {
    let mut graph = DiGraph::new();
    let mut index = HashMap::new();

    for node in &plan.nodes {
        if index.contains_key(&node.id) {
            return Err(PlanError::DuplicateNodeId(node.id.clone()));
        }
        let idx = graph.add_node(node.id.clone());
        index.insert(node.id.clone(), idx);
    }

    for (from, to) in &plan.edges {
        if from == to {
            return Err(PlanError::SelfLoop(from.clone()));
        }
        let from_idx = *index
            .get(from)
            .ok_or_else(|| PlanError::UnknownEdgeEndpoint {
                from: from.clone(),
                to: to.clone(),
            })?;
        let to_idx = *index
            .get(to)
            .ok_or_else(|| PlanError::UnknownEdgeEndpoint {
                from: from.clone(),
                to: to.clone(),
            })?;
        graph.add_edge(from_idx, to_idx, ());
    }

    Ok((graph, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeSpec;

    fn plan(node_ids: &[&str], edges: &[(&str, &str)]) -> Plan {
        Plan::new(
            node_ids.iter().map(|id| NodeSpec::agent(*id, "x")).collect(),
            edges
                .iter()
                .map(|(a, b)| (NodeId::new(*a), NodeId::new(*b)))
                .collect(),
        )
    }

    #[test]
    fn empty_plan_has_no_levels() {
        let p = plan(&[], &[]);
        assert_eq!(Planner::levels(&p).unwrap(), Vec::<Vec<NodeId>>::new());
    }

    #[test]
    fn nodes_without_edges_are_one_level() {
        let p = plan(&["a", "b", "c"], &[]);
        let levels = Planner::levels(&p).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 3);
    }

    #[test]
    fn linear_plan_levels_in_order() {
        let p = plan(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let levels = Planner::levels(&p).unwrap();
        assert_eq!(
            levels,
            vec![
                vec![NodeId::new("a")],
                vec![NodeId::new("b")],
                vec![NodeId::new("c")],
            ]
        );
    }

    #[test]
    fn diamond_levels() {
        let p = plan(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let levels = Planner::levels(&p).unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec![NodeId::new("a")]);
        assert_eq!(levels[1], vec![NodeId::new("b"), NodeId::new("c")]);
        assert_eq!(levels[2], vec![NodeId::new("d")]);
    }

    #[test]
    fn disconnected_subgraphs_both_progress() {
        let p = plan(&["a", "b", "c", "d"], &[("a", "b"), ("c", "d")]);
        let levels = Planner::levels(&p).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], vec![NodeId::new("a"), NodeId::new("c")]);
        assert_eq!(levels[1], vec![NodeId::new("b"), NodeId::new("d")]);
    }

    #[test]
    fn cycle_is_rejected_naming_residual_nodes() {
        let p = plan(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let err = Planner::levels(&p).unwrap_err();
        match err {
            PlanError::Cycle(nodes) => {
                assert_eq!(nodes.len(), 2);
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_rejected() {
        let p = plan(&["a"], &[("a", "a")]);
        assert_eq!(
            Planner::validate(&p).unwrap_err(),
            PlanError::SelfLoop(NodeId::new("a"))
        );
    }

    #[test]
    fn duplicate_node_id_rejected() {
        let p = plan(&["a", "a"], &[]);
        assert!(matches!(
            Planner::validate(&p),
            Err(PlanError::DuplicateNodeId(_))
        ));
    }

    #[test]
    fn unknown_edge_endpoint_rejected() {
        let p = plan(&["a"], &[("a", "ghost")]);
        assert!(matches!(
            Planner::validate(&p),
            Err(PlanError::UnknownEdgeEndpoint { .. })
        ));
    }

    #[test]
    fn valid_acyclic_plan_passes_validate() {
        let p = plan(&["a", "b"], &[("a", "b")]);
        assert!(Planner::validate(&p).is_ok());
    }
}
