//! Validation errors for [`crate::Plan`].

use crate::node::NodeId;
use std::fmt;

/// Why a plan failed validation.
///
/// Plain enum, no `thiserror` derive — matches the rest of the workspace's
/// error-type style. These are all `Validation`-kind errors per the error
/// taxonomy: surfaced directly to the caller, never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Two or more nodes in the plan share the same ID.
    DuplicateNodeId(NodeId),
    /// An edge refers to a node ID that isn't in the plan.
    UnknownEdgeEndpoint {
        /// The edge's source.
        from: NodeId,
        /// The edge's target.
        to: NodeId,
    },
    /// An edge from a node to itself.
    SelfLoop(NodeId),
    /// The plan's edges form a cycle. Names every node found in the
    /// residual graph after removing all nodes reachable by repeated
    /// Kahn's-algorithm source removal.
    Cycle(Vec<NodeId>),
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNodeId(id) => write!(f, "duplicate node id: {id}"),
            Self::UnknownEdgeEndpoint { from, to } => {
                write!(f, "edge ({from} -> {to}) refers to an unknown node")
            }
            Self::SelfLoop(id) => write!(f, "self-loop on node {id}"),
            Self::Cycle(nodes) => {
                let names = nodes
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "plan contains a cycle among nodes: [{names}]")
            }
        }
    }
}

impl std::error::Error for PlanError {}
