//! Node specifications within a [`crate::Plan`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A node's identifier: author-supplied, unique within its plan.
///
/// Unlike [`mentatlab_core::RunId`], node IDs are not generated by the
/// system — a plan's author names its own nodes (`"a"`, `"fetch"`,
/// `"summarize"`, ...), so this is a thin wrapper around `String` rather
/// than a ULID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the node ID's string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The kind of work a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Invokes an agent by ID; the Workload Executor resolves the agent to
    /// a runnable image.
    Agent,
    /// Invokes a built-in node implementation, identified by `command`.
    Builtin,
}

/// A single node's static definition within a [`crate::Plan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Unique (within the plan) identifier for this node.
    pub id: NodeId,
    /// What kind of work this node performs.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// The agent to invoke, when `node_type == Agent`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "agentID"
    )]
    pub agent_id: Option<String>,
    /// The container image to run, for container-job execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// The command/argv to run within the image or in-process adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Environment variables passed to the workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    /// Maximum retry attempts after the first failure. Falls back to the
    /// scheduler's configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Initial backoff, in seconds, before the first retry. Falls back to
    /// the scheduler's configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_seconds: Option<u64>,
}

impl NodeSpec {
    /// Creates a minimal agent node.
    #[must_use]
    pub fn agent(id: impl Into<NodeId>, agent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: NodeType::Agent,
            agent_id: Some(agent_id.into()),
            image: None,
            command: None,
            env: None,
            max_retries: None,
            backoff_seconds: None,
        }
    }

    /// Creates a minimal builtin node.
    #[must_use]
    pub fn builtin(id: impl Into<NodeId>, command: Vec<String>) -> Self {
        Self {
            id: id.into(),
            node_type: NodeType::Builtin,
            agent_id: None,
            image: None,
            command: Some(command),
            env: None,
            max_retries: None,
            backoff_seconds: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display() {
        let id = NodeId::new("a");
        assert_eq!(id.to_string(), "a");
    }

    #[test]
    fn node_spec_serde_roundtrip() {
        let node = NodeSpec::agent("a", "summarizer");
        let json = serde_json::to_string(&node).expect("serialize");
        let parsed: NodeSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(node, parsed);
    }

    #[test]
    fn node_spec_omits_absent_optional_fields() {
        let node = NodeSpec::agent("a", "summarizer");
        let json = serde_json::to_value(&node).expect("to_value");
        assert!(json.get("image").is_none());
        assert!(json.get("maxRetries").is_none());
    }
}
