//! `Run` and related value types owned exclusively by the [`crate::RunStore`].

use chrono::{DateTime, Utc};
use mentatlab_core::RunId;
use mentatlab_plan::Plan;
use serde::{Deserialize, Serialize};

/// A run's lifecycle status.
///
/// `pending` on create; `running` on first node dispatch; exactly one of
/// the three terminal states thereafter. No transitions out of a terminal
/// state are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet dispatched.
    Pending,
    /// At least one node has been dispatched.
    Running,
    /// Every node reached a terminal non-failing state.
    Succeeded,
    /// A node exhausted retries and failed.
    Failed,
    /// `CancelRun` was observed before the run reached another terminal
    /// state.
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses are absorbing: `succeeded`, `failed`, `cancelled`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Cheap run metadata: everything about a run except its plan. Returned by
/// `GetRunMeta`, which avoids paying for plan (de)serialization when only
/// the status is needed (e.g. readiness polling, list views).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    /// Opaque unique identifier.
    pub id: RunId,
    /// Free-text name supplied at creation.
    pub name: String,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the first node was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Terminal failure message, set only when `status == failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The subject that created this run, stamped by the Auth hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_subject: Option<String>,
}

/// A run: its metadata plus the plan it was created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Metadata fields, flattened into the same JSON object as `plan`.
    #[serde(flatten)]
    pub meta: RunMeta,
    /// The plan this run executes.
    pub plan: Plan,
}

/// Health/identity information about the active Run Store adapter, used by
/// the readiness endpoint and `/api/v1/runstore/info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterInfo {
    /// `"memory"` or `"redis"`.
    pub adapter_type: String,
    /// Whether the adapter can currently serve requests.
    pub healthy: bool,
    /// A rough round-trip latency estimate, in milliseconds.
    pub latency_hint_ms: u64,
}
