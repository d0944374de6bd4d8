//! Per-component deployment results

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::request::ComponentSpec;

/// Result status of one component within a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Running,
    WaitingConfirmation,
    Confirmed,
    Cancelled,
    Completed,
    Failed,
}

impl ResultStatus {
    /// Whether the component still has to run
    pub fn is_runnable(&self) -> bool {
        matches!(self, ResultStatus::Pending | ResultStatus::Confirmed)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultStatus::Pending => "pending",
            ResultStatus::Running => "running",
            ResultStatus::WaitingConfirmation => "waiting_confirmation",
            ResultStatus::Confirmed => "confirmed",
            ResultStatus::Cancelled => "cancelled",
            ResultStatus::Completed => "completed",
            ResultStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Recorded outcome of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentResult {
    /// Row id
    pub id: i64,

    /// Parent request
    pub request_id: i64,

    /// Component identity
    pub component_id: String,

    pub component_name: String,

    pub status: ResultStatus,

    /// Process exit code once the script ran
    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Log fragment
    #[serde(default)]
    pub log: Option<String>,
}

impl DeploymentResult {
    /// Fresh pending result for a component
    pub fn pending(id: i64, request_id: i64, component: &ComponentSpec) -> Self {
        Self {
            id,
            request_id,
            component_id: component.id.clone(),
            component_name: component.name.clone(),
            status: ResultStatus::Pending,
            exit_code: None,
            log: None,
        }
    }
}
