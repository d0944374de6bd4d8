//! Deployment request models

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Submitted, waiting for a monitor to pick it up
    Pending,

    /// Claimed by a monitor and executing
    Running,

    /// All components completed
    Completed,

    /// All enabled components completed, some were skipped
    CompletedWithDisabledSteps,

    /// A component failed
    Failed,

    /// Execution paused before a component that needs a human confirmation
    WaitingConfirmation,

    /// Confirmation given, waiting for a monitor to resume execution
    Confirmed,

    /// Cancellation requested
    Cancelling,

    /// Cancellation applied
    Cancelled,

    /// Restart requested
    Restarting,
}

impl RequestStatus {
    /// Statuses picked up by the execution pass
    pub const EXECUTABLE: [RequestStatus; 3] = [
        RequestStatus::Pending,
        RequestStatus::Running,
        RequestStatus::Confirmed,
    ];

    /// Whether the request is still being worked on
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RequestStatus::Pending
                | RequestStatus::Running
                | RequestStatus::WaitingConfirmation
                | RequestStatus::Confirmed
        )
    }

    /// Whether the request reached an outcome
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::CompletedWithDisabledSteps
                | RequestStatus::Failed
                | RequestStatus::Cancelled
        )
    }

    /// Check whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        match (self, next) {
            // Execution
            (RequestStatus::Pending, RequestStatus::Running) => true,
            (
                RequestStatus::Running,
                RequestStatus::Completed
                | RequestStatus::CompletedWithDisabledSteps
                | RequestStatus::Failed
                | RequestStatus::WaitingConfirmation,
            ) => true,

            // Confirmation
            (RequestStatus::WaitingConfirmation, RequestStatus::Confirmed) => true,
            (RequestStatus::Confirmed, RequestStatus::Running) => true,

            // Cancellation
            (from, RequestStatus::Cancelling) => from.is_active(),
            (RequestStatus::Cancelling, RequestStatus::Cancelled) => true,

            // Restart
            (from, RequestStatus::Restarting) => from.is_terminal(),
            (RequestStatus::Restarting, RequestStatus::Pending) => true,

            _ => false,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Running => "running",
            RequestStatus::Completed => "completed",
            RequestStatus::CompletedWithDisabledSteps => "completed_with_disabled_steps",
            RequestStatus::Failed => "failed",
            RequestStatus::WaitingConfirmation => "waiting_confirmation",
            RequestStatus::Confirmed => "confirmed",
            RequestStatus::Cancelling => "cancelling",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// How to launch the script behind a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSpec {
    /// Executable to run
    pub program: String,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, defaults to the monitor's scripts directory
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Per-step timeout overriding the configured default
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// One deployable step of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Component identity
    pub id: String,

    /// Human readable name
    pub name: String,

    /// Script to run
    pub script: ScriptSpec,

    /// Pause for a confirmation before running this component
    #[serde(default)]
    pub requires_confirmation: bool,
}

/// Structured request detail
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDetail {
    /// Resolved leaf components in execution order
    #[serde(default)]
    pub components: Vec<ComponentSpec>,

    /// Component ids disabled by the user
    #[serde(default)]
    pub skip_components: Vec<String>,

    /// Property overrides exported to the scripts
    #[serde(default)]
    pub property_overrides: HashMap<String, String>,
}

impl RequestDetail {
    /// Components that will actually run, in order
    pub fn enabled_components(&self) -> Vec<ComponentSpec> {
        self.components
            .iter()
            .filter(|c| !self.skip_components.contains(&c.id))
            .cloned()
            .collect()
    }

    /// Whether any listed component was disabled
    pub fn has_disabled_steps(&self) -> bool {
        self.components
            .iter()
            .any(|c| self.skip_components.contains(&c.id))
    }
}

/// A unit of deployment work submitted by a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Request id
    pub id: i64,

    /// Target environment
    pub environment_name: String,

    /// Current status
    pub status: RequestStatus,

    /// Submitting user
    pub user_name: String,

    /// Build / version metadata
    #[serde(default)]
    pub build_version: Option<String>,

    /// Components, skips and overrides
    #[serde(default)]
    pub detail: RequestDetail,

    /// Production partition flag
    #[serde(default)]
    pub is_prod: bool,

    pub requested_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Where the execution log lives
    #[serde(default)]
    pub log_reference: Option<String>,
}

impl DeploymentRequest {
    /// Create a pending request
    pub fn new(id: i64, environment_name: &str, user_name: &str, detail: RequestDetail) -> Self {
        Self {
            id,
            environment_name: environment_name.to_string(),
            status: RequestStatus::Pending,
            user_name: user_name.to_string(),
            build_version: None,
            detail,
            is_prod: false,
            requested_at: Utc::now(),
            started_at: None,
            completed_at: None,
            log_reference: None,
        }
    }

    /// Lock resource key of the request's environment
    pub fn resource_key(&self) -> String {
        environment_resource_key(&self.environment_name)
    }
}

/// Lock resource key for an environment
pub fn environment_resource_key(environment_name: &str) -> String {
    format!("env:{}", environment_name)
}
