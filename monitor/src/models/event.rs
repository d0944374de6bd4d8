//! Events published by the monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::request::{DeploymentRequest, RequestStatus};

/// A request changed status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStatusChangedEvent {
    pub request_id: i64,
    pub environment_name: String,
    pub new_status: RequestStatus,
    pub user_name: String,
    pub occurred_at: DateTime<Utc>,
}

impl RequestStatusChangedEvent {
    /// Build the event for a request moving to `new_status`
    pub fn for_request(request: &DeploymentRequest, new_status: RequestStatus) -> Self {
        Self {
            request_id: request.id,
            environment_name: request.environment_name.clone(),
            new_status,
            user_name: request.user_name.clone(),
            occurred_at: Utc::now(),
        }
    }
}
