//! Server state

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::processor::sources::CancellationSources;
use crate::processor::DeploymentRequestStateProcessor;

/// Server state shared across handlers
pub struct ServerState {
    pub instance_id: String,
    pub is_prod: bool,
    pub started_at: DateTime<Utc>,
    pub processor: Arc<DeploymentRequestStateProcessor>,
    pub sources: CancellationSources,
}

impl ServerState {
    pub fn new(
        instance_id: String,
        is_prod: bool,
        started_at: DateTime<Utc>,
        processor: Arc<DeploymentRequestStateProcessor>,
        sources: CancellationSources,
    ) -> Self {
        Self {
            instance_id,
            is_prod,
            started_at,
            processor,
            sources,
        }
    }
}
