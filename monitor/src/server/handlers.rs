//! HTTP request handlers

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::server::state::ServerState;
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deploymon".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Monitor status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub instance_id: String,
    pub is_prod: bool,
    pub ha_enabled: bool,
    pub started_at: DateTime<Utc>,

    /// Requests executing on this instance
    pub in_flight: Vec<i64>,

    /// Environment lock keys currently backed off
    pub backed_off: Vec<String>,
}

/// Status handler
pub async fn status_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(StatusResponse {
        instance_id: state.instance_id.clone(),
        is_prod: state.is_prod,
        ha_enabled: state.processor.is_ha_enabled(),
        started_at: state.started_at,
        in_flight: state.sources.ids(),
        backed_off: state.processor.backoff().active_keys(),
    })
}
