//! Persistence contract consumed by the monitor
//!
//! Every status mutation is a conditional update that reports how many rows
//! it actually changed. That count is the only cross-instance ownership
//! signal: a caller owns the work only when its update changed something.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::MonitorError;
use crate::models::request::{ComponentSpec, DeploymentRequest, RequestStatus};
use crate::models::result::{DeploymentResult, ResultStatus};

/// Request and result storage
#[async_trait]
pub trait RequestsSource: Send + Sync {
    /// Requests whose status is any of `statuses` in the given partition
    async fn get_requests_with_status(
        &self,
        statuses: &[RequestStatus],
        is_prod: bool,
    ) -> Result<Vec<DeploymentRequest>, MonitorError>;

    /// Atomically move every request of `requests` still in `from` to `to`.
    ///
    /// Returns the number of rows changed.
    async fn switch_deployment_request_statuses(
        &self,
        requests: &[DeploymentRequest],
        from: RequestStatus,
        to: RequestStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<u64, MonitorError>;

    /// Move the results of `requests` that are still in `from` to `to`
    async fn switch_deployment_results_statuses(
        &self,
        requests: &[DeploymentRequest],
        from: ResultStatus,
        to: ResultStatus,
    ) -> Result<u64, MonitorError>;

    /// Drop the results of the given requests.
    ///
    /// Only results of requests that are currently `Pending` are removed, so
    /// a redundant call for a request another instance already moved on is a
    /// no-op.
    async fn clear_all_deployment_results(&self, request_ids: &[i64]) -> Result<(), MonitorError>;

    /// Single-row claim: move `request` from the status it was read with to
    /// `new_status`, stamping `timestamp` as the start time.
    ///
    /// Returns 0 when another instance advanced the row first.
    async fn update_non_processed_request(
        &self,
        request: &DeploymentRequest,
        new_status: RequestStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<u64, MonitorError>;

    /// Fetch one request
    async fn get_request(&self, id: i64) -> Result<DeploymentRequest, MonitorError>;

    /// Create one pending result per component
    async fn create_deployment_results(
        &self,
        request_id: i64,
        components: &[ComponentSpec],
    ) -> Result<Vec<DeploymentResult>, MonitorError>;

    /// Results of a request, in component order
    async fn get_deployment_results(
        &self,
        request_id: i64,
    ) -> Result<Vec<DeploymentResult>, MonitorError>;

    /// Persist a result row unless it is already `Cancelled`.
    ///
    /// Returns the number of rows changed; 0 means the result was cancelled
    /// by another monitor and execution of its request has to stop.
    async fn update_deployment_result(&self, result: &DeploymentResult)
        -> Result<u64, MonitorError>;
}
