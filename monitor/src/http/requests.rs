//! Deployment request API
//!
//! Conditional updates are evaluated by the API server, which answers with
//! the number of rows it changed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::MonitorError;
use crate::http::client::HttpClient;
use crate::models::request::{ComponentSpec, DeploymentRequest, RequestStatus};
use crate::models::result::{DeploymentResult, ResultStatus};
use crate::persistence::RequestsSource;

/// List of requests response
#[derive(Debug, Clone, Deserialize)]
pub struct RequestListResponse {
    pub requests: Vec<DeploymentRequest>,
}

/// List of results response
#[derive(Debug, Clone, Deserialize)]
pub struct ResultListResponse {
    pub results: Vec<DeploymentResult>,
}

/// Answer to a conditional update
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChangedResponse {
    pub changed: u64,
}

#[derive(Debug, Serialize)]
struct RequestQuery {
    status: String,
    is_prod: bool,
}

#[derive(Debug, Serialize)]
struct RequestStatusSwitch<'a> {
    ids: &'a [i64],
    from: RequestStatus,
    to: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ResultStatusSwitch<'a> {
    request_ids: &'a [i64],
    from: ResultStatus,
    to: ResultStatus,
}

#[derive(Debug, Serialize)]
struct ClearResults<'a> {
    request_ids: &'a [i64],
}

#[derive(Debug, Serialize)]
struct Claim {
    expected_status: RequestStatus,
    new_status: RequestStatus,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct CreateResults<'a> {
    components: &'a [ComponentSpec],
}

impl HttpClient {
    /// Requests in any of `statuses`
    pub async fn list_requests(
        &self,
        statuses: &[RequestStatus],
        is_prod: bool,
    ) -> Result<Vec<DeploymentRequest>, MonitorError> {
        let query = RequestQuery {
            status: statuses
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(","),
            is_prod,
        };
        let response: RequestListResponse = self.get_with_query("/requests", &query).await?;
        Ok(response.requests)
    }

    /// Fetch one request
    pub async fn get_deployment_request(&self, id: i64) -> Result<DeploymentRequest, MonitorError> {
        self.get(&format!("/requests/{}", id)).await
    }

    /// Conditional status switch over many requests
    pub async fn switch_request_statuses(
        &self,
        ids: &[i64],
        from: RequestStatus,
        to: RequestStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<u64, MonitorError> {
        let body = RequestStatusSwitch {
            ids,
            from,
            to,
            completed_at,
        };
        let response: ChangedResponse = self.post("/requests/status-switch", &body).await?;
        Ok(response.changed)
    }

    /// Conditional claim of a single request
    pub async fn claim_request(
        &self,
        id: i64,
        expected_status: RequestStatus,
        new_status: RequestStatus,
        started_at: DateTime<Utc>,
    ) -> Result<u64, MonitorError> {
        let body = Claim {
            expected_status,
            new_status,
            started_at,
        };
        let response: ChangedResponse =
            self.post(&format!("/requests/{}/claim", id), &body).await?;
        Ok(response.changed)
    }

    /// Conditional result status switch over many requests
    pub async fn switch_result_statuses(
        &self,
        request_ids: &[i64],
        from: ResultStatus,
        to: ResultStatus,
    ) -> Result<u64, MonitorError> {
        let body = ResultStatusSwitch {
            request_ids,
            from,
            to,
        };
        let response: ChangedResponse = self.post("/results/status-switch", &body).await?;
        Ok(response.changed)
    }

    /// Drop the results of pending requests
    pub async fn clear_results(&self, request_ids: &[i64]) -> Result<(), MonitorError> {
        let _: serde_json::Value = self
            .post("/results/clear", &ClearResults { request_ids })
            .await?;
        Ok(())
    }

    /// Create pending results for `components`
    pub async fn create_results(
        &self,
        request_id: i64,
        components: &[ComponentSpec],
    ) -> Result<Vec<DeploymentResult>, MonitorError> {
        let response: ResultListResponse = self
            .post(
                &format!("/requests/{}/results", request_id),
                &CreateResults { components },
            )
            .await?;
        Ok(response.results)
    }

    /// Results of a request
    pub async fn list_results(&self, request_id: i64) -> Result<Vec<DeploymentResult>, MonitorError> {
        let response: ResultListResponse =
            self.get(&format!("/requests/{}/results", request_id)).await?;
        Ok(response.results)
    }

    /// Overwrite one result unless the server already holds it cancelled
    pub async fn put_result(&self, result: &DeploymentResult) -> Result<u64, MonitorError> {
        let response: ChangedResponse =
            self.put(&format!("/results/{}", result.id), result).await?;
        Ok(response.changed)
    }
}

/// [`RequestsSource`] backed by the deployment API
pub struct HttpRequestsSource {
    client: HttpClient,
}

impl HttpRequestsSource {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

fn ids_of(requests: &[DeploymentRequest]) -> Vec<i64> {
    requests.iter().map(|r| r.id).collect()
}

#[async_trait]
impl RequestsSource for HttpRequestsSource {
    async fn get_requests_with_status(
        &self,
        statuses: &[RequestStatus],
        is_prod: bool,
    ) -> Result<Vec<DeploymentRequest>, MonitorError> {
        self.client.list_requests(statuses, is_prod).await
    }

    async fn switch_deployment_request_statuses(
        &self,
        requests: &[DeploymentRequest],
        from: RequestStatus,
        to: RequestStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<u64, MonitorError> {
        if requests.is_empty() {
            return Ok(0);
        }
        self.client
            .switch_request_statuses(&ids_of(requests), from, to, completed_at)
            .await
    }

    async fn switch_deployment_results_statuses(
        &self,
        requests: &[DeploymentRequest],
        from: ResultStatus,
        to: ResultStatus,
    ) -> Result<u64, MonitorError> {
        if requests.is_empty() {
            return Ok(0);
        }
        self.client
            .switch_result_statuses(&ids_of(requests), from, to)
            .await
    }

    async fn clear_all_deployment_results(&self, request_ids: &[i64]) -> Result<(), MonitorError> {
        if request_ids.is_empty() {
            return Ok(());
        }
        self.client.clear_results(request_ids).await
    }

    async fn update_non_processed_request(
        &self,
        request: &DeploymentRequest,
        new_status: RequestStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<u64, MonitorError> {
        self.client
            .claim_request(request.id, request.status, new_status, timestamp)
            .await
    }

    async fn get_request(&self, id: i64) -> Result<DeploymentRequest, MonitorError> {
        self.client.get_deployment_request(id).await
    }

    async fn create_deployment_results(
        &self,
        request_id: i64,
        components: &[ComponentSpec],
    ) -> Result<Vec<DeploymentResult>, MonitorError> {
        self.client.create_results(request_id, components).await
    }

    async fn get_deployment_results(
        &self,
        request_id: i64,
    ) -> Result<Vec<DeploymentResult>, MonitorError> {
        self.client.list_results(request_id).await
    }

    async fn update_deployment_result(
        &self,
        result: &DeploymentResult,
    ) -> Result<u64, MonitorError> {
        self.client.put_result(result).await
    }
}
