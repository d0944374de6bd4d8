//! In-process request store
//!
//! Keeps the conditional-update semantics of the real storage layer so a
//! single monitor (or several monitors sharing one store in tests) observe
//! the same ownership rules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::MonitorError;
use crate::models::request::{ComponentSpec, DeploymentRequest, RequestStatus};
use crate::models::result::{DeploymentResult, ResultStatus};
use crate::persistence::RequestsSource;

#[derive(Default)]
struct Tables {
    requests: HashMap<i64, DeploymentRequest>,
    results: HashMap<i64, Vec<DeploymentResult>>,
}

/// In-memory implementation of [`RequestsSource`]
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    next_result_id: AtomicI64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with requests
    pub fn with_requests(requests: Vec<DeploymentRequest>) -> Self {
        let store = Self::new();
        for request in requests {
            store.insert_request(request);
        }
        store
    }

    /// Insert or replace a request
    pub fn insert_request(&self, request: DeploymentRequest) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.requests.insert(request.id, request);
    }

    /// Move a request to `status` the way the API layer does on user actions
    pub fn set_request_status(&self, id: i64, status: RequestStatus) -> Result<(), MonitorError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let request = tables
            .requests
            .get_mut(&id)
            .ok_or_else(|| MonitorError::NotFound(format!("request {}", id)))?;
        if !request.status.can_transition_to(status) {
            return Err(MonitorError::InvalidTransition {
                id,
                from: request.status,
                to: status,
            });
        }
        request.status = status;
        Ok(())
    }

    /// Snapshot of all requests, ordered by id
    pub fn requests(&self) -> Vec<DeploymentRequest> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut requests: Vec<_> = tables.requests.values().cloned().collect();
        requests.sort_by_key(|r| r.id);
        requests
    }

    /// Snapshot of the results of one request
    pub fn results_of(&self, request_id: i64) -> Vec<DeploymentResult> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.results.get(&request_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl RequestsSource for MemoryStore {
    async fn get_requests_with_status(
        &self,
        statuses: &[RequestStatus],
        is_prod: bool,
    ) -> Result<Vec<DeploymentRequest>, MonitorError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut requests: Vec<_> = tables
            .requests
            .values()
            .filter(|r| r.is_prod == is_prod && statuses.contains(&r.status))
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.id);
        Ok(requests)
    }

    async fn switch_deployment_request_statuses(
        &self,
        requests: &[DeploymentRequest],
        from: RequestStatus,
        to: RequestStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<u64, MonitorError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0;
        for request in requests {
            if let Some(row) = tables.requests.get_mut(&request.id) {
                if row.status == from {
                    row.status = to;
                    if completed_at.is_some() {
                        row.completed_at = completed_at;
                    }
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn switch_deployment_results_statuses(
        &self,
        requests: &[DeploymentRequest],
        from: ResultStatus,
        to: ResultStatus,
    ) -> Result<u64, MonitorError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0;
        for request in requests {
            if let Some(results) = tables.results.get_mut(&request.id) {
                for result in results.iter_mut().filter(|r| r.status == from) {
                    result.status = to;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn clear_all_deployment_results(&self, request_ids: &[i64]) -> Result<(), MonitorError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        for id in request_ids {
            let is_pending = tables
                .requests
                .get(id)
                .map(|r| r.status == RequestStatus::Pending)
                .unwrap_or(false);
            if is_pending {
                tables.results.remove(id);
            }
        }
        Ok(())
    }

    async fn update_non_processed_request(
        &self,
        request: &DeploymentRequest,
        new_status: RequestStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<u64, MonitorError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let Some(row) = tables.requests.get_mut(&request.id) else {
            return Ok(0);
        };

        if row.status != request.status || !row.status.can_transition_to(new_status) {
            return Ok(0);
        }

        row.status = new_status;
        if row.started_at.is_none() {
            row.started_at = Some(timestamp);
        }
        Ok(1)
    }

    async fn get_request(&self, id: i64) -> Result<DeploymentRequest, MonitorError> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| MonitorError::NotFound(format!("request {}", id)))
    }

    async fn create_deployment_results(
        &self,
        request_id: i64,
        components: &[ComponentSpec],
    ) -> Result<Vec<DeploymentResult>, MonitorError> {
        let results: Vec<_> = components
            .iter()
            .map(|c| {
                let id = self.next_result_id.fetch_add(1, Ordering::SeqCst) + 1;
                DeploymentResult::pending(id, request_id, c)
            })
            .collect();

        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.results.insert(request_id, results.clone());
        Ok(results)
    }

    async fn get_deployment_results(
        &self,
        request_id: i64,
    ) -> Result<Vec<DeploymentResult>, MonitorError> {
        Ok(self.results_of(request_id))
    }

    async fn update_deployment_result(
        &self,
        result: &DeploymentResult,
    ) -> Result<u64, MonitorError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let row = tables
            .results
            .get_mut(&result.request_id)
            .and_then(|results| results.iter_mut().find(|r| r.id == result.id))
            .ok_or_else(|| MonitorError::NotFound(format!("result {}", result.id)))?;
        if row.status == ResultStatus::Cancelled {
            return Ok(0);
        }
        *row = result.clone();
        Ok(1)
    }
}
