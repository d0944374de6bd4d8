//! Deployment request scheduler
//!
//! Three entry points are driven by the monitor workers:
//! [`execute_requests`](DeploymentRequestStateProcessor::execute_requests),
//! [`restart_requests`](DeploymentRequestStateProcessor::restart_requests) and
//! [`cancel_requests`](DeploymentRequestStateProcessor::cancel_requests).
//!
//! Several monitors may share one store. A status switch that reports zero
//! changed rows means another instance got there first, and the caller backs
//! off without touching anything else.

pub mod backoff;
mod execution;
pub mod sources;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::MonitorError;
use crate::events::EventPublisher;
use crate::lock::DistributedLockService;
use crate::models::event::RequestStatusChangedEvent;
use crate::models::request::{environment_resource_key, DeploymentRequest, RequestStatus};
use crate::models::result::ResultStatus;
use crate::persistence::RequestsSource;
use crate::runner::dispatcher::ScriptDispatcher;

use backoff::LockBackoff;
use sources::CancellationSources;

/// Processor options
#[derive(Debug, Clone)]
pub struct Options {
    /// Budget for one lock attempt
    pub lock_timeout: Duration,

    /// How long an environment is skipped after a failed lock attempt
    pub backoff_interval: Duration,

    /// How often a running step checks whether its request moved on elsewhere
    pub status_poll_interval: Duration,
}

/// Drives deployment requests through their lifecycle
pub struct DeploymentRequestStateProcessor {
    store: Arc<dyn RequestsSource>,
    locks: Arc<dyn DistributedLockService>,
    publisher: Arc<dyn EventPublisher>,
    dispatcher: Arc<ScriptDispatcher>,
    backoff: LockBackoff,
    busy_environments: DashMap<String, ()>,
    options: Options,
}

/// Marks an environment as being processed here until dropped
struct BusyEnvironment {
    processor: Arc<DeploymentRequestStateProcessor>,
    environment_name: String,
}

impl Drop for BusyEnvironment {
    fn drop(&mut self) {
        self.processor
            .busy_environments
            .remove(&self.environment_name);
    }
}

impl DeploymentRequestStateProcessor {
    pub fn new(
        store: Arc<dyn RequestsSource>,
        locks: Arc<dyn DistributedLockService>,
        publisher: Arc<dyn EventPublisher>,
        dispatcher: Arc<ScriptDispatcher>,
        options: Options,
    ) -> Self {
        Self {
            store,
            locks,
            publisher,
            dispatcher,
            backoff: LockBackoff::new(options.backoff_interval),
            busy_environments: DashMap::new(),
            options,
        }
    }

    /// Environment lock backoff table
    pub fn backoff(&self) -> &LockBackoff {
        &self.backoff
    }

    /// Environments a pass is currently working on
    pub fn busy_environments(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .busy_environments
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    fn mark_busy(self: &Arc<Self>, environment_name: &str) -> Option<BusyEnvironment> {
        match self.busy_environments.entry(environment_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                Some(BusyEnvironment {
                    processor: self.clone(),
                    environment_name: environment_name.to_string(),
                })
            }
        }
    }

    /// Whether cross-instance locking is active
    pub fn is_ha_enabled(&self) -> bool {
        self.locks.is_enabled()
    }

    /// Run every executable request of the partition.
    ///
    /// Environments are processed concurrently, the requests of one
    /// environment one after another. An environment still being worked on by
    /// an earlier pass is skipped. With HA enabled an environment is only
    /// processed while this instance holds its lock.
    pub async fn execute_requests(
        self: &Arc<Self>,
        is_prod: bool,
        cancellation_sources: &CancellationSources,
        token: &CancellationToken,
    ) -> Result<(), MonitorError> {
        let requests = self
            .store
            .get_requests_with_status(&RequestStatus::EXECUTABLE, is_prod)
            .await?;
        if requests.is_empty() {
            return Ok(());
        }

        let mut groups: BTreeMap<String, Vec<DeploymentRequest>> = BTreeMap::new();
        for request in requests {
            groups
                .entry(request.environment_name.clone())
                .or_default()
                .push(request);
        }
        debug!("Executing requests of {} environment(s)", groups.len());

        let mut tasks = JoinSet::new();
        for (environment_name, batch) in groups {
            let Some(busy) = self.mark_busy(&environment_name) else {
                debug!("{} is still being processed by an earlier pass", environment_name);
                continue;
            };
            let processor = self.clone();
            let sources = cancellation_sources.clone();
            let token = token.clone();
            tasks.spawn(async move {
                let _busy = busy;
                processor
                    .process_environment(&environment_name, batch, &sources, &token)
                    .await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!("Environment task panicked: {}", e);
                } else {
                    warn!("Environment task aborted: {}", e);
                }
            }
        }
        Ok(())
    }

    async fn process_environment(
        &self,
        environment_name: &str,
        batch: Vec<DeploymentRequest>,
        sources: &CancellationSources,
        token: &CancellationToken,
    ) {
        if !self.locks.is_enabled() {
            self.execute_batch(batch, sources, token).await;
            return;
        }

        let resource_key = environment_resource_key(environment_name);
        if self.backoff.is_backed_off(&resource_key) {
            debug!("Skipping {}, lock backoff in effect", resource_key);
            return;
        }

        let Some(lock) = self
            .locks
            .try_acquire_lock(&resource_key, self.options.lock_timeout, token)
            .await
        else {
            self.backoff.record_failure(&resource_key);
            debug!(
                "Lock {} not acquired, backing off for {:?}",
                resource_key,
                self.backoff.interval()
            );
            return;
        };

        self.backoff.clear(&resource_key);

        // Losing the lease stops the batch the way shutdown does
        let group = token.child_token();
        let lease = lock.lease_token();
        let linked = group.clone();
        let watched_key = resource_key.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = lease.cancelled() => {
                    warn!("Lost lock {}, stopping its requests", watched_key);
                    linked.cancel();
                }
                _ = linked.cancelled() => {}
            }
        });

        self.execute_batch(batch, sources, &group).await;
        group.cancel();
        lock.release().await;
    }

    async fn execute_batch(
        &self,
        batch: Vec<DeploymentRequest>,
        sources: &CancellationSources,
        token: &CancellationToken,
    ) {
        for request in batch {
            if token.is_cancelled() {
                debug!("Shutdown requested, leaving remaining requests");
                return;
            }
            let request_id = request.id;
            if let Err(e) = self.execute_request(request, sources, token).await {
                error!("Failed to execute request {}: {}", request_id, e);
            }
        }
    }

    /// Move every `Restarting` request back to `Pending` and drop its results
    pub async fn restart_requests(
        &self,
        is_prod: bool,
        _cancellation_sources: &CancellationSources,
        token: &CancellationToken,
    ) -> Result<(), MonitorError> {
        if token.is_cancelled() {
            return Ok(());
        }

        let batch = self
            .store
            .get_requests_with_status(&[RequestStatus::Restarting], is_prod)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }

        let switched = self
            .store
            .switch_deployment_request_statuses(
                &batch,
                RequestStatus::Restarting,
                RequestStatus::Pending,
                None,
            )
            .await?;
        if switched == 0 {
            debug!(
                "Restart of {} request(s) was handled by another monitor",
                batch.len()
            );
            return Ok(());
        }
        if switched < batch.len() as u64 {
            info!(
                "Restarted {} of {} request(s), partial restart",
                switched,
                batch.len()
            );
        }

        let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        self.store.clear_all_deployment_results(&ids).await?;

        for request in &batch {
            self.publish(request, RequestStatus::Pending).await;
        }
        info!("Restarted requests {:?}", ids);
        Ok(())
    }

    /// Apply every pending cancellation, stopping the steps that run here
    pub async fn cancel_requests(
        &self,
        is_prod: bool,
        cancellation_sources: &CancellationSources,
        token: &CancellationToken,
    ) -> Result<(), MonitorError> {
        if token.is_cancelled() {
            return Ok(());
        }

        let batch = self
            .store
            .get_requests_with_status(&[RequestStatus::Cancelling], is_prod)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }

        for request in &batch {
            if cancellation_sources.cancel(request.id) {
                info!("Stopping in-flight request {}", request.id);
            }
        }

        let switched = self
            .store
            .switch_deployment_request_statuses(
                &batch,
                RequestStatus::Cancelling,
                RequestStatus::Cancelled,
                Some(Utc::now()),
            )
            .await?;
        if switched == 0 {
            debug!(
                "Cancellation of {} request(s) was handled by another monitor",
                batch.len()
            );
            return Ok(());
        }
        if switched < batch.len() as u64 {
            info!(
                "Cancelled {} of {} request(s), partial cancellation",
                switched,
                batch.len()
            );
        }

        let mut results = self
            .store
            .switch_deployment_results_statuses(
                &batch,
                ResultStatus::Pending,
                ResultStatus::Cancelled,
            )
            .await?;
        results += self
            .store
            .switch_deployment_results_statuses(
                &batch,
                ResultStatus::WaitingConfirmation,
                ResultStatus::Cancelled,
            )
            .await?;
        debug!("Cancelled {} outstanding result(s)", results);

        for request in &batch {
            self.publish(request, RequestStatus::Cancelled).await;
        }
        Ok(())
    }

    async fn publish(&self, request: &DeploymentRequest, status: RequestStatus) {
        let event = RequestStatusChangedEvent::for_request(request, status);
        if let Err(e) = self.publisher.publish_request_status_changed(event).await {
            warn!(
                "Failed to publish status {} of request {}: {}",
                status, request.id, e
            );
        }
    }
}
