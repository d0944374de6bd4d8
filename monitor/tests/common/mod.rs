//! Shared fakes for the integration tests

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use deploymon::errors::MonitorError;
use deploymon::events::EventPublisher;
use deploymon::lock::{DistributedLock, DistributedLockService, LockReleaser};
use deploymon::models::event::RequestStatusChangedEvent;
use deploymon::models::request::{
    ComponentSpec, DeploymentRequest, RequestDetail, RequestStatus, ScriptSpec,
};
use deploymon::models::result::{DeploymentResult, ResultStatus};
use deploymon::persistence::memory::MemoryStore;
use deploymon::persistence::RequestsSource;
use deploymon::processor::{DeploymentRequestStateProcessor, Options};
use deploymon::runner::dispatcher::{self, ScriptDispatcher};

// ================================= MODELS ======================================= //

pub fn component(id: &str, script: &str) -> ComponentSpec {
    ComponentSpec {
        id: id.to_string(),
        name: id.to_uppercase(),
        script: ScriptSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            timeout_secs: None,
        },
        requires_confirmation: false,
    }
}

pub fn gated(id: &str, script: &str) -> ComponentSpec {
    ComponentSpec {
        requires_confirmation: true,
        ..component(id, script)
    }
}

pub fn request(id: i64, environment: &str, status: RequestStatus) -> DeploymentRequest {
    request_with(id, environment, status, vec![])
}

pub fn request_with(
    id: i64,
    environment: &str,
    status: RequestStatus,
    components: Vec<ComponentSpec>,
) -> DeploymentRequest {
    let detail = RequestDetail {
        components,
        ..Default::default()
    };
    let mut request = DeploymentRequest::new(id, environment, "alice", detail);
    request.status = status;
    request
}

// ================================= STORE ======================================== //

/// One call made against the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SwitchRequests {
        ids: Vec<i64>,
        from: RequestStatus,
        to: RequestStatus,
        changed: u64,
    },
    SwitchResults {
        ids: Vec<i64>,
        from: ResultStatus,
        to: ResultStatus,
    },
    Clear {
        ids: Vec<i64>,
    },
    Claim {
        id: i64,
        to: RequestStatus,
        changed: u64,
    },
}

type Hook = Box<dyn FnOnce(&MemoryStore) + Send>;

/// [`MemoryStore`] that records every conditional update.
///
/// A hook can run right before the first status switch to simulate another
/// monitor winning the race.
pub struct RecordingStore {
    pub inner: MemoryStore,
    calls: Mutex<Vec<Call>>,
    before_switch: Mutex<Option<Hook>>,
}

impl RecordingStore {
    pub fn new(requests: Vec<DeploymentRequest>) -> Self {
        Self {
            inner: MemoryStore::with_requests(requests),
            calls: Mutex::new(Vec::new()),
            before_switch: Mutex::new(None),
        }
    }

    pub fn before_first_switch(&self, hook: impl FnOnce(&MemoryStore) + Send + 'static) {
        *self.before_switch.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn result_switches(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::SwitchResults { .. }))
            .collect()
    }

    pub fn clears(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Clear { .. }))
            .collect()
    }

    pub async fn status_of(&self, id: i64) -> RequestStatus {
        self.inner.get_request(id).await.unwrap().status
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RequestsSource for RecordingStore {
    async fn get_requests_with_status(
        &self,
        statuses: &[RequestStatus],
        is_prod: bool,
    ) -> Result<Vec<DeploymentRequest>, MonitorError> {
        self.inner.get_requests_with_status(statuses, is_prod).await
    }

    async fn switch_deployment_request_statuses(
        &self,
        requests: &[DeploymentRequest],
        from: RequestStatus,
        to: RequestStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<u64, MonitorError> {
        let hook = self.before_switch.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }

        let changed = self
            .inner
            .switch_deployment_request_statuses(requests, from, to, completed_at)
            .await?;
        self.record(Call::SwitchRequests {
            ids: requests.iter().map(|r| r.id).collect(),
            from,
            to,
            changed,
        });
        Ok(changed)
    }

    async fn switch_deployment_results_statuses(
        &self,
        requests: &[DeploymentRequest],
        from: ResultStatus,
        to: ResultStatus,
    ) -> Result<u64, MonitorError> {
        self.record(Call::SwitchResults {
            ids: requests.iter().map(|r| r.id).collect(),
            from,
            to,
        });
        self.inner
            .switch_deployment_results_statuses(requests, from, to)
            .await
    }

    async fn clear_all_deployment_results(&self, request_ids: &[i64]) -> Result<(), MonitorError> {
        self.record(Call::Clear {
            ids: request_ids.to_vec(),
        });
        self.inner.clear_all_deployment_results(request_ids).await
    }

    async fn update_non_processed_request(
        &self,
        request: &DeploymentRequest,
        new_status: RequestStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<u64, MonitorError> {
        let changed = self
            .inner
            .update_non_processed_request(request, new_status, timestamp)
            .await?;
        self.record(Call::Claim {
            id: request.id,
            to: new_status,
            changed,
        });
        Ok(changed)
    }

    async fn get_request(&self, id: i64) -> Result<DeploymentRequest, MonitorError> {
        self.inner.get_request(id).await
    }

    async fn create_deployment_results(
        &self,
        request_id: i64,
        components: &[ComponentSpec],
    ) -> Result<Vec<DeploymentResult>, MonitorError> {
        self.inner
            .create_deployment_results(request_id, components)
            .await
    }

    async fn get_deployment_results(
        &self,
        request_id: i64,
    ) -> Result<Vec<DeploymentResult>, MonitorError> {
        self.inner.get_deployment_results(request_id).await
    }

    async fn update_deployment_result(
        &self,
        result: &DeploymentResult,
    ) -> Result<u64, MonitorError> {
        self.inner.update_deployment_result(result).await
    }
}

// ================================= LOCKS ======================================== //

/// Counts releases and frees held keys
#[derive(Default)]
pub struct CountingReleaser {
    pub released: AtomicUsize,
    held: Mutex<HashSet<String>>,
}

#[async_trait]
impl LockReleaser for CountingReleaser {
    async fn release(&self, resource_key: &str, _lease_id: &str) -> Result<(), MonitorError> {
        self.held.lock().unwrap().remove(resource_key);
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Lock service answering from a script; grants once the script runs out.
///
/// An exclusive service only grants keys nobody holds, so it can be shared by
/// several processors.
pub struct ScriptedLocks {
    enabled: bool,
    exclusive: bool,
    answers: Mutex<VecDeque<bool>>,
    attempts: Mutex<Vec<String>>,
    leases: Mutex<Vec<CancellationToken>>,
    pub releaser: Arc<CountingReleaser>,
}

impl ScriptedLocks {
    pub fn enabled(answers: Vec<bool>) -> Self {
        Self {
            enabled: true,
            exclusive: false,
            answers: Mutex::new(answers.into()),
            attempts: Mutex::new(Vec::new()),
            leases: Mutex::new(Vec::new()),
            releaser: Arc::new(CountingReleaser::default()),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::enabled(vec![])
        }
    }

    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::enabled(vec![])
        }
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn released(&self) -> usize {
        self.releaser.released.load(Ordering::SeqCst)
    }

    /// Report every lease granted so far as lost
    pub fn lose_leases(&self) {
        for lease in self.leases.lock().unwrap().iter() {
            lease.cancel();
        }
    }
}

#[async_trait]
impl DistributedLockService for ScriptedLocks {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn try_acquire_lock(
        &self,
        resource_key: &str,
        _timeout: Duration,
        _token: &CancellationToken,
    ) -> Option<DistributedLock> {
        self.attempts.lock().unwrap().push(resource_key.to_string());
        let mut granted = self.answers.lock().unwrap().pop_front().unwrap_or(true);
        if granted && self.exclusive {
            granted = self
                .releaser
                .held
                .lock()
                .unwrap()
                .insert(resource_key.to_string());
        }
        if !granted {
            return None;
        }
        let lease = CancellationToken::new();
        self.leases.lock().unwrap().push(lease.clone());
        let releaser: Arc<dyn LockReleaser> = self.releaser.clone();
        Some(DistributedLock::new(resource_key, "lease", Utc::now(), releaser).with_lease(lease))
    }
}

// ================================= EVENTS ======================================= //

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<RequestStatusChangedEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<(i64, RequestStatus)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.request_id, e.new_status))
            .collect()
    }

    pub fn events_of(&self, request_id: i64) -> Vec<RequestStatus> {
        self.events()
            .into_iter()
            .filter(|(id, _)| *id == request_id)
            .map(|(_, status)| status)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish_request_status_changed(
        &self,
        event: RequestStatusChangedEvent,
    ) -> Result<(), MonitorError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

// ================================= PROCESSOR ==================================== //

pub struct Harness {
    pub store: Arc<RecordingStore>,
    pub locks: Arc<ScriptedLocks>,
    pub publisher: Arc<RecordingPublisher>,
    pub processor: Arc<DeploymentRequestStateProcessor>,
    pub logs_dir: PathBuf,
}

pub fn harness(requests: Vec<DeploymentRequest>, locks: ScriptedLocks) -> Harness {
    harness_with_store(Arc::new(RecordingStore::new(requests)), Arc::new(locks))
}

pub fn harness_with_store(store: Arc<RecordingStore>, locks: Arc<ScriptedLocks>) -> Harness {
    let publisher = Arc::new(RecordingPublisher::default());
    let logs_dir = std::env::temp_dir().join(format!("deploymon-test-{}", uuid::Uuid::new_v4()));

    let dispatcher = ScriptDispatcher::new(dispatcher::Options {
        scripts_dir: std::env::temp_dir(),
        logs_dir: logs_dir.clone(),
        default_step_timeout: Some(Duration::from_secs(30)),
    });

    let processor = DeploymentRequestStateProcessor::new(
        store.clone(),
        locks.clone(),
        publisher.clone(),
        Arc::new(dispatcher),
        Options {
            lock_timeout: Duration::from_secs(5),
            backoff_interval: Duration::from_secs(30),
            status_poll_interval: Duration::from_millis(100),
        },
    );

    Harness {
        store,
        locks,
        publisher,
        processor: Arc::new(processor),
        logs_dir,
    }
}
