//! Application state management

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::options::AppOptions;
use crate::authn::token_mngr::TokenManager;
use crate::errors::MonitorError;
use crate::events::broadcast::BroadcastPublisher;
use crate::events::mqtt::MqttPublisher;
use crate::events::EventPublisher;
use crate::http::client::HttpClient;
use crate::http::requests::HttpRequestsSource;
use crate::lock::broker::{BrokerClient, BrokerLockService};
use crate::lock::noop::NoopLockService;
use crate::lock::DistributedLockService;
use crate::models::request::DeploymentRequest;
use crate::persistence::memory::MemoryStore;
use crate::persistence::RequestsSource;
use crate::processor::sources::CancellationSources;
use crate::processor::DeploymentRequestStateProcessor;
use crate::runner::dispatcher::ScriptDispatcher;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{PersistenceKind, PersistenceSettings};
use crate::utils::instance_owner_id;

/// Main application state
pub struct AppState {
    /// Lock owner id of this instance
    pub instance_id: String,

    pub version: String,
    pub started_at: DateTime<Utc>,

    /// Request storage
    pub store: Arc<dyn RequestsSource>,

    /// Cross-instance locking
    pub lock_service: Arc<dyn DistributedLockService>,

    /// Status change events
    pub publisher: Arc<dyn EventPublisher>,

    /// Broker token manager, present when HA is enabled
    pub token_mngr: Option<Arc<TokenManager>>,

    /// Request scheduler
    pub processor: Arc<DeploymentRequestStateProcessor>,

    /// Requests executing on this instance
    pub sources: CancellationSources,

    /// Cancelled on shutdown, kills the steps in flight
    pub root_token: CancellationToken,
}

impl AppState {
    /// Initialize application state.
    ///
    /// The returned handle drives background I/O owned by the state (the MQTT
    /// event loop) and ends once `root_token` is cancelled.
    pub async fn init(
        version: String,
        options: &AppOptions,
        root_token: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), MonitorError> {
        info!("Initializing application state...");

        let instance_id = instance_owner_id(&options.instance_name);

        let (lock_service, token_mngr) = init_lock_service(options, &instance_id)?;
        let store = init_store(&options.persistence, &options.layout).await?;

        let (publisher, handle): (Arc<dyn EventPublisher>, JoinHandle<()>) =
            if options.events.mqtt_enabled {
                let (publisher, handle) = MqttPublisher::connect(
                    &options.events.mqtt_broker,
                    &instance_id,
                    &options.events.topic_prefix,
                    root_token.child_token(),
                )?;
                (Arc::new(publisher), handle)
            } else {
                info!("MQTT disabled, publishing request events in-process");
                (Arc::new(BroadcastPublisher::default()), tokio::spawn(async {}))
            };

        let dispatcher = Arc::new(ScriptDispatcher::new(options.dispatcher.clone()));
        let processor = Arc::new(DeploymentRequestStateProcessor::new(
            store.clone(),
            lock_service.clone(),
            publisher.clone(),
            dispatcher,
            options.processor.clone(),
        ));

        let state = Self {
            instance_id,
            version,
            started_at: Utc::now(),
            store,
            lock_service,
            publisher,
            token_mngr,
            processor,
            sources: CancellationSources::new(),
            root_token,
        };

        Ok((state, handle))
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        info!("Shutting down application state...");
        self.root_token.cancel();
        if !self.sources.is_empty() {
            info!("Stopping {} in-flight request(s)", self.sources.len());
        }
        Ok(())
    }
}

fn init_lock_service(
    options: &AppOptions,
    instance_id: &str,
) -> Result<(Arc<dyn DistributedLockService>, Option<Arc<TokenManager>>), MonitorError> {
    if !options.ha.enabled {
        info!("HA disabled, running without distributed locks");
        return Ok((Arc::new(NoopLockService), None));
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(
            options.ha.broker.request_timeout_secs.max(1),
        ))
        .build()?;

    let token_mngr = Arc::new(TokenManager::new(http.clone(), &options.ha.oauth)?);
    let client = BrokerClient::new(
        http,
        &options.ha.broker.base_url,
        token_mngr.clone(),
        instance_id.to_string(),
        options.ha.lock.lease_ttl(),
    )?;

    Ok((Arc::new(BrokerLockService::new(client)), Some(token_mngr)))
}

async fn init_store(
    settings: &PersistenceSettings,
    layout: &StorageLayout,
) -> Result<Arc<dyn RequestsSource>, MonitorError> {
    match settings.kind {
        PersistenceKind::Memory => {
            let requests_file = layout.requests_file();
            let requests: Vec<DeploymentRequest> = if requests_file.exists().await {
                requests_file.read_json().await?
            } else {
                Vec::new()
            };
            info!("Using in-memory request store with {} request(s)", requests.len());
            Ok(Arc::new(MemoryStore::with_requests(requests)))
        }
        PersistenceKind::Http => {
            let mut client = HttpClient::new(&settings.base_url, Duration::from_secs(30))?;
            if !settings.api_token.is_empty() {
                client = client.with_api_token(settings.api_token.clone().into());
            }
            info!("Using requests API at {}", client.base_url());
            Ok(Arc::new(HttpRequestsSource::new(client)))
        }
    }
}
