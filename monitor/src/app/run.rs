//! Main application run loop

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::authn::token_mngr::{TokenManager, TokenManagerExt};
use crate::errors::MonitorError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::{canceller, executor, restarter, token_refresh};

/// Run the deployment monitor
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), MonitorError> {
    info!("Initializing deployment monitor...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let app_state = match init(version, &options, shutdown_tx.clone(), &mut shutdown_manager).await
    {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to start monitor: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    };

    info!("Deployment monitor {} running", app_state.instance_id);
    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    version: String,
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, MonitorError> {
    options.layout.setup().await?;

    let app_state = init_app_state(version, options, shutdown_manager).await?;

    if let Some(token_mngr) = app_state.token_mngr.clone() {
        init_token_refresh_worker(
            token_mngr,
            options.token_refresh_worker.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    init_executor_worker(
        options.executor.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_restarter_worker(
        options.restarter.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    init_canceller_worker(
        options.canceller.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_status_server {
        init_status_server(
            options,
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    Ok(app_state)
}

async fn init_app_state(
    version: String,
    options: &AppOptions,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, MonitorError> {
    let (app_state, app_state_handle) =
        AppState::init(version, options, CancellationToken::new()).await?;

    let app_state = Arc::new(app_state);
    shutdown_manager.with_app_state(app_state.clone(), Box::pin(async move {
        let _ = app_state_handle.await;
    }))?;

    Ok(app_state)
}

fn shutdown_future(
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let _ = shutdown_rx.recv().await;
    })
}

async fn init_token_refresh_worker(
    token_mngr: Arc<TokenManager>,
    options: token_refresh::Options,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), MonitorError> {
    info!("Initializing token refresh worker...");

    // Fetch a first token so the first lock attempts do not pay for it
    if let Err(e) = token_mngr.get_token().await {
        error!("Failed to fetch broker token: {}", e);
    }

    let handle = tokio::spawn(async move {
        token_refresh::run(
            &options,
            token_mngr.as_ref(),
            |wait| tokio::time::sleep(wait),
            shutdown_future(shutdown_rx),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("token_refresh", handle)
}

fn init_executor_worker(
    options: executor::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), MonitorError> {
    info!("Initializing execution worker...");

    let handle = tokio::spawn(async move {
        executor::run(
            &options,
            &app_state.processor,
            &app_state.sources,
            &app_state.root_token,
            tokio::time::sleep,
            shutdown_future(shutdown_rx),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("executor", handle)
}

fn init_restarter_worker(
    options: restarter::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), MonitorError> {
    info!("Initializing restart worker...");

    let handle = tokio::spawn(async move {
        restarter::run(
            &options,
            &app_state.processor,
            &app_state.sources,
            &app_state.root_token,
            tokio::time::sleep,
            shutdown_future(shutdown_rx),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("restarter", handle)
}

fn init_canceller_worker(
    options: canceller::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), MonitorError> {
    info!("Initializing cancellation worker...");

    let handle = tokio::spawn(async move {
        canceller::run(
            &options,
            &app_state.processor,
            &app_state.sources,
            &app_state.root_token,
            tokio::time::sleep,
            shutdown_future(shutdown_rx),
        )
        .await;
    });

    shutdown_manager.with_worker_handle("canceller", handle)
}

async fn init_status_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), MonitorError> {
    info!("Initializing status server...");

    let server_state = ServerState::new(
        app_state.instance_id.clone(),
        options.executor.is_prod,
        app_state.started_at,
        app_state.processor.clone(),
        app_state.sources.clone(),
    );

    let server_handle = serve(
        &options.server,
        Arc::new(server_state),
        shutdown_future(shutdown_rx),
    )
    .await?;

    shutdown_manager.with_status_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct AppStateShutdownParams {
    state: Arc<AppState>,
    state_handle: Pin<Box<dyn Future<Output = ()> + Send>>,
}

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<AppStateShutdownParams>,
    status_server_handle: Option<JoinHandle<Result<(), MonitorError>>>,
    worker_handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            status_server_handle: None,
            worker_handles: Vec::new(),
        }
    }

    pub fn with_app_state(
        &mut self,
        state: Arc<AppState>,
        state_handle: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<(), MonitorError> {
        if self.app_state.is_some() {
            return Err(MonitorError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(AppStateShutdownParams { state, state_handle });
        Ok(())
    }

    pub fn with_worker_handle(
        &mut self,
        name: &'static str,
        handle: JoinHandle<()>,
    ) -> Result<(), MonitorError> {
        if self.worker_handles.iter().any(|(n, _)| *n == name) {
            return Err(MonitorError::ShutdownError(format!(
                "{}_handle already set",
                name
            )));
        }
        self.worker_handles.push((name, handle));
        Ok(())
    }

    pub fn with_status_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), MonitorError>>,
    ) -> Result<(), MonitorError> {
        if self.status_server_handle.is_some() {
            return Err(MonitorError::ShutdownError("server_handle already set".to_string()));
        }
        self.status_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), MonitorError> {
        let _ = self.shutdown_tx.send(());

        // Steps in flight are killed so the execution worker can return
        if let Some(app_state) = &self.app_state {
            app_state.state.shutdown().await?;
        }

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), MonitorError> {
        info!("Shutting down deployment monitor...");

        // 1. Workers
        for (name, handle) in self.worker_handles.drain(..) {
            handle
                .await
                .map_err(|e| MonitorError::ShutdownError(format!("{}: {}", name, e)))?;
        }

        // 2. Status server
        if let Some(handle) = self.status_server_handle.take() {
            handle
                .await
                .map_err(|e| MonitorError::ShutdownError(e.to_string()))??;
        }

        // 3. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.state_handle.await;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
