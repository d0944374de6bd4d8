//! Application configuration options

use std::time::Duration;

use crate::processor;
use crate::runner::dispatcher;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{EventSettings, HaSettings, PersistenceSettings, Settings};
use crate::workers::{canceller, executor, restarter, token_refresh};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Instance name, prefix of the lock owner id
    pub instance_name: String,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// High availability configuration
    pub ha: HaSettings,

    /// Request storage configuration
    pub persistence: PersistenceSettings,

    /// Event publishing configuration
    pub events: EventSettings,

    /// Scheduler options
    pub processor: processor::Options,

    /// Step launcher options
    pub dispatcher: dispatcher::Options,

    pub executor: executor::Options,
    pub restarter: restarter::Options,
    pub canceller: canceller::Options,
    pub token_refresh_worker: token_refresh::Options,

    /// Enable local status server
    pub enable_status_server: bool,

    /// Server configuration
    pub server: ServerOptions,
}

impl AppOptions {
    /// Options derived from the settings file
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let is_prod = settings.is_prod;
        let step_timeout = settings.scripts.step_timeout_secs;

        Self {
            lifecycle: LifecycleOptions::default(),
            instance_name: settings.instance_name.clone(),
            ha: settings.ha.clone(),
            persistence: settings.persistence.clone(),
            events: settings.events.clone(),
            processor: processor::Options {
                lock_timeout: settings.ha.lock.lock_timeout(),
                backoff_interval: settings.ha.lock.backoff_interval(),
                status_poll_interval: settings.scripts.status_poll_interval(),
            },
            dispatcher: dispatcher::Options {
                scripts_dir: layout.scripts_dir().path().to_path_buf(),
                logs_dir: layout.logs_dir().path().to_path_buf(),
                default_step_timeout: (step_timeout > 0).then(|| Duration::from_secs(step_timeout)),
            },
            executor: executor::Options {
                interval: Duration::from_secs(settings.workers.execute_interval_secs.max(1)),
                is_prod,
            },
            restarter: restarter::Options {
                interval: Duration::from_secs(settings.workers.restart_interval_secs.max(1)),
                is_prod,
            },
            canceller: canceller::Options {
                interval: Duration::from_secs(settings.workers.cancel_interval_secs.max(1)),
                is_prod,
            },
            token_refresh_worker: token_refresh::Options {
                refresh_interval: settings.ha.oauth.refresh_interval(),
            },
            enable_status_server: settings.enable_status_server,
            server: ServerOptions {
                host: settings.status_server.host.clone(),
                port: settings.status_server.port,
            },
            layout,
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), StorageLayout::default())
    }
}

/// Lifecycle options for the monitor
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}
