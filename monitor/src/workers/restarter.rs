//! Restart worker

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::processor::sources::CancellationSources;
use crate::processor::DeploymentRequestStateProcessor;

/// Restart worker options
#[derive(Debug, Clone)]
pub struct Options {
    pub interval: Duration,
    pub is_prod: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            is_prod: false,
        }
    }
}

/// Run the restart worker
pub async fn run<S, F>(
    options: &Options,
    processor: &Arc<DeploymentRequestStateProcessor>,
    sources: &CancellationSources,
    token: &CancellationToken,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Restart worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Restart worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        if let Err(e) = processor
            .restart_requests(options.is_prod, sources, token)
            .await
        {
            error!("Restart pass failed: {}", e);
        }
    }
}
