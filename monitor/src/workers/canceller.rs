//! Cancellation worker

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::processor::sources::CancellationSources;
use crate::processor::DeploymentRequestStateProcessor;

/// Cancellation worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Pause between passes, kept short so running steps stop quickly
    pub interval: Duration,
    pub is_prod: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            is_prod: false,
        }
    }
}

/// Run the cancellation worker
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
    info!("Cancellation worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Cancellation worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        if let Err(e) = processor
            .cancel_requests(options.is_prod, sources, token)
            .await
        {
            error!("Cancellation pass failed: {}", e);
        }
    }
}
