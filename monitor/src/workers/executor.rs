//! Execution worker

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::processor::sources::CancellationSources;
use crate::processor::DeploymentRequestStateProcessor;

/// Execution worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Pause between execution passes
    pub interval: Duration,

    /// Partition to serve
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

/// Run the execution worker.
///
/// Every tick starts a new pass without waiting for the previous one, so an
/// environment with a long step does not hold back the others. Passes skip
/// environments an earlier pass still works on. `token` cancels the steps in
/// flight when the monitor stops; the worker returns once its passes ended.
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
    info!("Execution worker starting...");
    let mut passes = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Execution worker shutting down...");
                break;
            }
            _ = sleep_fn(options.interval) => {}
        }

        while let Some(joined) = passes.try_join_next() {
            reap(joined);
        }

        debug!("Executing deployment requests ({} pass(es) in flight)...", passes.len());
        let processor = processor.clone();
        let sources = sources.clone();
        let token = token.clone();
        let is_prod = options.is_prod;
        passes.spawn(async move {
            if let Err(e) = processor.execute_requests(is_prod, &sources, &token).await {
                error!("Execution pass failed: {}", e);
            }
        });
    }

    while let Some(joined) = passes.join_next().await {
        reap(joined);
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Execution pass panicked: {}", e);
        } else {
            warn!("Execution pass aborted: {}", e);
        }
    }
}
