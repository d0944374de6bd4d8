//! Token refresh worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::authn::token_mngr::TokenManagerExt;

/// Token refresh worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Refresh interval
    pub refresh_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(900), // 15 minutes
        }
    }
}

/// Run the token refresh worker.
///
/// Failures are logged and retried on the next interval; lock attempts made
/// meanwhile fetch a token on demand.
pub async fn run<T, S, F>(
    options: &Options,
    token_mngr: &T,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    T: TokenManagerExt + ?Sized,
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Token refresh worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Token refresh worker shutting down...");
                return;
            }
            _ = sleep_fn(options.refresh_interval) => {}
        }

        debug!("Refreshing broker access token...");
        match token_mngr.refresh_token().await {
            Ok(token) => {
                debug!(
                    "Token refreshed, expires in {} minutes",
                    token.time_until_expiry() / 60
                );
            }
            Err(e) => {
                error!("Failed to refresh token: {}", e);
            }
        }
    }
}
