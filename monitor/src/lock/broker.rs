//! Lock broker adapter over HTTP
//!
//! Broker API:
//! - `POST   {base}/locks/{key}`            `{owner, ttl_ms, wait_ms}` -> 200 lease, 409/423 held elsewhere
//! - `PUT    {base}/locks/{key}/{lease_id}` `{ttl_ms}` -> 200 renewed, 404/409 lost
//! - `DELETE {base}/locks/{key}/{lease_id}` -> 2xx or 404

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::authn::token_mngr::TokenManagerExt;
use crate::errors::MonitorError;
use crate::lock::{DistributedLock, DistributedLockService, LockReleaser};

#[derive(Debug, Serialize)]
struct AcquireBody<'a> {
    owner: &'a str,
    ttl_ms: u64,
    wait_ms: u64,
}

#[derive(Debug, Serialize)]
struct RenewBody {
    ttl_ms: u64,
}

/// Lease granted by the broker
#[derive(Debug, Clone, Deserialize)]
pub struct LeaseResponse {
    pub lease_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Thin client for the broker's lock endpoints
pub struct BrokerClient {
    http: Client,
    base_url: Url,
    token_mngr: Arc<dyn TokenManagerExt>,
    owner: String,
    lease_ttl: Duration,
}

impl BrokerClient {
    pub fn new(
        http: Client,
        base_url: &str,
        token_mngr: Arc<dyn TokenManagerExt>,
        owner: String,
        lease_ttl: Duration,
    ) -> Result<Self, MonitorError> {
        let base_url = Url::parse(base_url.trim_end_matches('/')).map_err(|e| {
            MonitorError::ConfigError(format!("Invalid broker url {}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(MonitorError::ConfigError(format!(
                "Broker url {} cannot be a base url",
                base_url
            )));
        }

        Ok(Self {
            http,
            base_url,
            token_mngr,
            owner,
            lease_ttl,
        })
    }

    /// Lock owner reported to the broker
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lock_url(&self, resource_key: &str, lease_id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("locks").push(resource_key);
            if let Some(lease_id) = lease_id {
                segments.push(lease_id);
            }
        }
        url
    }

    async fn bearer(&self) -> Result<String, MonitorError> {
        let token = self.token_mngr.get_token().await?;
        Ok(format!("Bearer {}", token.raw))
    }

    /// Ask for a lease; `Ok(None)` means somebody else holds it
    pub async fn acquire(
        &self,
        resource_key: &str,
        wait: Duration,
    ) -> Result<Option<LeaseResponse>, MonitorError> {
        let url = self.lock_url(resource_key, None);
        debug!("POST {}", url);

        let body = AcquireBody {
            owner: &self.owner,
            ttl_ms: self.lease_ttl.as_millis() as u64,
            wait_ms: wait.as_millis() as u64,
        };

        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, self.bearer().await?)
            .json(&body)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(Some(response.json().await?)),
            StatusCode::CONFLICT | StatusCode::LOCKED => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(MonitorError::LockError(format!("{}: {}", status, body)))
            }
        }
    }

    /// Extend a lease; `Ok(false)` means it was lost
    pub async fn renew(&self, resource_key: &str, lease_id: &str) -> Result<bool, MonitorError> {
        let url = self.lock_url(resource_key, Some(lease_id));
        debug!("PUT {}", url);

        let response = self
            .http
            .put(url)
            .header(header::AUTHORIZATION, self.bearer().await?)
            .json(&RenewBody {
                ttl_ms: self.lease_ttl.as_millis() as u64,
            })
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(MonitorError::LockError(format!("{}: {}", status, body)))
            }
        }
    }

    /// Renew the lease until `stop` fires.
    ///
    /// `lease` is cancelled once the broker reports the lease gone, or once
    /// renewals kept failing past the last known expiry.
    fn spawn_keepalive(
        self: &Arc<Self>,
        resource_key: String,
        lease_id: String,
        expires_at: DateTime<Utc>,
        lease: CancellationToken,
    ) -> CancellationToken {
        let stop = CancellationToken::new();
        let client = self.clone();
        let period = (self.lease_ttl / 3).max(Duration::from_millis(250));
        let stopped = stop.clone();

        tokio::spawn(async move {
            let mut valid_until = expires_at;
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }

                match client.renew(&resource_key, &lease_id).await {
                    Ok(true) => {
                        debug!("Renewed lease on {}", resource_key);
                        valid_until = Utc::now()
                            + chrono::Duration::from_std(client.lease_ttl)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                    }
                    Ok(false) => {
                        warn!("Lease on {} was lost", resource_key);
                        lease.cancel();
                        return;
                    }
                    Err(e) if Utc::now() >= valid_until => {
                        warn!(
                            "Lease on {} expired while the broker was unreachable: {}",
                            resource_key, e
                        );
                        lease.cancel();
                        return;
                    }
                    Err(e) => warn!("Failed to renew lease on {}: {}", resource_key, e),
                }
            }
        });

        stop
    }
}

#[async_trait]
impl LockReleaser for BrokerClient {
    async fn release(&self, resource_key: &str, lease_id: &str) -> Result<(), MonitorError> {
        let url = self.lock_url(resource_key, Some(lease_id));
        debug!("DELETE {}", url);

        let response = self
            .http
            .delete(url)
            .header(header::AUTHORIZATION, self.bearer().await?)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(MonitorError::LockError(format!("{}: {}", status, body)))
            }
        }
    }
}

/// Lock service backed by the broker
pub struct BrokerLockService {
    client: Arc<BrokerClient>,
}

impl BrokerLockService {
    pub fn new(client: BrokerClient) -> Self {
        info!("Using lock broker {} as {}", client.base_url, client.owner);
        Self {
            client: Arc::new(client),
        }
    }
}

#[async_trait]
impl DistributedLockService for BrokerLockService {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn try_acquire_lock(
        &self,
        resource_key: &str,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Option<DistributedLock> {
        let attempt = tokio::time::timeout(timeout, self.client.acquire(resource_key, timeout));

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                debug!("Lock attempt on {} cancelled", resource_key);
                return None;
            }
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(Ok(Some(lease))) => {
                debug!("Acquired lock {} (lease {})", resource_key, lease.lease_id);
                let lost = CancellationToken::new();
                let keepalive = self.client.spawn_keepalive(
                    resource_key.to_string(),
                    lease.lease_id.clone(),
                    lease.expires_at,
                    lost.clone(),
                );
                let releaser: Arc<dyn LockReleaser> = self.client.clone();
                Some(
                    DistributedLock::new(resource_key, lease.lease_id, lease.expires_at, releaser)
                        .with_lease(lost)
                        .with_keepalive(keepalive),
                )
            }
            Ok(Ok(None)) => {
                debug!("Lock {} is held by another instance", resource_key);
                None
            }
            Ok(Err(e)) => {
                warn!("Lock broker unavailable for {}: {}", resource_key, e);
                None
            }
            Err(_) => {
                debug!("Timed out after {:?} acquiring lock {}", timeout, resource_key);
                None
            }
        }
    }
}
