//! Distributed advisory locks
//!
//! A lock is granted per resource key (`env:<EnvironmentName>`) by an
//! external broker. Acquisition never fails loudly: any broker, transport or
//! authentication problem is reported as "not acquired".

pub mod broker;
pub mod noop;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::errors::MonitorError;

/// Lock service contract
#[async_trait]
pub trait DistributedLockService: Send + Sync {
    /// Whether cross-instance locking is active at all
    fn is_enabled(&self) -> bool;

    /// Try to obtain exclusive ownership of `resource_key` within `timeout`.
    ///
    /// Returns `None` on denial, broker failure, timeout or cancellation.
    async fn try_acquire_lock(
        &self,
        resource_key: &str,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Option<DistributedLock>;
}

/// Gives a lease back to whoever granted it
#[async_trait]
pub trait LockReleaser: Send + Sync {
    async fn release(&self, resource_key: &str, lease_id: &str) -> Result<(), MonitorError>;
}

/// A granted lease on one resource key.
///
/// Call [`DistributedLock::release`] when the guarded section ends. If the
/// value is dropped without it (early return, panic unwinding) the lease is
/// released in the background, and otherwise expires at the broker.
///
/// [`lease_token`](DistributedLock::lease_token) is cancelled once the lease
/// is known to be lost; work guarded by the lock must stop then.
pub struct DistributedLock {
    resource_key: String,
    lease_id: String,
    expires_at: DateTime<Utc>,
    releaser: Option<Arc<dyn LockReleaser>>,
    keepalive: Option<DropGuard>,
    lease: CancellationToken,
}

impl DistributedLock {
    pub fn new(
        resource_key: impl Into<String>,
        lease_id: impl Into<String>,
        expires_at: DateTime<Utc>,
        releaser: Arc<dyn LockReleaser>,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            lease_id: lease_id.into(),
            expires_at,
            releaser: Some(releaser),
            keepalive: None,
            lease: CancellationToken::new(),
        }
    }

    /// Use `lease` as the lost-lease signal
    pub fn with_lease(mut self, lease: CancellationToken) -> Self {
        self.lease = lease;
        self
    }

    /// Cancelled when the lease is lost
    pub fn lease_token(&self) -> CancellationToken {
        self.lease.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lease.is_cancelled()
    }

    /// Attach a lease renewal task that stops when the lock goes away
    pub fn with_keepalive(mut self, keepalive: CancellationToken) -> Self {
        self.keepalive = Some(keepalive.drop_guard());
        self
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Release the lease now
    pub async fn release(mut self) {
        self.keepalive.take();
        if let Some(releaser) = self.releaser.take() {
            match releaser.release(&self.resource_key, &self.lease_id).await {
                Ok(()) => debug!("Released lock {}", self.resource_key),
                Err(e) => warn!(
                    "Failed to release lock {} (lease expires at {}): {}",
                    self.resource_key, self.expires_at, e
                ),
            }
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        self.keepalive.take();
        let Some(releaser) = self.releaser.take() else {
            return;
        };

        let resource_key = std::mem::take(&mut self.resource_key);
        let lease_id = std::mem::take(&mut self.lease_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = releaser.release(&resource_key, &lease_id).await {
                        warn!("Background release of lock {} failed: {}", resource_key, e);
                    }
                });
            }
            Err(_) => warn!(
                "Lock {} dropped outside of a runtime, lease will expire at {}",
                resource_key, self.expires_at
            ),
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("resource_key", &self.resource_key)
            .field("lease_id", &self.lease_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
