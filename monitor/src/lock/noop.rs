//! Lock service for single-instance deployments

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::lock::{DistributedLock, DistributedLockService};

/// Disabled lock service.
///
/// Never grants a lock. Callers check [`DistributedLockService::is_enabled`]
/// and skip locking entirely instead of reading `None` as a denial.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockService;

#[async_trait]
impl DistributedLockService for NoopLockService {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn try_acquire_lock(
        &self,
        _resource_key: &str,
        _timeout: Duration,
        _token: &CancellationToken,
    ) -> Option<DistributedLock> {
        None
    }
}
