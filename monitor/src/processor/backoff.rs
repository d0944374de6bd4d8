//! Per-environment lock backoff

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Remembers, per resource key, until when lock attempts are pointless.
///
/// Entries live in memory only. A failed attempt records `now + interval`,
/// a successful one clears the entry.
#[derive(Debug)]
pub struct LockBackoff {
    not_before: DashMap<String, Instant>,
    interval: Duration,
}

impl LockBackoff {
    pub fn new(interval: Duration) -> Self {
        Self {
            not_before: DashMap::new(),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether `resource_key` is still inside its backoff window
    pub fn is_backed_off(&self, resource_key: &str) -> bool {
        let now = Instant::now();
        if let Some(not_before) = self.not_before.get(resource_key) {
            if *not_before > now {
                return true;
            }
        }
        self.not_before
            .remove_if(resource_key, |_, not_before| *not_before <= now);
        false
    }

    /// Start a backoff window for `resource_key`
    pub fn record_failure(&self, resource_key: &str) {
        self.not_before
            .insert(resource_key.to_string(), Instant::now() + self.interval);
    }

    /// Forget any backoff for `resource_key`
    pub fn clear(&self, resource_key: &str) {
        self.not_before.remove(resource_key);
    }

    /// Keys currently backed off, sorted
    pub fn active_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .not_before
            .iter()
            .filter(|entry| *entry.value() > now)
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }
}
