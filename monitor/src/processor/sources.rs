//! In-flight request cancellation sources

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Cancellation tokens of the requests this instance is executing, by id.
///
/// Cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct CancellationSources {
    tokens: Arc<DashMap<i64, CancellationToken>>,
}

impl CancellationSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `token` for `request_id`; returns false if the id is already tracked
    pub fn add(&self, request_id: i64, token: CancellationToken) -> bool {
        match self.tokens.entry(request_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token);
                true
            }
        }
    }

    pub fn remove(&self, request_id: i64) {
        self.tokens.remove(&request_id);
    }

    /// Cancel the request if it runs here; returns whether it did
    pub fn cancel(&self, request_id: i64) -> bool {
        match self.tokens.get(&request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, request_id: i64) -> bool {
        self.tokens.contains_key(&request_id)
    }

    /// Ids of in-flight requests, sorted
    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.tokens.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
