//! In-process event publisher

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::MonitorError;
use crate::events::EventPublisher;
use crate::models::event::RequestStatusChangedEvent;

/// Publishes status changes on a tokio broadcast channel
pub struct BroadcastPublisher {
    tx: broadcast::Sender<RequestStatusChangedEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RequestStatusChangedEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish_request_status_changed(
        &self,
        event: RequestStatusChangedEvent,
    ) -> Result<(), MonitorError> {
        let request_id = event.request_id;
        let new_status = event.new_status;
        // No subscribers is not an error
        match self.tx.send(event) {
            Ok(receivers) => debug!(
                "Request {} -> {} delivered to {} subscriber(s)",
                request_id, new_status, receivers
            ),
            Err(_) => debug!("Request {} -> {} (no subscribers)", request_id, new_status),
        }
        Ok(())
    }
}
