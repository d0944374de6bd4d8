//! Status change notifications

pub mod broadcast;
pub mod mqtt;

use async_trait::async_trait;

use crate::errors::MonitorError;
use crate::models::event::RequestStatusChangedEvent;

/// Sink for request status changes, consumed by the notification and UI layers
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_request_status_changed(
        &self,
        event: RequestStatusChangedEvent,
    ) -> Result<(), MonitorError>;
}
