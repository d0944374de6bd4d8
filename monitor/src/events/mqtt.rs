//! MQTT event publisher

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::MonitorError;
use crate::events::EventPublisher;
use crate::models::event::RequestStatusChangedEvent;
use crate::storage::settings::MqttBrokerSettings;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Publishes status changes to `<prefix>/requests/<id>/status`
pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
}

impl MqttPublisher {
    /// Connect to the broker and drive its event loop until `shutdown` fires
    pub fn connect(
        broker: &MqttBrokerSettings,
        client_id: &str,
        topic_prefix: &str,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), MonitorError> {
        if broker.host.is_empty() {
            return Err(MonitorError::ConfigError("MQTT host is not configured".to_string()));
        }

        let mut options = MqttOptions::new(client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&broker.username, &broker.password) {
            options.set_credentials(username, password);
        }

        if broker.tls {
            use rumqttc::{TlsConfiguration, Transport};
            use rustls::ClientConfig;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = broker.ca_cert_path {
                let ca_pem = std::fs::read(ca_path).map_err(|e| {
                    MonitorError::ConfigError(format!("Failed to read CA cert {ca_path}: {e}"))
                })?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let handle = tokio::spawn(drive_event_loop(eventloop, shutdown));

        info!("Publishing request events to MQTT broker {}:{}", broker.host, broker.port);
        Ok((
            Self {
                client,
                topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            },
            handle,
        ))
    }

    /// Topic for a request's status changes
    pub fn status_topic(&self, request_id: i64) -> String {
        format!("{}/requests/{}/status", self.topic_prefix, request_id)
    }
}

#[async_trait]
impl EventPublisher for MqttPublisher {
    async fn publish_request_status_changed(
        &self,
        event: RequestStatusChangedEvent,
    ) -> Result<(), MonitorError> {
        let topic = self.status_topic(event.request_id);
        let payload = serde_json::to_vec(&event)?;

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| MonitorError::EventError(e.to_string()))?;

        debug!("Published status {} to: {}", event.new_status, topic);
        Ok(())
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, shutdown: CancellationToken) {
    let cooldown = CooldownOptions::default();
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("MQTT event loop stopping");
                return;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected");
                    failures = 0;
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => debug!("MQTT publish {} acknowledged", ack.pkid),
                Ok(_) => {}
                Err(e) => {
                    let delay = calc_exp_backoff(&cooldown, failures);
                    failures = failures.saturating_add(1);
                    warn!("MQTT connection error: {}, retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
