//! Settings file management

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Lock acquisition timeout used when the configured one is not positive
pub const DEFAULT_LOCK_TIMEOUT_MS: i64 = 5_000;

/// Token refresh interval used when the configured one is not positive
pub const DEFAULT_TOKEN_REFRESH_INTERVAL_SECS: i64 = 15 * 60;

/// Monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub log_json: bool,

    /// Also write logs to daily files in the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Name of this monitor instance, used as lock owner prefix
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Which partition this monitor serves
    #[serde(default)]
    pub is_prod: bool,

    /// High availability configuration
    #[serde(default)]
    pub ha: HaSettings,

    /// Request storage configuration
    #[serde(default)]
    pub persistence: PersistenceSettings,

    /// Event publishing configuration
    #[serde(default)]
    pub events: EventSettings,

    /// Polling intervals of the monitor workers
    #[serde(default)]
    pub workers: WorkerSettings,

    /// Script execution defaults
    #[serde(default)]
    pub scripts: ScriptSettings,

    /// Enable local status server
    #[serde(default = "default_true")]
    pub enable_status_server: bool,

    #[serde(default)]
    pub status_server: StatusServerSettings,
}

fn default_true() -> bool {
    true
}

fn default_instance_name() -> String {
    "monitor".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            instance_name: default_instance_name(),
            is_prod: false,
            ha: HaSettings::default(),
            persistence: PersistenceSettings::default(),
            events: EventSettings::default(),
            workers: WorkerSettings::default(),
            scripts: ScriptSettings::default(),
            enable_status_server: true,
            status_server: StatusServerSettings::default(),
        }
    }
}

/// High availability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaSettings {
    /// Coordinate with other monitors through the lock broker
    #[serde(default)]
    pub enabled: bool,

    /// Lock broker connection
    #[serde(default)]
    pub broker: BrokerSettings,

    /// Lock acquisition behaviour
    #[serde(default)]
    pub lock: LockSettings,

    /// Broker authentication
    #[serde(default)]
    pub oauth: OAuthSettings,
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: BrokerSettings::default(),
            lock: LockSettings::default(),
            oauth: OAuthSettings::default(),
        }
    }
}

/// Lock broker connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Base URL of the lock broker API
    #[serde(default = "default_broker_url")]
    pub base_url: String,

    /// Request timeout for broker calls in seconds
    #[serde(default = "default_broker_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_broker_url() -> String {
    "http://localhost:8500/api/v1".to_string()
}

fn default_broker_request_timeout() -> u64 {
    10
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            base_url: default_broker_url(),
            request_timeout_secs: default_broker_request_timeout(),
        }
    }
}

/// Lock acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// Acquisition timeout in milliseconds, non-positive means default
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: i64,

    /// Do not retry a denied resource key for this long
    #[serde(default = "default_backoff_interval")]
    pub backoff_interval_secs: u64,

    /// Lease time-to-live requested from the broker
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

fn default_lock_timeout_ms() -> i64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_backoff_interval() -> u64 {
    30
}

fn default_lease_ttl() -> u64 {
    60
}

impl LockSettings {
    /// Effective acquisition timeout
    pub fn lock_timeout(&self) -> Duration {
        let ms = if self.lock_timeout_ms > 0 {
            self.lock_timeout_ms
        } else {
            DEFAULT_LOCK_TIMEOUT_MS
        };
        Duration::from_millis(ms as u64)
    }

    pub fn backoff_interval(&self) -> Duration {
        Duration::from_secs(self.backoff_interval_secs)
    }

    /// Effective lease ttl, never shorter than one second
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(1))
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            backoff_interval_secs: default_backoff_interval(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

/// OAuth client credentials for the lock broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSettings {
    /// Token endpoint
    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default)]
    pub scope: Option<String>,

    /// Refresh interval in seconds, non-positive means default
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval_secs: i64,
}

fn default_token_url() -> String {
    "http://localhost:8500/oauth/token".to_string()
}

fn default_token_refresh_interval() -> i64 {
    DEFAULT_TOKEN_REFRESH_INTERVAL_SECS
}

impl OAuthSettings {
    /// Effective token refresh interval
    pub fn refresh_interval(&self) -> Duration {
        let secs = if self.token_refresh_interval_secs > 0 {
            self.token_refresh_interval_secs
        } else {
            DEFAULT_TOKEN_REFRESH_INTERVAL_SECS
        };
        Duration::from_secs(secs as u64)
    }
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: None,
            token_refresh_interval_secs: default_token_refresh_interval(),
        }
    }
}

/// Which request store backs the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceKind {
    /// In-process store seeded from the requests file (single instance only)
    Memory,

    /// Remote requests API
    Http,
}

/// Request storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSettings {
    #[serde(default = "default_persistence_kind")]
    pub kind: PersistenceKind,

    /// Base URL of the requests API
    #[serde(default = "default_persistence_url")]
    pub base_url: String,

    /// Bearer token for the requests API
    #[serde(default)]
    pub api_token: String,
}

fn default_persistence_kind() -> PersistenceKind {
    PersistenceKind::Memory
}

fn default_persistence_url() -> String {
    "http://localhost:8000/api/v1".to_string()
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            kind: default_persistence_kind(),
            base_url: default_persistence_url(),
            api_token: String::new(),
        }
    }
}

/// Event publishing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Publish status changes to the MQTT broker instead of in-process only
    #[serde(default)]
    pub mqtt_enabled: bool,

    #[serde(default)]
    pub mqtt_broker: MqttBrokerSettings,

    /// Topic prefix for status change events
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String {
    "deploymon".to_string()
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            mqtt_enabled: false,
            mqtt_broker: MqttBrokerSettings::default(),
            topic_prefix: default_topic_prefix(),
        }
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBrokerSettings {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_host() -> String {
    "".to_string()
}

fn default_mqtt_port() -> u16 {
    8883
}

impl Default for MqttBrokerSettings {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
        }
    }
}

/// Worker polling intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_execute_interval")]
    pub execute_interval_secs: u64,

    #[serde(default = "default_restart_interval")]
    pub restart_interval_secs: u64,

    #[serde(default = "default_cancel_interval")]
    pub cancel_interval_secs: u64,
}

fn default_execute_interval() -> u64 {
    5
}

fn default_restart_interval() -> u64 {
    5
}

fn default_cancel_interval() -> u64 {
    2
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            execute_interval_secs: default_execute_interval(),
            restart_interval_secs: default_restart_interval(),
            cancel_interval_secs: default_cancel_interval(),
        }
    }
}

/// Script execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptSettings {
    /// Default step timeout in seconds, 0 disables it
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    /// How often a running step re-reads its request status, in milliseconds
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval_ms: u64,
}

fn default_step_timeout() -> u64 {
    3600
}

fn default_status_poll_interval() -> u64 {
    2000
}

impl ScriptSettings {
    /// Effective status poll interval, never below 100ms
    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms.max(100))
    }
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            status_poll_interval_ms: default_status_poll_interval(),
        }
    }
}

/// Local status server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusServerSettings {
    #[serde(default = "default_status_host")]
    pub host: String,

    #[serde(default = "default_status_port")]
    pub port: u16,
}

fn default_status_host() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    8090
}

impl Default for StatusServerSettings {
    fn default() -> Self {
        Self {
            host: default_status_host(),
            port: default_status_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_settings_use_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert!(!settings.ha.enabled);
        assert_eq!(settings.ha.lock.lock_timeout(), Duration::from_secs(5));
        assert_eq!(settings.ha.oauth.refresh_interval(), Duration::from_secs(900));
        assert_eq!(settings.persistence.kind, PersistenceKind::Memory);
    }

    #[test]
    fn test_non_positive_timeouts_fall_back_to_defaults() {
        let json = r#"{
            "ha": {
                "enabled": true,
                "lock": { "lock_timeout_ms": 0 },
                "oauth": { "token_refresh_interval_secs": -10 }
            }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.ha.lock.lock_timeout(), Duration::from_millis(5_000));
        assert_eq!(settings.ha.oauth.refresh_interval(), Duration::from_secs(900));
    }

    #[test]
    fn test_positive_timeouts_are_kept() {
        let json = r#"{
            "ha": {
                "lock": { "lock_timeout_ms": 1500 },
                "oauth": { "token_refresh_interval_secs": 60 }
            }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.ha.lock.lock_timeout(), Duration::from_millis(1500));
        assert_eq!(settings.ha.oauth.refresh_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_status_poll_interval_has_a_floor() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.scripts.status_poll_interval(), Duration::from_secs(2));

        let json = r#"{ "scripts": { "status_poll_interval_ms": 5 } }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.scripts.status_poll_interval(), Duration::from_millis(100));
    }
}
