//! Error types for the deployment monitor

use thiserror::Error;

use crate::models::request::RequestStatus;

/// Main error type for the deployment monitor
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Token error: {0}")]
    TokenError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Event publishing error: {0}")]
    EventError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Invalid status transition for request {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
