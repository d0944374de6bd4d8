//! Token manager for lock broker authentication

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::authn::access_token::{AccessToken, TokenResponse};
use crate::errors::MonitorError;
use crate::storage::settings::OAuthSettings;

/// Token manager trait for testability
#[async_trait]
pub trait TokenManagerExt: Send + Sync {
    /// Get a usable token, fetching a new one when the cached one expired
    async fn get_token(&self) -> Result<AccessToken, MonitorError>;

    /// Fetch a new token from the token endpoint
    async fn refresh_token(&self) -> Result<AccessToken, MonitorError>;
}

/// OAuth2 client-credentials token manager
pub struct TokenManager {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    scope: Option<String>,
    cached_token: RwLock<Option<AccessToken>>,
}

impl TokenManager {
    /// Create a new token manager; no token is fetched until first use
    pub fn new(http: Client, settings: &OAuthSettings) -> Result<Self, MonitorError> {
        if settings.client_id.is_empty() {
            return Err(MonitorError::ConfigError(
                "OAuth client_id is not configured".to_string(),
            ));
        }

        url::Url::parse(&settings.token_url).map_err(|e| {
            MonitorError::ConfigError(format!("Invalid token url {}: {}", settings.token_url, e))
        })?;

        Ok(Self {
            http,
            token_url: settings.token_url.clone(),
            client_id: settings.client_id.clone(),
            client_secret: SecretString::from(settings.client_secret.clone()),
            scope: settings.scope.clone(),
            cached_token: RwLock::new(None),
        })
    }

    async fn request_token(&self) -> Result<AccessToken, MonitorError> {
        debug!("POST {} (client credentials)", self.token_url);

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.expose_secret().to_string()),
        ];
        if let Some(scope) = &self.scope {
            form.push(("scope", scope.clone()));
        }

        let response = self.http.post(&self.token_url).form(&form).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Token request failed: {} - {}", status, body);
            let message = format!("Token request failed: {} - {}", status, body);
            return Err(match status.as_u16() {
                400 | 401 | 403 => MonitorError::AuthError(message),
                _ => MonitorError::TokenError(message),
            });
        }

        let body: TokenResponse = response.json().await?;
        Ok(AccessToken::from_response(body))
    }
}

#[async_trait]
impl TokenManagerExt for TokenManager {
    async fn get_token(&self) -> Result<AccessToken, MonitorError> {
        {
            let cached = self.cached_token.read().await;
            if let Some(token) = cached.as_ref() {
                if !token.is_expired() {
                    return Ok(token.clone());
                }
            }
        }

        self.refresh_token().await
    }

    async fn refresh_token(&self) -> Result<AccessToken, MonitorError> {
        info!("Refreshing broker access token...");

        let token = self.request_token().await?;

        let mut cached = self.cached_token.write().await;
        *cached = Some(token.clone());

        info!("Token refreshed successfully, expires at: {}", token.expires_at);
        Ok(token)
    }
}
