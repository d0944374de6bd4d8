//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::MonitorError;

/// HTTP client for the deployment API
pub struct HttpClient {
    client: Client,
    base_url: String,
    api_token: Option<SecretString>,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MonitorError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: None,
        })
    }

    /// Authenticate every call with a static bearer token
    pub fn with_api_token(mut self, token: SecretString) -> Self {
        self.api_token = Some(token);
        self
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            ),
            None => request,
        }
    }

    async fn read<T: DeserializeOwned>(
        method: &str,
        url: &str,
        response: Response,
    ) -> Result<T, MonitorError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(MonitorError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("HTTP {} {} failed: {} - {}", method, url, status, body);
            return Err(MonitorError::PersistenceError(format!("{}: {}", status, body)));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        Ok(response.json().await?)
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, MonitorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self.authorize(self.client.get(&url)).send().await?;
        Self::read("GET", &url, response).await
    }

    /// Make a GET request with query parameters
    pub async fn get_with_query<T: DeserializeOwned, Q: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
    ) -> Result<T, MonitorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .authorize(self.client.get(&url).query(query))
            .send()
            .await?;
        Self::read("GET", &url, response).await
    }

    /// Make a POST request
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, MonitorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);

        let response = self
            .authorize(self.client.post(&url).json(body))
            .send()
            .await?;
        Self::read("POST", &url, response).await
    }

    /// Make a PUT request
    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, MonitorError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("PUT {}", url);

        let response = self
            .authorize(self.client.put(&url).json(body))
            .send()
            .await?;
        Self::read("PUT", &url, response).await
    }
}
