//! OAuth access token for the lock broker

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Tokens are treated as expired this long before their real expiry
const EXPIRY_SKEW_SECS: i64 = 30;

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// Token endpoint response (RFC 6749 section 5.1)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,

    #[serde(default)]
    pub token_type: Option<String>,

    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// A bearer token with its expiry
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// Raw bearer value
    pub raw: String,

    pub issued_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Build a token from the endpoint response
    pub fn from_response(response: TokenResponse) -> Self {
        let issued_at = Utc::now();
        let lifetime = response
            .expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_LIFETIME_SECS);

        Self {
            raw: response.access_token,
            issued_at,
            expires_at: issued_at + Duration::seconds(lifetime),
        }
    }

    /// Check if the token is expired (or about to be)
    pub fn is_expired(&self) -> bool {
        self.expires_within(EXPIRY_SKEW_SECS)
    }

    /// Check if the token expires within the given number of seconds
    pub fn expires_within(&self, seconds: i64) -> bool {
        self.expires_at < Utc::now() + Duration::seconds(seconds)
    }

    /// Get time until expiration in seconds
    pub fn time_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiry_from_response() {
        let token = AccessToken::from_response(TokenResponse {
            access_token: "abc".to_string(),
            token_type: Some("Bearer".to_string()),
            expires_in: Some(600),
        });

        assert!(!token.is_expired());
        assert!(token.expires_within(601));
        assert!(token.time_until_expiry() <= 600);
    }

    #[test]
    fn test_short_lived_token_counts_as_expired() {
        let token = AccessToken::from_response(TokenResponse {
            access_token: "abc".to_string(),
            token_type: None,
            expires_in: Some(5),
        });

        assert!(token.is_expired());
    }

    #[test]
    fn test_missing_lifetime_uses_default() {
        let token = AccessToken::from_response(TokenResponse {
            access_token: "abc".to_string(),
            token_type: None,
            expires_in: None,
        });

        assert!(token.time_until_expiry() > 3000);
    }
}
