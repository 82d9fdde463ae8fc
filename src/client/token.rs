//! Bearer token cache fronting the gateway's token endpoint.
//!
//! The cache holds one token and refreshes it lazily once it is within
//! [`EXPIRY_MARGIN_SECS`] of expiring. Refreshes are not single-flighted:
//! concurrent callers that all see an expired token each fetch one, and the
//! last write wins. Tokens are interchangeable, so that only costs requests.

use crate::clock::Clock;
use crate::protocol::models::{parse_success, TokenResponse};
use crate::PaygrantError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Seconds shaved off the gateway-reported lifetime.
pub const EXPIRY_MARGIN_SECS: i64 = 60;

/// Cached bearer token.
#[derive(Clone)]
pub struct AccessToken {
    value: Arc<str>,
    /// Instant after which the token is no longer handed out.
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Build a token from a gateway lifetime, applying the safety margin.
    ///
    /// # Errors
    /// - `AuthError` - the lifetime does not fit in a timestamp
    pub fn from_lifetime(
        value: &str,
        expires_in_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, PaygrantError> {
        let usable = expires_in_secs.saturating_sub(EXPIRY_MARGIN_SECS);
        let expires_at = ChronoDuration::try_seconds(usable)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| PaygrantError::AuthError("token lifetime out of range".to_string()))?;
        Ok(Self {
            value: Arc::from(value),
            expires_at,
        })
    }

    /// Whether the token can still be used at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Token value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Something that can exchange credentials for a fresh token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch a new token and its lifetime.
    async fn fetch_token(&self) -> Result<TokenResponse, PaygrantError>;
}

/// The gateway's `POST /v2/auth/token` endpoint.
pub struct TokenEndpoint {
    client: Client,
    url: String,
    credentials: Option<(String, Secret<String>)>,
}

impl TokenEndpoint {
    /// Create an endpoint against `base_url`.
    ///
    /// Credentials may be absent; fetching then fails with `ConfigError`
    /// before any request is made.
    pub fn new(client: Client, base_url: &str, credentials: Option<(&str, &str)>) -> Self {
        Self {
            client,
            url: format!("{}/v2/auth/token", base_url.trim_end_matches('/')),
            credentials: credentials.map(|(id, secret)| (id.to_string(), Secret::new(secret.to_string()))),
        }
    }
}

/// Format a Basic authorization header value.
pub fn basic_auth_header(client_id: &str, client_secret: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", client_id, client_secret))
    )
}

#[async_trait]
impl TokenSource for TokenEndpoint {
    async fn fetch_token(&self) -> Result<TokenResponse, PaygrantError> {
        let (client_id, client_secret) = self.credentials.as_ref().ok_or_else(|| {
            PaygrantError::ConfigError("Gateway client credentials are not configured".to_string())
        })?;

        let response = self
            .client
            .post(&self.url)
            .header(
                AUTHORIZATION,
                basic_auth_header(client_id, client_secret.expose_secret()),
            )
            .send()
            .await
            .map_err(|e| PaygrantError::AuthError(format!("Token request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PaygrantError::AuthError(format!("Failed to read token body: {}", e)))?;

        if !(200..300).contains(&status) {
            tracing::warn!(status, "Gateway token exchange rejected");
            return Err(PaygrantError::AuthError(format!(
                "Token endpoint returned HTTP {}",
                status
            )));
        }

        parse_success::<TokenResponse>(status, &body)
            .map_err(|_| PaygrantError::AuthError("Unparsable token response".to_string()))
    }
}

/// Process-wide cache for the gateway bearer token.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    slot: RwLock<Option<AccessToken>>,
}

impl TokenCache {
    /// Create an empty cache over `source`.
    pub fn new(source: Arc<dyn TokenSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            clock,
            slot: RwLock::new(None),
        }
    }

    /// Return a usable bearer token, refreshing it if absent or expired.
    ///
    /// On failure the cached entry is left as it was.
    pub async fn get(&self) -> Result<String, PaygrantError> {
        let now = self.clock.now_utc();
        if let Some(token) = self.slot.read().await.as_ref() {
            if token.is_fresh(now) {
                tracing::debug!(expires_at = %token.expires_at, "Gateway token cache hit");
                return Ok(token.value().to_string());
            }
        }

        // The read guard is released before the network call, so concurrent
        // callers may refresh in parallel.
        let fetched = self.source.fetch_token().await?;
        if fetched.access_token.is_empty() {
            return Err(PaygrantError::AuthError(
                "Token response carried an empty access_token".to_string(),
            ));
        }

        let token = AccessToken::from_lifetime(
            &fetched.access_token,
            fetched.expires_in,
            self.clock.now_utc(),
        )?;
        tracing::debug!(expires_at = %token.expires_at, "Gateway token refreshed");

        let value = token.value().to_string();
        *self.slot.write().await = Some(token);
        Ok(value)
    }

    /// Drop the cached token so the next `get` refreshes.
    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
    }

    /// Current cache entry, if any.
    pub async fn peek(&self) -> Option<AccessToken> {
        self.slot.read().await.clone()
    }
}
