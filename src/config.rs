//! Paygrant configuration.

use crate::PaygrantError;
use secrecy::{ExposeSecret, Secret};
use std::path::PathBuf;
use std::time::Duration;

/// Default invoice amount in the gateway's base currency unit.
pub const DEFAULT_AMOUNT: u64 = 5000;

/// Configuration for the gateway client, storage backend and mode selection.
#[derive(Debug, Clone)]
pub struct PaygrantConfig {
    /// Gateway base URL (e.g. `https://gateway.example.com`), without trailing `/v2`.
    pub base_url: String,

    /// Gateway client id, used for Basic authentication on the token endpoint.
    pub client_id: Option<String>,

    /// Gateway client secret.
    pub client_secret: Option<Secret<String>>,

    /// Merchant invoice code sent with every invoice.
    pub invoice_code: Option<String>,

    /// Invoice receiver code sent with every invoice.
    pub invoice_receiver_code: String,

    /// Webhook URL the gateway calls on payment, if any.
    pub callback_url: Option<String>,

    /// Amount used when the caller does not supply one.
    pub default_amount: u64,

    /// Description used when the caller does not supply one.
    pub default_description: String,

    /// Use the file-backed store and the offline gateway when credentials are absent.
    pub mock_mode: bool,

    /// Postgres connection string for the transactional backend.
    pub database_url: Option<Secret<String>>,

    /// Location of the file-backed store document.
    /// Defaults to `dirs::data_dir()/paygrant/store.json`.
    pub store_path: Option<PathBuf>,

    /// Timeout applied to every gateway request.
    pub request_timeout: Duration,

    /// Page size requested from the payment check endpoint.
    pub payment_page_limit: u32,
}

impl Default for PaygrantConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            client_id: None,
            client_secret: None,
            invoice_code: None,
            invoice_receiver_code: "terminal".to_string(),
            callback_url: None,
            default_amount: DEFAULT_AMOUNT,
            default_description: "Service payment".to_string(),
            mock_mode: false,
            database_url: None,
            store_path: None,
            request_timeout: Duration::from_secs(30),
            payment_page_limit: 100,
        }
    }
}

impl PaygrantConfig {
    /// Load configuration from `PAYGRANT_*` environment variables and `DATABASE_URL`.
    pub fn from_env() -> Result<Self, PaygrantError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PaygrantError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(base_url) = get("PAYGRANT_GATEWAY_URL") {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        config.client_id = get("PAYGRANT_CLIENT_ID");
        config.client_secret = get("PAYGRANT_CLIENT_SECRET").map(Secret::new);
        config.invoice_code = get("PAYGRANT_INVOICE_CODE");
        if let Some(receiver) = get("PAYGRANT_RECEIVER_CODE") {
            config.invoice_receiver_code = receiver;
        }
        config.callback_url = get("PAYGRANT_CALLBACK_URL");
        if let Some(amount) = get("PAYGRANT_DEFAULT_AMOUNT") {
            config.default_amount = amount.parse().map_err(|e| {
                PaygrantError::ConfigError(format!("PAYGRANT_DEFAULT_AMOUNT is not a positive integer: {}", e))
            })?;
        }
        if let Some(flag) = get("PAYGRANT_MOCK_MODE") {
            config.mock_mode = parse_flag(&flag)?;
        }
        config.store_path = get("PAYGRANT_STORE_PATH").map(PathBuf::from);
        config.database_url = get("DATABASE_URL").map(Secret::new);

        Ok(config)
    }

    /// Client credentials, when both halves are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let id = self.client_id.as_deref().filter(|id| !id.is_empty())?;
        let secret = self
            .client_secret
            .as_ref()
            .map(|s| s.expose_secret().as_str())
            .filter(|s| !s.is_empty())?;
        Some((id, secret))
    }

    /// Whether the offline file-backed mode is active.
    ///
    /// Mock mode only takes effect while credentials are absent.
    pub fn is_mock(&self) -> bool {
        self.mock_mode && self.credentials().is_none()
    }

    /// Resolve the file store location.
    pub fn resolved_store_path(&self) -> Result<PathBuf, PaygrantError> {
        if let Some(path) = &self.store_path {
            return Ok(path.clone());
        }
        let base_dir = dirs::data_dir()
            .ok_or_else(|| PaygrantError::ConfigError("Could not find data directory".to_string()))?;
        Ok(base_dir.join("paygrant").join("store.json"))
    }

    /// Validate configuration for the selected mode.
    pub fn validate(&self) -> Result<(), PaygrantError> {
        if self.default_amount == 0 {
            return Err(PaygrantError::ConfigError(
                "default_amount must be positive".to_string(),
            ));
        }
        if self.is_mock() {
            return Ok(());
        }
        if self.base_url.is_empty() {
            return Err(PaygrantError::ConfigError(
                "base_url cannot be empty".to_string(),
            ));
        }
        if self.credentials().is_none() {
            return Err(PaygrantError::ConfigError(
                "client_id and client_secret are required".to_string(),
            ));
        }
        if self.invoice_code.as_deref().map_or(true, str::is_empty) {
            return Err(PaygrantError::ConfigError(
                "invoice_code cannot be empty".to_string(),
            ));
        }
        if self.database_url.is_none() {
            return Err(PaygrantError::ConfigError(
                "database_url is required outside mock mode".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Result<bool, PaygrantError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(PaygrantError::ConfigError(format!(
            "PAYGRANT_MOCK_MODE must be a boolean, got {:?}",
            other
        ))),
    }
}
