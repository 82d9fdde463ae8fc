//! Grant broker - the main public API for Paygrant.
//!
//! The `GrantBroker` ties the gateway and the store together:
//! - Invoice creation and payment polling (`create_invoice`, `check`, `callback`)
//! - Idempotent grant issuance once a payment is confirmed
//! - Single-use redemption via `reserve` / `complete` / `release`
//!
//! Consumers bracket costed work with `reserve` before it starts, `complete`
//! after it fully succeeds, and `release` on any failure so the paid use is
//! not lost. [`GrantBroker::redeem`] does this bracketing for a closure.

use crate::client::http::GatewayClient;
use crate::client::mock::MockGateway;
use crate::client::{CreatedInvoice, PaymentGateway};
use crate::clock::{Clock, SystemClock};
use crate::config::PaygrantConfig;
use crate::store::file::FileStore;
use crate::store::postgres::PostgresStore;
use crate::store::records::{token_fingerprint, Grant, GrantResult, Invoice, InvoiceStatus};
use crate::store::GrantStore;
use crate::PaygrantError;
use secrecy::ExposeSecret;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Connections opened for the transactional backend.
const POSTGRES_MAX_CONNECTIONS: u32 = 10;

/// Result of a payment status check: `{paid, grantToken}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatus {
    /// Whether the invoice is paid.
    pub paid: bool,
    /// Grant for the paid invoice; `None` while unpaid.
    pub grant_token: Option<String>,
}

/// Main grant broker.
///
/// Create one instance per process and share it between request handlers.
pub struct GrantBroker {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn GrantStore>,
    clock: Arc<dyn Clock>,
    default_amount: u64,
    default_description: String,
}

impl GrantBroker {
    /// Create a broker over explicit components.
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn GrantStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let defaults = PaygrantConfig::default();
        Self {
            gateway,
            store,
            clock,
            default_amount: defaults.default_amount,
            default_description: defaults.default_description,
        }
    }

    /// Set the amount and description used when callers omit them.
    pub fn with_defaults(mut self, amount: u64, description: impl Into<String>) -> Self {
        self.default_amount = amount;
        self.default_description = description.into();
        self
    }

    /// Build a broker for the mode selected by `config`.
    ///
    /// Mock mode wires the file store and the offline gateway; otherwise the
    /// Postgres store (migrated on connect) and the HTTP gateway client.
    ///
    /// # Errors
    /// - `ConfigError` - configuration is incomplete for the selected mode
    /// - `StoreIO` - the database is unreachable or migrations fail
    pub async fn from_config(config: &PaygrantConfig) -> Result<Self, PaygrantError> {
        Self::from_config_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Build a broker from config with a custom clock (for testing).
    pub async fn from_config_with_clock(
        config: &PaygrantConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PaygrantError> {
        config.validate()?;

        let gateway: Arc<dyn PaymentGateway>;
        let store: Arc<dyn GrantStore>;
        if config.is_mock() {
            let path = config.resolved_store_path()?;
            tracing::warn!(
                path = %path.display(),
                "Mock mode: file-backed store and offline gateway in use"
            );
            gateway = Arc::new(MockGateway::new(clock.clone(), true));
            store = Arc::new(FileStore::new(path));
        } else {
            let database_url = config.database_url.as_ref().ok_or_else(|| {
                PaygrantError::ConfigError("database_url is required outside mock mode".to_string())
            })?;
            gateway = Arc::new(GatewayClient::new(config, clock.clone())?);
            store = Arc::new(
                PostgresStore::connect(database_url.expose_secret(), POSTGRES_MAX_CONNECTIONS).await?,
            );
        }

        Ok(Self::new(gateway, store, clock)
            .with_defaults(config.default_amount, config.default_description.clone()))
    }

    /// Create an invoice upstream and record it locally.
    ///
    /// # Errors
    /// - `ValidationError` - amount is zero
    /// - `ConfigError` / `AuthError` / `UpstreamError` / `GatewayTransport` - gateway failure
    /// - `StoreIO` - the invoice could not be recorded
    pub async fn create_invoice(
        &self,
        amount: Option<u64>,
        description: Option<&str>,
    ) -> Result<CreatedInvoice, PaygrantError> {
        let amount = amount.unwrap_or(self.default_amount);
        if amount == 0 {
            return Err(PaygrantError::ValidationError(
                "amount must be a positive integer".to_string(),
            ));
        }
        let description = description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(&self.default_description);

        let created = self.gateway.create_invoice(amount, description).await?;

        let invoice = Invoice::created(
            created.invoice_id.clone(),
            created.sender_invoice_no.clone(),
            amount,
            self.clock.now_utc(),
        );
        self.store.put_invoice(&invoice).await?;

        tracing::info!(
            invoice_id = %created.invoice_id,
            sender_invoice_no = %created.sender_invoice_no,
            amount,
            "Invoice recorded"
        );
        Ok(created)
    }

    /// Check payment for an invoice; issue its grant once paid.
    ///
    /// Safe to call repeatedly: issuance is idempotent, so every call after
    /// payment returns the same grant token. Once an invoice holds a grant the
    /// gateway is not asked again.
    ///
    /// # Errors
    /// - `ValidationError` - empty invoice id
    /// - `InvoiceNotFound` - the invoice was not created through this broker
    /// - gateway or store failures
    pub async fn check(&self, invoice_id: &str) -> Result<PaymentStatus, PaygrantError> {
        let invoice_id = require("invoice_id", invoice_id)?;

        let Some(invoice) = self.store.get_invoice(invoice_id).await? else {
            return Err(PaygrantError::InvoiceNotFound(invoice_id.to_string()));
        };
        if invoice.status == InvoiceStatus::Paid {
            if let Some(token) = invoice.grant_token {
                tracing::debug!(
                    invoice_id,
                    grant = %token_fingerprint(&token),
                    "Invoice already holds a grant"
                );
                return Ok(PaymentStatus {
                    paid: true,
                    grant_token: Some(token),
                });
            }
        }

        let result = self.gateway.check_payment(invoice_id).await?;
        if !result.paid {
            tracing::debug!(invoice_id, "Invoice not yet paid");
            return Ok(PaymentStatus {
                paid: false,
                grant_token: None,
            });
        }

        let token = self.issue_grant_for_invoice(invoice_id).await?;
        Ok(PaymentStatus {
            paid: true,
            grant_token: Some(token),
        })
    }

    /// Webhook entry point for asynchronous payment notifications.
    ///
    /// Same semantics as [`check`](Self::check); the payment is confirmed with
    /// the gateway rather than trusted from the notification.
    pub async fn callback(&self, invoice_id: &str) -> Result<PaymentStatus, PaygrantError> {
        tracing::info!(invoice_id, "Payment callback received");
        self.check(invoice_id).await
    }

    /// Issue the grant for a paid invoice, or return the one it already has.
    ///
    /// The grant insert and the invoice update happen as one unit.
    pub async fn issue_grant_for_invoice(&self, invoice_id: &str) -> Result<String, PaygrantError> {
        let invoice_id = require("invoice_id", invoice_id)?;

        let issued = self
            .store
            .issue_grant(Grant::issue(invoice_id, self.clock.now_utc()))
            .await?;

        if issued.created {
            tracing::info!(
                invoice_id,
                grant = %token_fingerprint(&issued.token),
                "Grant issued"
            );
        } else {
            tracing::debug!(
                invoice_id,
                grant = %token_fingerprint(&issued.token),
                "Grant already issued for invoice"
            );
        }
        Ok(issued.token)
    }

    /// Claim the grant's single use before costed work.
    ///
    /// Returns `{ok:false, reason:INVALID}` for unknown tokens and
    /// `{ok:false, reason:USED}` when the use is reserved or spent.
    pub async fn reserve(&self, token: &str) -> Result<GrantResult, PaygrantError> {
        let token = require("grant token", token)?;
        let result = self.store.atomic_reserve(token, self.clock.now_utc()).await?;
        log_transition("reserve", token, &result);
        Ok(result)
    }

    /// Return a reserved grant to AVAILABLE after the costed work failed.
    ///
    /// # Errors
    /// - `GrantTransition` - the grant is already USED
    pub async fn release(&self, token: &str) -> Result<GrantResult, PaygrantError> {
        let token = require("grant token", token)?;
        let result = self.store.release(token, self.clock.now_utc()).await?;
        log_transition("release", token, &result);
        Ok(result)
    }

    /// Permanently spend a reserved grant after the costed work succeeded.
    ///
    /// # Errors
    /// - `GrantTransition` - the grant was never reserved
    pub async fn complete(&self, token: &str) -> Result<GrantResult, PaygrantError> {
        let token = require("grant token", token)?;
        let result = self.store.complete(token, self.clock.now_utc()).await?;
        log_transition("complete", token, &result);
        Ok(result)
    }

    /// Run `work` under a reservation: complete on success, release on failure.
    ///
    /// # Errors
    /// - `GrantInvalid` / `GrantExhausted` - the reservation was refused; `work` never runs
    /// - whatever `work` returns; the grant is released first
    pub async fn redeem<T, E, F, Fut>(&self, token: &str, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PaygrantError>,
    {
        self.reserve(token).await?.into_result()?;

        match work().await {
            Ok(value) => {
                self.complete(token).await?.into_result()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(release_err) = self.release(token).await {
                    tracing::error!(
                        grant = %token_fingerprint(token),
                        error = %release_err,
                        "Failed to release grant after downstream failure"
                    );
                }
                Err(err)
            }
        }
    }

    /// Return grants stuck in PROCESSING for longer than `max_age` to AVAILABLE.
    ///
    /// Not scheduled by this crate; run it from a periodic task if
    /// reservations can be abandoned. Returns how many grants were reclaimed.
    pub async fn reclaim_stale_reservations(&self, max_age: Duration) -> Result<usize, PaygrantError> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| PaygrantError::ValidationError(format!("max_age out of range: {}", e)))?;
        let now = self.clock.now_utc();

        let cutoff = now.checked_sub_signed(max_age).ok_or_else(|| {
            PaygrantError::ValidationError("max_age reaches past the earliest timestamp".to_string())
        })?;

        let reclaimed = self.store.reclaim_stale(cutoff, now).await?;
        for token in &reclaimed {
            tracing::warn!(grant = %token_fingerprint(token), "Stale reservation reclaimed");
        }
        Ok(reclaimed.len())
    }

    /// Look up a grant.
    pub async fn grant(&self, token: &str) -> Result<Option<Grant>, PaygrantError> {
        self.store.get_grant(token).await
    }

    /// Look up an invoice.
    pub async fn invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, PaygrantError> {
        self.store.get_invoice(invoice_id).await
    }
}

fn require<'a>(name: &str, value: &'a str) -> Result<&'a str, PaygrantError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PaygrantError::ValidationError(format!("{} is required", name)));
    }
    Ok(trimmed)
}

fn log_transition(action: &str, token: &str, result: &GrantResult) {
    if result.ok {
        tracing::info!(action, grant = %token_fingerprint(token), "Grant transition applied");
    } else {
        tracing::warn!(
            action,
            grant = %token_fingerprint(token),
            reason = ?result.reason,
            "Grant transition refused"
        );
    }
}
