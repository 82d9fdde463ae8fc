//! Payment gateway clients.

pub mod http;
pub mod mock;
pub mod token;

use crate::protocol::models::{InvoiceLink, PaymentCheckResult};
use crate::PaygrantError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;

/// Invoice summary handed back to the caller after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedInvoice {
    /// Gateway invoice id.
    pub invoice_id: String,
    /// QR payload.
    pub qr_text: String,
    /// Base64 QR image.
    pub qr_image: String,
    /// App deep links.
    pub urls: Vec<InvoiceLink>,
    /// Idempotency key sent with the creation request.
    pub sender_invoice_no: String,
    /// Invoiced amount.
    pub amount: u64,
}

/// Upstream operations the broker needs from a gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create an invoice for `amount`.
    async fn create_invoice(
        &self,
        amount: u64,
        description: &str,
    ) -> Result<CreatedInvoice, PaygrantError>;

    /// Check whether any payment against the invoice is settled.
    async fn check_payment(&self, invoice_id: &str) -> Result<PaymentCheckResult, PaygrantError>;
}

/// Generate a sender invoice number: millisecond timestamp plus a random suffix,
/// so retried creation calls are distinguishable upstream.
pub fn sender_invoice_no(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}-{}", now.timestamp_millis(), suffix.to_ascii_lowercase())
}
