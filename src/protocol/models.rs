//! Gateway request/response schemas and boundary parsing.
//!
//! Every response is validated against an explicit schema here. Any parse or
//! shape failure collapses to [`PaygrantError::UpstreamError`] carrying the raw
//! body, so nothing loosely typed leaks past this module.

use crate::PaygrantError;
use serde::{Deserialize, Serialize};

/// Payment status string the gateway reports for a settled payment.
pub const PAID_STATUS: &str = "PAID";

/// Object type used when checking payments against an invoice.
pub const INVOICE_OBJECT_TYPE: &str = "INVOICE";

/// `POST /v2/auth/token` response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Bearer token value.
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: i64,
}

/// `POST /v2/invoice` request body.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceRequest<'a> {
    /// Merchant invoice code.
    pub invoice_code: &'a str,
    /// Idempotency key for this creation attempt.
    pub sender_invoice_no: &'a str,
    /// Receiver code.
    pub invoice_receiver_code: &'a str,
    /// Human readable description.
    pub invoice_description: &'a str,
    /// Amount in the gateway's base currency unit.
    pub amount: u64,
    /// Payment webhook.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<&'a str>,
}

/// Deep link into a payment app, as returned with a new invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLink {
    /// App identifier.
    #[serde(default)]
    pub name: String,
    /// Display name.
    #[serde(default)]
    pub description: Option<String>,
    /// Logo URL.
    #[serde(default)]
    pub logo: Option<String>,
    /// Deep link.
    pub link: String,
}

/// `POST /v2/invoice` response.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceResponse {
    /// Gateway invoice id.
    pub invoice_id: String,
    /// QR payload.
    #[serde(default)]
    pub qr_text: String,
    /// Base64 QR image.
    #[serde(default)]
    pub qr_image: String,
    /// App deep links.
    #[serde(default)]
    pub urls: Vec<InvoiceLink>,
}

/// Pagination for the payment check request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PageOffset {
    /// 1-based page number.
    pub page_number: u32,
    /// Rows per page.
    pub page_limit: u32,
}

/// `POST /v2/payment/check` request body.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentCheckRequest<'a> {
    /// Always `INVOICE`.
    pub object_type: &'static str,
    /// Invoice id.
    pub object_id: &'a str,
    /// Requested page.
    pub offset: PageOffset,
}

/// A single payment row.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentRow {
    /// Payment status, `PAID` once settled.
    pub payment_status: String,
    /// Gateway payment id.
    #[serde(default)]
    pub payment_id: Option<String>,
}

impl PaymentRow {
    /// Whether this row reports a settled payment.
    pub fn is_paid(&self) -> bool {
        self.payment_status.eq_ignore_ascii_case(PAID_STATUS)
    }
}

/// `POST /v2/payment/check` response: a page of rows or a single row.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PaymentCheckResponse {
    /// Paginated listing.
    Rows {
        /// Payment rows on this page.
        rows: Vec<PaymentRow>,
        /// Total row count, when reported.
        #[serde(default)]
        count: Option<u64>,
    },
    /// Single payment object.
    Single(PaymentRow),
}

impl PaymentCheckResponse {
    /// True if any row reports a paid status.
    pub fn any_paid(&self) -> bool {
        match self {
            Self::Rows { rows, .. } => rows.iter().any(PaymentRow::is_paid),
            Self::Single(row) => row.is_paid(),
        }
    }
}

/// Error body the gateway returns on failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayErrorBody {
    /// Error code.
    #[serde(default)]
    pub error: Option<String>,
    /// Human readable message.
    #[serde(default)]
    pub message: Option<String>,
}

impl GatewayErrorBody {
    /// Best message available: `message`, then `error`.
    pub fn best_message(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or(self.error.as_deref())
            .filter(|m| !m.is_empty())
    }
}

/// Result of a payment check. Transient, never persisted.
#[derive(Debug, Clone)]
pub struct PaymentCheckResult {
    /// Whether any payment against the invoice is settled.
    pub paid: bool,
    /// Upstream response as received.
    pub raw: serde_json::Value,
}

/// Parse a success body into `T`, collapsing failures into `UpstreamError`.
pub fn parse_success<T: serde::de::DeserializeOwned>(
    status: u16,
    body: &str,
) -> Result<T, PaygrantError> {
    serde_json::from_str(body).map_err(|e| {
        PaygrantError::upstream(
            Some(status),
            format!("Malformed gateway response: {}", e),
            body,
        )
    })
}

/// Build an `UpstreamError` for a non-success response.
pub fn upstream_failure(status: u16, body: &str) -> PaygrantError {
    let parsed: GatewayErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .best_message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("Gateway returned HTTP {}", status));
    PaygrantError::upstream(Some(status), message, body)
}

/// Parse a payment check body into a [`PaymentCheckResult`].
pub fn parse_payment_check(status: u16, body: &str) -> Result<PaymentCheckResult, PaygrantError> {
    let raw: serde_json::Value = parse_success(status, body)?;
    let response: PaymentCheckResponse = serde_json::from_value(raw.clone()).map_err(|e| {
        PaygrantError::upstream(
            Some(status),
            format!("Unexpected payment check shape: {}", e),
            body,
        )
    })?;

    Ok(PaymentCheckResult {
        paid: response.any_paid(),
        raw,
    })
}
