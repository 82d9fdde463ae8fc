//! Paygrant error types.

use thiserror::Error;

/// Errors that can occur while paying for, issuing, or redeeming grants.
#[derive(Debug, Error)]
pub enum PaygrantError {
    /// Configuration is invalid or a required value is missing.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Token exchange with the gateway failed.
    #[error("Gateway authentication failed: {0}")]
    AuthError(String),

    /// The gateway answered with a non-success status or a malformed body.
    #[error("Upstream error: {message}")]
    UpstreamError {
        /// HTTP status code, when a response was received.
        status: Option<u16>,
        /// Gateway-supplied message when present, otherwise a description.
        message: String,
        /// Raw response body for diagnostics.
        body: String,
    },

    /// HTTP transport error communicating with the gateway.
    #[error("Gateway transport error: {0}")]
    GatewayTransport(String),

    /// No grant exists for the token.
    #[error("Grant token is not valid")]
    GrantInvalid,

    /// The grant has no remaining uses.
    #[error("Grant has already been used")]
    GrantExhausted,

    /// Required input is missing or malformed.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The invoice is unknown to the store.
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    /// A grant transition was requested from a state that does not allow it.
    #[error("Cannot {action} a grant in status {status}")]
    GrantTransition {
        /// The requested transition.
        action: &'static str,
        /// The grant's current status.
        status: crate::store::records::GrantStatus,
    },

    /// Storage backend I/O error.
    #[error("Store error: {0}")]
    StoreIO(String),
}

impl PaygrantError {
    /// Build an upstream error from a raw response body.
    pub(crate) fn upstream(status: Option<u16>, message: impl Into<String>, body: impl Into<String>) -> Self {
        Self::UpstreamError {
            status,
            message: message.into(),
            body: body.into(),
        }
    }
}
