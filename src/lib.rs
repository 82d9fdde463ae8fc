//! # Paygrant
//!
//! **Pay once, redeem once.**
//!
//! Paygrant sits between a payment gateway and cost-gated processing. A client
//! pays an invoice, receives a single-use capability token (a *grant*), and
//! redeems it exactly once. If the downstream work fails after payment was
//! confirmed, the grant is released back instead of being lost.
//!
//! ## Features
//!
//! - **Atomic reservation**: `reserve` claims the single use; under the
//!   Postgres backend concurrent reserves on one token have exactly one winner
//! - **Refund-free retries**: `release` returns a reserved grant after a
//!   downstream failure; `complete` spends it for good
//! - **Idempotent issuance**: repeated payment checks or duplicate webhooks
//!   never mint a second grant for an invoice
//! - **Cached bearer token**: gateway tokens are reused until 60s before expiry
//! - **Two backends**: transactional Postgres for production, a single JSON
//!   document for mock/local development
//!
//! ## Quickstart
//!
//! ```no_run
//! use paygrant::{GrantBroker, PaygrantConfig};
//!
//! # async fn run() -> Result<(), paygrant::PaygrantError> {
//! let config = PaygrantConfig::from_env()?;
//! let broker = GrantBroker::from_config(&config).await?;
//!
//! let invoice = broker.create_invoice(Some(5000), Some("Document analysis")).await?;
//! // ... show invoice.qr_text to the payer, then poll:
//! let status = broker.check(&invoice.invoice_id).await?;
//!
//! if let Some(token) = status.grant_token {
//!     let summary: Result<String, paygrant::PaygrantError> = broker
//!         .redeem(&token, || async { Ok("expensive work done".to_string()) })
//!         .await;
//!     println!("{:?}", summary);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! The file backend serializes its read-modify-writes behind an in-process
//! lock. It gives no guarantee when several processes share one document.
//! Use it for single-process development only.
//!
//! ## Abandoned reservations
//!
//! A grant whose consumer crashes between `reserve` and `complete`/`release`
//! stays in `PROCESSING`. Call
//! [`GrantBroker::reclaim_stale_reservations`] periodically to recover them.

#![warn(missing_docs)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Protocol layer
pub mod protocol;

// Client layer
pub mod client;

// Storage layer
pub mod store;

// Broker (main public API)
pub mod broker;

// Re-exports for public API
pub use broker::{GrantBroker, PaymentStatus};
pub use client::http::GatewayClient;
pub use client::mock::MockGateway;
pub use client::token::TokenCache;
pub use client::{CreatedInvoice, PaymentGateway};
pub use clock::{Clock, SystemClock};
pub use config::PaygrantConfig;
pub use errors::PaygrantError;
pub use protocol::models::PaymentCheckResult;
pub use store::file::FileStore;
pub use store::postgres::PostgresStore;
pub use store::records::{Grant, GrantResult, GrantStatus, Invoice, InvoiceStatus, RejectReason};
pub use store::GrantStore;

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
