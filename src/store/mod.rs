//! Storage backends for invoices and grants.
//!
//! Two implementations sit behind [`GrantStore`]:
//! - [`postgres::PostgresStore`]: transactional, safe across processes.
//! - [`file::FileStore`]: one JSON document, for mock/local use. Its
//!   read-modify-writes are serialized by an in-process lock only.

pub mod file;
pub mod postgres;
pub mod records;

use crate::PaygrantError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use records::{Grant, GrantResult, Invoice, IssuedGrant};

pub use records::{GrantStatus, InvoiceStatus, RejectReason};

/// Storage interface the broker is written against.
///
/// The transition methods apply the state machine in [`records::Grant`]
/// atomically with respect to other calls on the same token.
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Load an invoice by id.
    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, PaygrantError>;

    /// Insert or replace an invoice.
    async fn put_invoice(&self, invoice: &Invoice) -> Result<(), PaygrantError>;

    /// Load a grant by token.
    async fn get_grant(&self, token: &str) -> Result<Option<Grant>, PaygrantError>;

    /// Insert or replace a grant.
    async fn put_grant(&self, grant: &Grant) -> Result<(), PaygrantError>;

    /// Link `candidate` to its invoice and mark the invoice paid, as one unit.
    ///
    /// If the invoice already has a grant, that grant's token is returned and
    /// `candidate` is discarded.
    async fn issue_grant(&self, candidate: Grant) -> Result<IssuedGrant, PaygrantError>;

    /// Atomically check-and-claim the grant's single use.
    async fn atomic_reserve(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<GrantResult, PaygrantError>;

    /// Return a reserved grant to AVAILABLE.
    async fn release(&self, token: &str, now: DateTime<Utc>) -> Result<GrantResult, PaygrantError>;

    /// Mark a reserved grant USED.
    async fn complete(&self, token: &str, now: DateTime<Utc>) -> Result<GrantResult, PaygrantError>;

    /// Release every grant reserved before `cutoff`. Returns their tokens.
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, PaygrantError>;
}
