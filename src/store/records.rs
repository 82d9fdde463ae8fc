//! Invoice and grant records, and the grant state machine.
//!
//! ```text
//! (none) -> AVAILABLE -> PROCESSING -> USED
//!               ^             |
//!               +-- release --+
//! ```
//!
//! Invariants: `remaining_uses` is 0 or 1; `remaining_uses == 1` implies
//! `AVAILABLE`; `USED` implies `remaining_uses == 0` and is terminal.
//! Both storage backends apply transitions through these methods, so the
//! rules live in one place.

use crate::PaygrantError;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Invoice lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    /// Created upstream, no confirmed payment seen yet.
    Created,
    /// Payment confirmed and a grant linked.
    Paid,
}

impl InvoiceStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Paid => "PAID",
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = PaygrantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "PAID" => Ok(Self::Paid),
            other => Err(PaygrantError::StoreIO(format!("Unknown invoice status {:?}", other))),
        }
    }
}

/// Grant lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantStatus {
    /// One use remaining.
    Available,
    /// Reserved by a consumer; work in flight.
    Processing,
    /// Terminal.
    Used,
}

impl GrantStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Processing => "PROCESSING",
            Self::Used => "USED",
        }
    }
}

impl fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantStatus {
    type Err = PaygrantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "PROCESSING" => Ok(Self::Processing),
            "USED" => Ok(Self::Used),
            other => Err(PaygrantError::StoreIO(format!("Unknown grant status {:?}", other))),
        }
    }
}

/// Why a grant operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// No grant exists for the token.
    Invalid,
    /// The grant's single use is reserved or spent.
    Used,
}

/// Structured outcome of reserve, release and complete: `{ok, reason?}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantResult {
    /// Whether the operation took effect.
    pub ok: bool,
    /// Set when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl GrantResult {
    /// Successful outcome.
    pub fn accepted() -> Self {
        Self { ok: true, reason: None }
    }

    /// Refused outcome.
    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }

    /// Whether the operation took effect.
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Convert a refusal into `GrantInvalid` / `GrantExhausted`.
    pub fn into_result(self) -> Result<(), PaygrantError> {
        match (self.ok, self.reason) {
            (true, _) => Ok(()),
            (false, Some(RejectReason::Invalid)) => Err(PaygrantError::GrantInvalid),
            (false, _) => Err(PaygrantError::GrantExhausted),
        }
    }
}

/// Persisted invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// Gateway invoice id.
    pub invoice_id: String,
    /// Idempotency key of the creation attempt.
    pub sender_invoice_no: String,
    /// Invoiced amount.
    pub amount: u64,
    /// Lifecycle status.
    pub status: InvoiceStatus,
    /// Grant issued for this invoice, at most one ever.
    #[serde(default)]
    pub grant_token: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// A freshly created, unpaid invoice.
    pub fn created(
        invoice_id: impl Into<String>,
        sender_invoice_no: impl Into<String>,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            invoice_id: invoice_id.into(),
            sender_invoice_no: sender_invoice_no.into(),
            amount,
            status: InvoiceStatus::Created,
            grant_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark paid and link the grant.
    pub fn link_grant(&mut self, token: &str, now: DateTime<Utc>) {
        self.status = InvoiceStatus::Paid;
        self.grant_token = Some(token.to_string());
        self.updated_at = now;
    }
}

/// Persisted single-use grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    /// Opaque bearer capability.
    pub token: String,
    /// Invoice whose payment produced this grant.
    pub invoice_id: String,
    /// 0 or 1.
    pub remaining_uses: u32,
    /// Lifecycle status.
    pub status: GrantStatus,
    /// Issue time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl Grant {
    /// Issue a new grant for an invoice with a single use.
    pub fn issue(invoice_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            token: generate_grant_token(),
            invoice_id: invoice_id.into(),
            remaining_uses: 1,
            status: GrantStatus::Available,
            created_at: now,
            updated_at: now,
        }
    }

    /// Claim the single use: AVAILABLE -> PROCESSING.
    pub fn reserve(&mut self, now: DateTime<Utc>) -> GrantResult {
        if self.remaining_uses < 1 || self.status != GrantStatus::Available {
            return GrantResult::rejected(RejectReason::Used);
        }
        self.remaining_uses = 0;
        self.status = GrantStatus::Processing;
        self.updated_at = now;
        GrantResult::accepted()
    }

    /// Give the use back after a downstream failure: PROCESSING -> AVAILABLE.
    ///
    /// Releasing an AVAILABLE grant is a no-op. Releasing a USED grant is a
    /// caller logic error.
    pub fn release(&mut self, now: DateTime<Utc>) -> Result<GrantResult, PaygrantError> {
        if self.status == GrantStatus::Used {
            return Err(PaygrantError::GrantTransition {
                action: "release",
                status: self.status,
            });
        }
        self.remaining_uses = 1;
        self.status = GrantStatus::Available;
        self.updated_at = now;
        Ok(GrantResult::accepted())
    }

    /// Finalize the use: PROCESSING -> USED.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<GrantResult, PaygrantError> {
        match self.status {
            GrantStatus::Used => Ok(GrantResult::rejected(RejectReason::Used)),
            GrantStatus::Available => Err(PaygrantError::GrantTransition {
                action: "complete",
                status: self.status,
            }),
            GrantStatus::Processing => {
                self.remaining_uses = 0;
                self.status = GrantStatus::Used;
                self.updated_at = now;
                Ok(GrantResult::accepted())
            }
        }
    }

    /// Whether the grant has been reserved since `cutoff` without finishing.
    pub fn is_stale_reservation(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == GrantStatus::Processing && self.updated_at < cutoff
    }
}

/// Outcome of grant issuance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedGrant {
    /// The invoice's grant token.
    pub token: String,
    /// False when the invoice already had a grant and it was returned unchanged.
    pub created: bool,
}

/// Generate an opaque grant token (256 random bits, hex).
pub fn generate_grant_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Short SHA-256 fingerprint of a grant token for logs.
pub fn token_fingerprint(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(token.as_bytes());
    hex::encode(&hash[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_issue_starts_available() {
        let grant = Grant::issue("inv-1", now());
        assert_eq!(grant.remaining_uses, 1);
        assert_eq!(grant.status, GrantStatus::Available);
        assert_eq!(grant.token.len(), 64);
    }

    #[test]
    fn test_reserve_then_second_reserve_rejected() {
        let mut grant = Grant::issue("inv-1", now());
        assert!(grant.reserve(now()).is_ok());
        assert_eq!(grant.remaining_uses, 0);
        assert_eq!(grant.status, GrantStatus::Processing);

        assert_eq!(grant.reserve(now()), GrantResult::rejected(RejectReason::Used));
    }

    #[test]
    fn test_release_restores_single_use() {
        let mut grant = Grant::issue("inv-1", now());
        grant.reserve(now());
        assert!(grant.release(now()).unwrap().is_ok());
        assert_eq!(grant.remaining_uses, 1);
        assert_eq!(grant.status, GrantStatus::Available);
        assert!(grant.reserve(now()).is_ok());
    }

    #[test]
    fn test_complete_is_terminal() {
        let mut grant = Grant::issue("inv-1", now());
        grant.reserve(now());
        assert!(grant.complete(now()).unwrap().is_ok());
        assert_eq!(grant.status, GrantStatus::Used);
        assert_eq!(grant.remaining_uses, 0);

        for _ in 0..3 {
            assert_eq!(grant.reserve(now()), GrantResult::rejected(RejectReason::Used));
        }
        assert_eq!(
            grant.complete(now()).unwrap(),
            GrantResult::rejected(RejectReason::Used)
        );
    }

    #[test]
    fn test_release_after_complete_is_error() {
        let mut grant = Grant::issue("inv-1", now());
        grant.reserve(now());
        grant.complete(now()).unwrap();
        let err = grant.release(now()).unwrap_err();
        assert!(matches!(
            err,
            PaygrantError::GrantTransition { action: "release", status: GrantStatus::Used }
        ));
        assert_eq!(grant.status, GrantStatus::Used);
    }

    #[test]
    fn test_complete_without_reserve_is_error() {
        let mut grant = Grant::issue("inv-1", now());
        assert!(grant.complete(now()).is_err());
        assert_eq!(grant.remaining_uses, 1);
    }

    #[test]
    fn test_grant_result_serialization() {
        let ok = serde_json::to_value(GrantResult::accepted()).unwrap();
        assert_eq!(ok, serde_json::json!({"ok": true}));
        let used = serde_json::to_value(GrantResult::rejected(RejectReason::Used)).unwrap();
        assert_eq!(used, serde_json::json!({"ok": false, "reason": "USED"}));
    }

    #[test]
    fn test_grant_result_into_result() {
        assert!(GrantResult::accepted().into_result().is_ok());
        assert!(matches!(
            GrantResult::rejected(RejectReason::Invalid).into_result(),
            Err(PaygrantError::GrantInvalid)
        ));
        assert!(matches!(
            GrantResult::rejected(RejectReason::Used).into_result(),
            Err(PaygrantError::GrantExhausted)
        ));
    }

    #[test]
    fn test_status_round_trip_through_storage_strings() {
        for status in [GrantStatus::Available, GrantStatus::Processing, GrantStatus::Used] {
            assert_eq!(status.as_str().parse::<GrantStatus>().unwrap(), status);
        }
        assert!("EXPIRED".parse::<GrantStatus>().is_err());
        assert_eq!("PAID".parse::<InvoiceStatus>().unwrap(), InvoiceStatus::Paid);
    }

    #[test]
    fn test_stale_reservation() {
        let mut grant = Grant::issue("inv-1", now());
        let later = now() + chrono::Duration::minutes(30);
        assert!(!grant.is_stale_reservation(later));
        grant.reserve(now());
        assert!(grant.is_stale_reservation(later));
        assert!(!grant.is_stale_reservation(now()));
    }

    #[test]
    fn test_invoice_link_grant() {
        let mut invoice = Invoice::created("inv-1", "1-abc", 5000, now());
        assert_eq!(invoice.status, InvoiceStatus::Created);
        invoice.link_grant("tok", now());
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.grant_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_token_fingerprint_is_short_and_stable() {
        assert_eq!(token_fingerprint("abc"), token_fingerprint("abc"));
        assert_eq!(token_fingerprint("abc").len(), 12);
        assert_ne!(token_fingerprint("abc"), token_fingerprint("abd"));
    }
}
