//! File-backed store for mock and local deployments.
//!
//! Invoices, grants and an opaque `credits` map (owned by other services)
//! live in one JSON document. Writes go through temp file + rename.
//!
//! Every read-modify-write holds an in-process document lock, so reserve is
//! at-most-once within a single process. Nothing coordinates separate
//! processes sharing the same file; run one process per document.

use crate::store::records::{Grant, GrantResult, Invoice, IssuedGrant, RejectReason};
use crate::store::GrantStore;
use crate::PaygrantError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// On-disk document layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    invoices: BTreeMap<String, Invoice>,
    #[serde(default)]
    grants: BTreeMap<String, Grant>,
    /// Untouched by this crate; preserved across writes.
    #[serde(default)]
    credits: serde_json::Map<String, serde_json::Value>,
}

/// Single-document JSON store.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Create a store backed by `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The opaque credits map kept alongside invoices and grants.
    pub async fn credits(&self) -> Result<serde_json::Map<String, serde_json::Value>, PaygrantError> {
        Ok(self.load().await?.credits)
    }

    async fn load(&self) -> Result<StoreDocument, PaygrantError> {
        let json = match fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreDocument::default()),
            Err(e) => {
                return Err(PaygrantError::StoreIO(format!(
                    "Failed to read store file: {}",
                    e
                )))
            }
        };

        if json.trim().is_empty() {
            return Ok(StoreDocument::default());
        }

        serde_json::from_str(&json)
            .map_err(|e| PaygrantError::StoreIO(format!("Failed to parse store file: {}", e)))
    }

    async fn save(&self, document: &StoreDocument) -> Result<(), PaygrantError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PaygrantError::StoreIO(format!("Failed to create dir: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(document)
            .map_err(|e| PaygrantError::StoreIO(format!("Failed to serialize store: {}", e)))?;

        // Atomic write via temp + rename
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &json)
            .await
            .map_err(|e| PaygrantError::StoreIO(format!("Failed to write temp: {}", e)))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| PaygrantError::StoreIO(format!("Failed to rename: {}", e)))?;

        Ok(())
    }

    /// Run `apply` against the document under the lock; persist if it reports a change.
    async fn modify<T, F>(&self, apply: F) -> Result<T, PaygrantError>
    where
        T: Send,
        F: FnOnce(&mut StoreDocument) -> Result<(T, bool), PaygrantError> + Send,
    {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        let (value, changed) = apply(&mut document)?;
        if changed {
            self.save(&document).await?;
        }
        Ok(value)
    }

    /// Apply a transition to one grant; writes only when it succeeded.
    async fn transition<F>(&self, token: &str, apply: F) -> Result<GrantResult, PaygrantError>
    where
        F: FnOnce(&mut Grant) -> Result<GrantResult, PaygrantError> + Send,
    {
        self.modify(|document| match document.grants.get_mut(token) {
            None => Ok((GrantResult::rejected(RejectReason::Invalid), false)),
            Some(grant) => {
                let result = apply(grant)?;
                Ok((result, result.ok))
            }
        })
        .await
    }
}

#[async_trait]
impl GrantStore for FileStore {
    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, PaygrantError> {
        Ok(self.load().await?.invoices.remove(invoice_id))
    }

    async fn put_invoice(&self, invoice: &Invoice) -> Result<(), PaygrantError> {
        let invoice = invoice.clone();
        self.modify(move |document| {
            document.invoices.insert(invoice.invoice_id.clone(), invoice);
            Ok(((), true))
        })
        .await
    }

    async fn get_grant(&self, token: &str) -> Result<Option<Grant>, PaygrantError> {
        Ok(self.load().await?.grants.remove(token))
    }

    async fn put_grant(&self, grant: &Grant) -> Result<(), PaygrantError> {
        let grant = grant.clone();
        self.modify(move |document| {
            document.grants.insert(grant.token.clone(), grant);
            Ok(((), true))
        })
        .await
    }

    async fn issue_grant(&self, candidate: Grant) -> Result<IssuedGrant, PaygrantError> {
        self.modify(move |document| {
            let invoice = document
                .invoices
                .get_mut(&candidate.invoice_id)
                .ok_or_else(|| PaygrantError::InvoiceNotFound(candidate.invoice_id.clone()))?;

            if let Some(existing) = &invoice.grant_token {
                return Ok((
                    IssuedGrant {
                        token: existing.clone(),
                        created: false,
                    },
                    false,
                ));
            }

            invoice.link_grant(&candidate.token, candidate.created_at);
            let token = candidate.token.clone();
            document.grants.insert(token.clone(), candidate);
            Ok((IssuedGrant { token, created: true }, true))
        })
        .await
    }

    async fn atomic_reserve(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<GrantResult, PaygrantError> {
        self.transition(token, |grant| Ok(grant.reserve(now))).await
    }

    async fn release(&self, token: &str, now: DateTime<Utc>) -> Result<GrantResult, PaygrantError> {
        self.transition(token, |grant| grant.release(now)).await
    }

    async fn complete(&self, token: &str, now: DateTime<Utc>) -> Result<GrantResult, PaygrantError> {
        self.transition(token, |grant| grant.complete(now)).await
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, PaygrantError> {
        self.modify(|document| {
            let mut reclaimed = Vec::new();
            for grant in document.grants.values_mut() {
                if grant.is_stale_reservation(cutoff) {
                    grant.release(now)?;
                    reclaimed.push(grant.token.clone());
                }
            }
            let changed = !reclaimed.is_empty();
            Ok((reclaimed, changed))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::{GrantStatus, InvoiceStatus};
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
    }

    fn store(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path().join("nested").join("store.json"))
    }

    async fn paid_grant(store: &FileStore, invoice_id: &str) -> String {
        store
            .put_invoice(&Invoice::created(invoice_id, "1-abc", 5000, now()))
            .await
            .unwrap();
        store.issue_grant(Grant::issue(invoice_id, now())).await.unwrap().token
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.get_invoice("nope").await.unwrap().is_none());
        assert!(store.get_grant("nope").await.unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_put_grant_round_trips_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let mut grant = Grant::issue("inv-1", now());
        store(&dir).put_grant(&grant).await.unwrap();
        assert_eq!(store(&dir).get_grant(&grant.token).await.unwrap().unwrap(), grant);

        assert!(grant.reserve(now()).ok);
        store(&dir).put_grant(&grant).await.unwrap();
        let loaded = store(&dir).get_grant(&grant.token).await.unwrap().unwrap();
        assert_eq!(loaded.status, GrantStatus::Processing);
        assert_eq!(loaded.remaining_uses, 0);
    }

    #[tokio::test]
    async fn test_invoice_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let invoice = Invoice::created("inv-1", "1-abc", 5000, now());
        store(&dir).put_invoice(&invoice).await.unwrap();

        let loaded = store(&dir).get_invoice("inv-1").await.unwrap().unwrap();
        assert_eq!(loaded, invoice);
    }

    #[tokio::test]
    async fn test_issue_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .put_invoice(&Invoice::created("inv-1", "1-abc", 5000, now()))
            .await
            .unwrap();

        let first = store.issue_grant(Grant::issue("inv-1", now())).await.unwrap();
        let second = store.issue_grant(Grant::issue("inv-1", now())).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.token, second.token);

        let invoice = store.get_invoice("inv-1").await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.grant_token.as_deref(), Some(first.token.as_str()));
        assert_eq!(store.load().await.unwrap().grants.len(), 1);
    }

    #[tokio::test]
    async fn test_issue_for_unknown_invoice() {
        let dir = TempDir::new().unwrap();
        let result = store(&dir).issue_grant(Grant::issue("ghost", now())).await;
        assert!(matches!(result, Err(PaygrantError::InvoiceNotFound(_))));
    }

    #[tokio::test]
    async fn test_reserve_unknown_token_is_invalid() {
        let dir = TempDir::new().unwrap();
        let result = store(&dir).atomic_reserve("nope", now()).await.unwrap();
        assert_eq!(result, GrantResult::rejected(RejectReason::Invalid));
    }

    #[tokio::test]
    async fn test_reserve_release_complete_persist() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let token = paid_grant(&store, "inv-1").await;

        assert!(store.atomic_reserve(&token, now()).await.unwrap().ok);
        let grant = store.get_grant(&token).await.unwrap().unwrap();
        assert_eq!((grant.remaining_uses, grant.status), (0, GrantStatus::Processing));

        assert!(store.release(&token, now()).await.unwrap().ok);
        let grant = store.get_grant(&token).await.unwrap().unwrap();
        assert_eq!((grant.remaining_uses, grant.status), (1, GrantStatus::Available));

        assert!(store.atomic_reserve(&token, now()).await.unwrap().ok);
        assert!(store.complete(&token, now()).await.unwrap().ok);
        let grant = store.get_grant(&token).await.unwrap().unwrap();
        assert_eq!((grant.remaining_uses, grant.status), (0, GrantStatus::Used));
    }

    #[tokio::test]
    async fn test_release_used_grant_is_error_and_not_written() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let token = paid_grant(&store, "inv-1").await;
        store.atomic_reserve(&token, now()).await.unwrap();
        store.complete(&token, now()).await.unwrap();

        assert!(matches!(
            store.release(&token, now()).await,
            Err(PaygrantError::GrantTransition { .. })
        ));
        let grant = store.get_grant(&token).await.unwrap().unwrap();
        assert_eq!(grant.status, GrantStatus::Used);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserve_single_winner() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir));
        let token = paid_grant(&store, "inv-1").await;

        let attempts = (0..16).map(|_| {
            let store = store.clone();
            let token = token.clone();
            tokio::spawn(async move { store.atomic_reserve(&token, now()).await.unwrap() })
        });
        let results: Vec<GrantResult> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.ok).count(), 1);
        assert!(results
            .iter()
            .filter(|r| !r.ok)
            .all(|r| r.reason == Some(RejectReason::Used)));
    }

    #[tokio::test]
    async fn test_reclaim_stale_only_touches_old_reservations() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let old = paid_grant(&store, "inv-old").await;
        let fresh = paid_grant(&store, "inv-fresh").await;
        let idle = paid_grant(&store, "inv-idle").await;

        store.atomic_reserve(&old, now()).await.unwrap();
        store
            .atomic_reserve(&fresh, now() + chrono::Duration::minutes(20))
            .await
            .unwrap();

        let cutoff = now() + chrono::Duration::minutes(10);
        let reclaimed = store.reclaim_stale(cutoff, cutoff).await.unwrap();
        assert_eq!(reclaimed, vec![old.clone()]);

        assert_eq!(store.get_grant(&old).await.unwrap().unwrap().status, GrantStatus::Available);
        assert_eq!(store.get_grant(&fresh).await.unwrap().unwrap().status, GrantStatus::Processing);
        assert_eq!(store.get_grant(&idle).await.unwrap().unwrap().status, GrantStatus::Available);
    }

    #[tokio::test]
    async fn test_credits_map_preserved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(
            &path,
            r#"{"invoices":{},"grants":{},"credits":{"user-1":{"balance":3}}}"#,
        )
        .unwrap();

        let store = FileStore::new(&path);
        paid_grant(&store, "inv-1").await;

        let credits = store.credits().await.unwrap();
        assert_eq!(credits["user-1"]["balance"], 3);
    }

    #[tokio::test]
    async fn test_corrupt_document_is_store_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();
        let result = FileStore::new(&path).get_invoice("inv-1").await;
        assert!(matches!(result, Err(PaygrantError::StoreIO(_))));
    }
}
