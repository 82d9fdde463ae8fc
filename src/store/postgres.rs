//! PostgreSQL-backed transactional store.
//!
//! Grant transitions run inside a transaction that takes a row lock
//! (`SELECT ... FOR UPDATE`) before applying the state machine, so for any
//! one token `atomic_reserve` is linearizable across connections and
//! processes.

use crate::store::records::{
    Grant, GrantResult, GrantStatus, Invoice, InvoiceStatus, IssuedGrant, RejectReason,
};
use crate::store::GrantStore;
use crate::PaygrantError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL implementation of [`GrantStore`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store over an existing pool. Does not run migrations.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, then apply pending migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, PaygrantError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| PaygrantError::StoreIO(format!("Failed to connect to database: {}", e)))?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Apply pending migrations.
    pub async fn migrate(&self) -> Result<(), PaygrantError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| PaygrantError::StoreIO(format!("Failed to run migrations: {}", e)))
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock one grant row, apply `apply`, and write it back if it took effect.
    async fn transition<F>(&self, token: &str, apply: F) -> Result<GrantResult, PaygrantError>
    where
        F: FnOnce(&mut Grant) -> Result<GrantResult, PaygrantError> + Send,
    {
        let mut transaction = self.pool.begin().await.map_err(|e| {
            PaygrantError::StoreIO(format!("Failed to start grant transaction: {}", e))
        })?;

        let row = sqlx::query_as::<_, GrantRow>(
            r#"
            SELECT token, invoice_id, remaining_uses, status, created_at, updated_at
            FROM grants
            WHERE token = $1
            FOR UPDATE
            "#,
        )
        .bind(token)
        .fetch_optional(&mut *transaction)
        .await
        .map_err(|e| PaygrantError::StoreIO(format!("Failed to lock grant: {}", e)))?;

        // Dropping the transaction rolls it back.
        let Some(row) = row else {
            return Ok(GrantResult::rejected(RejectReason::Invalid));
        };

        let mut grant = Grant::try_from(row)?;
        let result = apply(&mut grant)?;
        if result.ok {
            write_grant_state(&mut transaction, &grant).await?;
        }

        transaction.commit().await.map_err(|e| {
            PaygrantError::StoreIO(format!("Failed to commit grant transaction: {}", e))
        })?;

        Ok(result)
    }
}

async fn write_grant_state(conn: &mut PgConnection, grant: &Grant) -> Result<(), PaygrantError> {
    sqlx::query(
        r#"
        UPDATE grants
        SET remaining_uses = $2, status = $3, updated_at = $4
        WHERE token = $1
        "#,
    )
    .bind(&grant.token)
    .bind(remaining_uses_to_db(grant.remaining_uses)?)
    .bind(grant.status.as_str())
    .bind(grant.updated_at)
    .execute(conn)
    .await
    .map_err(|e| PaygrantError::StoreIO(format!("Failed to update grant: {}", e)))?;
    Ok(())
}

async fn insert_grant(conn: &mut PgConnection, grant: &Grant) -> Result<(), PaygrantError> {
    sqlx::query(
        r#"
        INSERT INTO grants (token, invoice_id, remaining_uses, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (token) DO UPDATE
        SET remaining_uses = EXCLUDED.remaining_uses,
            status = EXCLUDED.status,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&grant.token)
    .bind(&grant.invoice_id)
    .bind(remaining_uses_to_db(grant.remaining_uses)?)
    .bind(grant.status.as_str())
    .bind(grant.created_at)
    .bind(grant.updated_at)
    .execute(conn)
    .await
    .map_err(|e| PaygrantError::StoreIO(format!("Failed to write grant: {}", e)))?;
    Ok(())
}

fn remaining_uses_to_db(value: u32) -> Result<i32, PaygrantError> {
    i32::try_from(value)
        .map_err(|e| PaygrantError::ValidationError(format!("remaining_uses out of range: {}", e)))
}

#[async_trait]
impl GrantStore for PostgresStore {
    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, PaygrantError> {
        let row = sqlx::query_as::<_, InvoiceRow>(
            r#"
            SELECT invoice_id, sender_invoice_no, amount, status, grant_token, created_at, updated_at
            FROM invoices
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PaygrantError::StoreIO(format!("Failed to load invoice: {}", e)))?;

        row.map(Invoice::try_from).transpose()
    }

    async fn put_invoice(&self, invoice: &Invoice) -> Result<(), PaygrantError> {
        let amount = i64::try_from(invoice.amount)
            .map_err(|e| PaygrantError::ValidationError(format!("amount out of range: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO invoices (
                invoice_id, sender_invoice_no, amount, status, grant_token, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (invoice_id) DO UPDATE
            SET sender_invoice_no = EXCLUDED.sender_invoice_no,
                amount = EXCLUDED.amount,
                status = EXCLUDED.status,
                grant_token = EXCLUDED.grant_token,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&invoice.invoice_id)
        .bind(&invoice.sender_invoice_no)
        .bind(amount)
        .bind(invoice.status.as_str())
        .bind(invoice.grant_token.as_deref())
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PaygrantError::StoreIO(format!("Failed to write invoice: {}", e)))?;

        Ok(())
    }

    async fn get_grant(&self, token: &str) -> Result<Option<Grant>, PaygrantError> {
        let row = sqlx::query_as::<_, GrantRow>(
            r#"
            SELECT token, invoice_id, remaining_uses, status, created_at, updated_at
            FROM grants
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PaygrantError::StoreIO(format!("Failed to load grant: {}", e)))?;

        row.map(Grant::try_from).transpose()
    }

    async fn put_grant(&self, grant: &Grant) -> Result<(), PaygrantError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| PaygrantError::StoreIO(format!("Failed to acquire connection: {}", e)))?;
        insert_grant(&mut conn, grant).await
    }

    async fn issue_grant(&self, candidate: Grant) -> Result<IssuedGrant, PaygrantError> {
        let mut transaction = self.pool.begin().await.map_err(|e| {
            PaygrantError::StoreIO(format!("Failed to start issuance transaction: {}", e))
        })?;

        let linked = sqlx::query_scalar::<_, Option<String>>(
            r#"
            SELECT grant_token
            FROM invoices
            WHERE invoice_id = $1
            FOR UPDATE
            "#,
        )
        .bind(&candidate.invoice_id)
        .fetch_optional(&mut *transaction)
        .await
        .map_err(|e| PaygrantError::StoreIO(format!("Failed to lock invoice: {}", e)))?
        .ok_or_else(|| PaygrantError::InvoiceNotFound(candidate.invoice_id.clone()))?;

        if let Some(token) = linked {
            transaction.commit().await.map_err(|e| {
                PaygrantError::StoreIO(format!("Failed to commit issuance transaction: {}", e))
            })?;
            return Ok(IssuedGrant {
                token,
                created: false,
            });
        }

        insert_grant(&mut transaction, &candidate).await?;

        sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, grant_token = $3, updated_at = $4
            WHERE invoice_id = $1
            "#,
        )
        .bind(&candidate.invoice_id)
        .bind(InvoiceStatus::Paid.as_str())
        .bind(&candidate.token)
        .bind(candidate.created_at)
        .execute(&mut *transaction)
        .await
        .map_err(|e| PaygrantError::StoreIO(format!("Failed to link grant to invoice: {}", e)))?;

        transaction.commit().await.map_err(|e| {
            PaygrantError::StoreIO(format!("Failed to commit issuance transaction: {}", e))
        })?;

        Ok(IssuedGrant {
            token: candidate.token,
            created: true,
        })
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
        sqlx::query_scalar::<_, String>(
            r#"
            UPDATE grants
            SET remaining_uses = 1, status = $2, updated_at = $3
            WHERE status = $4
              AND updated_at < $1
            RETURNING token
            "#,
        )
        .bind(cutoff)
        .bind(GrantStatus::Available.as_str())
        .bind(now)
        .bind(GrantStatus::Processing.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PaygrantError::StoreIO(format!("Failed to reclaim stale grants: {}", e)))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    invoice_id: String,
    sender_invoice_no: String,
    amount: i64,
    status: String,
    grant_token: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = PaygrantError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            amount: u64::try_from(row.amount).map_err(|e| {
                PaygrantError::StoreIO(format!("Invalid amount for {}: {}", row.invoice_id, e))
            })?,
            status: row.status.parse()?,
            invoice_id: row.invoice_id,
            sender_invoice_no: row.sender_invoice_no,
            grant_token: row.grant_token,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GrantRow {
    token: String,
    invoice_id: String,
    remaining_uses: i32,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<GrantRow> for Grant {
    type Error = PaygrantError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        Ok(Self {
            remaining_uses: u32::try_from(row.remaining_uses).map_err(|e| {
                PaygrantError::StoreIO(format!("Invalid remaining_uses on grant: {}", e))
            })?,
            status: row.status.parse()?,
            token: row.token,
            invoice_id: row.invoice_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
