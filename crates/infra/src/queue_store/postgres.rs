//! Postgres-backed queue entry + claim store.
//!
//! Both tables live in one database so a batch session is a single
//! `sqlx::Transaction`. Schema: `migrations/0001_queue_entries.sql`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | PersistenceError |
//! |------------|----------------------|------------------|
//! | Database (unique violation) | `23505` | `Constraint` |
//! | Database (foreign key violation) | `23503` | `Constraint` |
//! | Database (check constraint violation) | `23514` | `Constraint` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Acquire, FromRow, PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use tracing::{instrument, warn};

use claimflow_core::{ClaimId, QueueEntryId, WorkItemId};

use super::r#trait::{
    ClaimStore, EntryStatus, PersistenceError, QueueEntry, QueueEntryClaim, QueueEntryStore,
    Session, SessionFactory,
};

const SCHEMA: &str = include_str!("../../migrations/0001_queue_entries.sql");

/// Postgres queue entry + claim store.
///
/// `Send + Sync`; all access goes through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresQueueStore {
    pool: Arc<PgPool>,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

/// One open database transaction.
#[derive(Debug)]
pub struct PgSession {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, PersistenceError> {
        self.tx.as_mut().ok_or(PersistenceError::SessionClosed)
    }
}

#[async_trait::async_trait]
impl Session for PgSession {
    async fn commit(&mut self) -> Result<(), PersistenceError> {
        let tx = self.tx.take().ok_or(PersistenceError::SessionClosed)?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&mut self) -> Result<(), PersistenceError> {
        let tx = self.tx.take().ok_or(PersistenceError::SessionClosed)?;
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }

    async fn release(mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "rollback on release failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl SessionFactory for PostgresQueueStore {
    type Session = PgSession;

    #[instrument(skip(self), err)]
    async fn open(&self) -> Result<Self::Session, PersistenceError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PgSession { tx: Some(tx) })
    }
}

#[async_trait::async_trait]
impl QueueEntryStore for PostgresQueueStore {
    #[instrument(skip(self, session, payload), fields(ian = %ian), err)]
    async fn create_entry(
        &self,
        session: &mut Self::Session,
        ian: &WorkItemId,
        payload: JsonValue,
    ) -> Result<QueueEntry, PersistenceError> {
        let entry = QueueEntry::new(ian.clone(), payload);

        sqlx::query(
            r#"
            INSERT INTO queue_entries (id, ian, status, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.ian.as_str())
        .bind(entry.status.as_str())
        .bind(&entry.payload)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut **session.tx()?)
        .await
        .map_err(|e| map_sqlx_error("insert_queue_entry", e))?;

        Ok(entry)
    }

    #[instrument(skip(self, session), fields(entry_id = %entry_id), err)]
    async fn delete_entry(
        &self,
        session: &mut Self::Session,
        entry_id: QueueEntryId,
    ) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM queue_entries WHERE id = $1")
            .bind(entry_id.as_uuid())
            .execute(&mut **session.tx()?)
            .await
            .map_err(|e| map_sqlx_error("delete_queue_entry", e))?;
        Ok(())
    }

    #[instrument(skip(self, session, body), fields(entry_id = %entry_id, status = %status), err)]
    async fn update_status(
        &self,
        session: &mut Self::Session,
        entry_id: QueueEntryId,
        status: EntryStatus,
        body: JsonValue,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = $2, body = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(entry_id.as_uuid())
        .bind(status.as_str())
        .bind(&body)
        .execute(&mut **session.tx()?)
        .await
        .map_err(|e| map_sqlx_error("update_queue_entry_status", e))?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::EntryNotFound(entry_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(ian = %ian), err)]
    async fn latest_for(&self, ian: &WorkItemId) -> Result<Option<QueueEntry>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, ian, status, payload, body, message, created_at, updated_at
            FROM queue_entries
            WHERE ian = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(ian.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_queue_entry", e))?;

        row.map(|row| {
            QueueEntryRow::from_row(&row)
                .map_err(|e| {
                    PersistenceError::Storage(format!("failed to deserialize queue entry row: {e}"))
                })?
                .try_into()
        })
        .transpose()
    }

    #[instrument(skip(self, message), fields(entry_id = %entry_id), err)]
    async fn mark_failed(&self, entry_id: QueueEntryId, message: &str) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = 'failed', message = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(entry_id.as_uuid())
        .bind(message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_queue_entry_failed", e))?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::EntryNotFound(entry_id));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClaimStore for PostgresQueueStore {
    #[instrument(skip(self, session, entry, claim), fields(entry_id = %entry.id), err)]
    async fn create_claim(
        &self,
        session: &mut Self::Session,
        entry: &QueueEntry,
        claim: JsonValue,
    ) -> Result<QueueEntryClaim, PersistenceError> {
        let claim = QueueEntryClaim::new(entry, claim);

        // Nested begin is a SAVEPOINT: a failed insert must not abort the
        // batch transaction, or the compensating delete cannot run.
        let tx = session.tx()?;
        let mut savepoint = Acquire::begin(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("savepoint_queue_entry_claim", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO queue_entry_claims (id, queue_entry_id, claim, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(claim.id.as_uuid())
        .bind(claim.queue_entry_id.as_uuid())
        .bind(&claim.claim)
        .bind(claim.created_at)
        .execute(&mut *savepoint)
        .await;

        match inserted {
            Ok(_) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|e| map_sqlx_error("release_queue_entry_claim", e))?;
                Ok(claim)
            }
            Err(e) => {
                if let Err(rollback) = savepoint.rollback().await {
                    warn!(error = %rollback, "rollback to claim savepoint failed");
                }
                Err(map_sqlx_error("insert_queue_entry_claim", e))
            }
        }
    }

    #[instrument(skip(self), fields(entry_id = %entry_id), err)]
    async fn find_for_entry(
        &self,
        entry_id: QueueEntryId,
    ) -> Result<Option<QueueEntryClaim>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, queue_entry_id, claim, created_at
            FROM queue_entry_claims
            WHERE queue_entry_id = $1
            "#,
        )
        .bind(entry_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_claim_for_entry", e))?;

        row.map(|row| {
            ClaimRow::from_row(&row)
                .map(Into::into)
                .map_err(|e| PersistenceError::Storage(format!("failed to deserialize claim row: {e}")))
        })
        .transpose()
    }
}

/// Map SQLx errors to PersistenceError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // unique / foreign key / check
                Some("23505") | Some("23503") | Some("23514") => PersistenceError::Constraint(msg),
                _ => PersistenceError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            PersistenceError::Unavailable(format!("{operation}: {err}"))
        }
        _ => PersistenceError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

// SQLx row types

#[derive(Debug)]
struct QueueEntryRow {
    id: uuid::Uuid,
    ian: String,
    status: String,
    payload: JsonValue,
    body: Option<JsonValue>,
    message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for QueueEntryRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueEntryRow {
            id: row.try_get("id")?,
            ian: row.try_get("ian")?,
            status: row.try_get("status")?,
            payload: row.try_get("payload")?,
            body: row.try_get("body")?,
            message: row.try_get("message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<QueueEntryRow> for QueueEntry {
    type Error = PersistenceError;

    fn try_from(row: QueueEntryRow) -> Result<Self, Self::Error> {
        let status = EntryStatus::parse(&row.status)
            .ok_or_else(|| PersistenceError::Storage(format!("unknown entry status '{}'", row.status)))?;
        let ian = WorkItemId::new(row.ian).map_err(|e| PersistenceError::Storage(e.to_string()))?;
        Ok(QueueEntry {
            id: QueueEntryId::from_uuid(row.id),
            ian,
            status,
            payload: row.payload,
            body: row.body,
            message: row.message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct ClaimRow {
    id: uuid::Uuid,
    queue_entry_id: uuid::Uuid,
    claim: JsonValue,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ClaimRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ClaimRow {
            id: row.try_get("id")?,
            queue_entry_id: row.try_get("queue_entry_id")?,
            claim: row.try_get("claim")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<ClaimRow> for QueueEntryClaim {
    fn from(row: ClaimRow) -> Self {
        QueueEntryClaim {
            id: ClaimId::from_uuid(row.id),
            queue_entry_id: QueueEntryId::from_uuid(row.queue_entry_id),
            claim: row.claim,
            created_at: row.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Runs against `DATABASE_URL`; skipped when it is not set.
    async fn store() -> Option<PostgresQueueStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.expect("failed to connect to Postgres");
        let store = PostgresQueueStore::new(pool);
        store.ensure_schema().await.expect("schema bootstrap failed");
        Some(store)
    }

    #[tokio::test]
    async fn entry_can_be_deleted_after_a_failed_claim_insert() {
        let Some(store) = store().await else {
            return;
        };
        let ian = WorkItemId::new(format!("PG-{}", uuid::Uuid::now_v7())).unwrap();

        let mut session = store.open().await.unwrap();
        let entry = store
            .create_entry(&mut session, &ian, json!({ "ians": [ian.as_str()] }))
            .await
            .unwrap();
        store
            .create_claim(&mut session, &entry, json!({ "ians": [ian.as_str()] }))
            .await
            .unwrap();

        // One claim per entry: the second insert violates the unique key.
        let duplicate = store
            .create_claim(&mut session, &entry, json!({ "ians": [ian.as_str()] }))
            .await;
        assert!(matches!(duplicate, Err(PersistenceError::Constraint(_))));

        store.delete_entry(&mut session, entry.id).await.unwrap();
        session.commit().await.unwrap();

        assert!(store.latest_for(&ian).await.unwrap().is_none());
        assert!(store.find_for_entry(entry.id).await.unwrap().is_none());
    }
}
