use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use claimflow_core::{ClaimId, QueueEntryId, WorkItemId};

/// Lifecycle status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Created inside the batch transaction, not yet acknowledged by the bus.
    Pending,
    /// Acknowledged by the bus.
    Queued,
    /// Rejected after consumption (validation or downstream evaluation).
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Queued => "queued",
            EntryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EntryStatus::Pending),
            "queued" => Some(EntryStatus::Queued),
            "failed" => Some(EntryStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable queue entry per submitted work item.
///
/// `payload` is the originating request narrowed to `ian`. `body` is written by
/// the dispatcher once the bus acknowledged the entry (receipt + envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub ian: WorkItemId,
    pub status: EntryStatus,
    pub payload: JsonValue,
    pub body: Option<JsonValue>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(ian: WorkItemId, payload: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: QueueEntryId::new(),
            ian,
            status: EntryStatus::Pending,
            payload,
            body: None,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status_view(&self) -> StatusView {
        StatusView {
            status: self.status,
            message: self.message.clone(),
        }
    }
}

/// Claim payload persisted alongside exactly one queue entry. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntryClaim {
    pub id: ClaimId,
    pub queue_entry_id: QueueEntryId,
    pub claim: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl QueueEntryClaim {
    pub fn new(entry: &QueueEntry, claim: JsonValue) -> Self {
        Self {
            id: ClaimId::new(),
            queue_entry_id: entry.id,
            claim,
            created_at: Utc::now(),
        }
    }
}

/// What callers polling batch progress see for a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Store operation error.
///
/// - **Constraint**: the write violated a store invariant (duplicate id, claim
///   without entry, ...)
/// - **Unavailable**: connectivity to the backing store was lost
/// - **SessionClosed**: the session was already committed or rolled back
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("queue entry not found: {0}")]
    EntryNotFound(QueueEntryId),

    #[error("session already closed")]
    SessionClosed,

    #[error("storage error: {0}")]
    Storage(String),
}

/// A transactional database session.
///
/// Writes made through a store with this session become visible to other
/// readers only after `commit`. `release` must be called exactly once,
/// whatever the outcome.
#[async_trait::async_trait]
pub trait Session: Send {
    async fn commit(&mut self) -> Result<(), PersistenceError>;

    async fn rollback(&mut self) -> Result<(), PersistenceError>;

    /// Return the session's resources. Rolls back anything still open.
    async fn release(self);
}

/// Opens transactional sessions.
#[async_trait::async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: Session;

    async fn open(&self) -> Result<Self::Session, PersistenceError>;
}

/// Durable queue entries.
#[async_trait::async_trait]
pub trait QueueEntryStore: SessionFactory {
    /// Persist a new `pending` entry, scoped to `session`.
    async fn create_entry(
        &self,
        session: &mut Self::Session,
        ian: &WorkItemId,
        payload: JsonValue,
    ) -> Result<QueueEntry, PersistenceError>;

    /// Remove an entry (compensation only). Removing a missing entry is a no-op.
    async fn delete_entry(
        &self,
        session: &mut Self::Session,
        entry_id: QueueEntryId,
    ) -> Result<(), PersistenceError>;

    async fn update_status(
        &self,
        session: &mut Self::Session,
        entry_id: QueueEntryId,
        status: EntryStatus,
        body: JsonValue,
    ) -> Result<(), PersistenceError>;

    /// Newest committed entry for a work item.
    async fn latest_for(&self, ian: &WorkItemId) -> Result<Option<QueueEntry>, PersistenceError>;

    /// Mark a committed entry `failed` outside any batch session.
    async fn mark_failed(&self, entry_id: QueueEntryId, message: &str) -> Result<(), PersistenceError>;
}

/// Durable claims, one per queue entry.
#[async_trait::async_trait]
pub trait ClaimStore: SessionFactory {
    /// Persist the claim for `entry`, scoped to `session`.
    async fn create_claim(
        &self,
        session: &mut Self::Session,
        entry: &QueueEntry,
        claim: JsonValue,
    ) -> Result<QueueEntryClaim, PersistenceError>;

    /// Committed claim for a queue entry.
    async fn find_for_entry(
        &self,
        entry_id: QueueEntryId,
    ) -> Result<Option<QueueEntryClaim>, PersistenceError>;
}
