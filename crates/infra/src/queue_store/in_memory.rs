use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde_json::Value as JsonValue;

use claimflow_core::{QueueEntryId, WorkItemId};

use super::r#trait::{
    ClaimStore, EntryStatus, PersistenceError, QueueEntry, QueueEntryClaim, QueueEntryStore,
    Session, SessionFactory,
};

/// Counters of session lifecycle calls, for asserting commit/rollback/release discipline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub opened: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub released: usize,
}

#[derive(Debug, Default)]
struct Tables {
    entries: BTreeMap<QueueEntryId, QueueEntry>,
    claims: BTreeMap<QueueEntryId, QueueEntryClaim>,
}

#[derive(Debug, Default)]
struct Faults {
    claim_for: Mutex<HashSet<WorkItemId>>,
    entry_for: Mutex<HashSet<WorkItemId>>,
    deletes: AtomicBool,
    commit: AtomicBool,
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    faults: Faults,
    stats: Mutex<SessionStats>,
    autocommit: bool,
}

fn poisoned() -> PersistenceError {
    PersistenceError::Storage("lock poisoned".to_string())
}

impl Shared {
    fn bump(&self, f: impl FnOnce(&mut SessionStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn faulted(set: &Mutex<HashSet<WorkItemId>>, ian: &WorkItemId) -> Result<bool, PersistenceError> {
        Ok(set.lock().map_err(|_| poisoned())?.contains(ian))
    }
}

/// In-memory queue entry + claim store.
///
/// Intended for tests/dev. Sessions buffer their writes and merge them on
/// commit; `autocommit()` builds a store whose sessions write straight through
/// (rollback then undoes nothing), which makes compensation observable.
///
/// Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    shared: Arc<Shared>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn autocommit() -> Self {
        Self {
            shared: Arc::new(Shared {
                autocommit: true,
                ..Shared::default()
            }),
        }
    }

    /// Fail `create_claim` for this work item.
    pub fn fail_claim_for(&self, ian: WorkItemId) {
        if let Ok(mut set) = self.shared.faults.claim_for.lock() {
            set.insert(ian);
        }
    }

    /// Fail `create_entry` for this work item.
    pub fn fail_entry_for(&self, ian: WorkItemId) {
        if let Ok(mut set) = self.shared.faults.entry_for.lock() {
            set.insert(ian);
        }
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.shared.faults.deletes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.shared.faults.commit.store(fail, Ordering::SeqCst);
    }

    /// Committed entries, oldest first.
    pub fn entries(&self) -> Vec<QueueEntry> {
        self.shared
            .tables
            .read()
            .map(|t| t.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed claims, in entry creation order.
    pub fn claims(&self) -> Vec<QueueEntryClaim> {
        self.shared
            .tables
            .read()
            .map(|t| t.claims.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entries_for(&self, ian: &WorkItemId) -> Vec<QueueEntry> {
        self.entries().into_iter().filter(|e| &e.ian == ian).collect()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.lock().map(|s| *s).unwrap_or_default()
    }
}

/// Session over an [`InMemoryQueueStore`].
///
/// `entries` maps to `None` for entries deleted inside the session.
#[derive(Debug)]
pub struct InMemorySession {
    shared: Arc<Shared>,
    entries: BTreeMap<QueueEntryId, Option<QueueEntry>>,
    claims: BTreeMap<QueueEntryId, QueueEntryClaim>,
    closed: bool,
}

impl InMemorySession {
    fn ensure_open(&self) -> Result<(), PersistenceError> {
        if self.closed {
            return Err(PersistenceError::SessionClosed);
        }
        Ok(())
    }

    /// Entry as seen from inside this session.
    fn visible_entry(&self, id: QueueEntryId) -> Result<Option<QueueEntry>, PersistenceError> {
        if let Some(local) = self.entries.get(&id) {
            return Ok(local.clone());
        }
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        Ok(tables.entries.get(&id).cloned())
    }

    fn put_entry(&mut self, entry: QueueEntry) -> Result<(), PersistenceError> {
        if self.shared.autocommit {
            let mut tables = self.shared.tables.write().map_err(|_| poisoned())?;
            tables.entries.insert(entry.id, entry);
        } else {
            self.entries.insert(entry.id, Some(entry));
        }
        Ok(())
    }

    fn remove_entry(&mut self, id: QueueEntryId) -> Result<(), PersistenceError> {
        if self.shared.autocommit {
            let mut tables = self.shared.tables.write().map_err(|_| poisoned())?;
            tables.entries.remove(&id);
            tables.claims.remove(&id);
        } else {
            self.entries.insert(id, None);
            self.claims.remove(&id);
        }
        Ok(())
    }

    fn put_claim(&mut self, claim: QueueEntryClaim) -> Result<(), PersistenceError> {
        let exists = self.claims.contains_key(&claim.queue_entry_id)
            || self
                .shared
                .tables
                .read()
                .map_err(|_| poisoned())?
                .claims
                .contains_key(&claim.queue_entry_id);
        if exists {
            return Err(PersistenceError::Constraint(format!(
                "claim already exists for queue entry {}",
                claim.queue_entry_id
            )));
        }

        if self.shared.autocommit {
            let mut tables = self.shared.tables.write().map_err(|_| poisoned())?;
            tables.claims.insert(claim.queue_entry_id, claim);
        } else {
            self.claims.insert(claim.queue_entry_id, claim);
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.entries.clear();
        self.claims.clear();
        self.closed = true;
    }
}

#[async_trait::async_trait]
impl Session for InMemorySession {
    async fn commit(&mut self) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        if self.shared.faults.commit.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("commit failed".to_string()));
        }

        {
            let mut tables = self.shared.tables.write().map_err(|_| poisoned())?;
            for (id, entry) in std::mem::take(&mut self.entries) {
                match entry {
                    Some(entry) => {
                        tables.entries.insert(id, entry);
                    }
                    None => {
                        tables.entries.remove(&id);
                        tables.claims.remove(&id);
                    }
                }
            }
            for (id, claim) in std::mem::take(&mut self.claims) {
                tables.claims.insert(id, claim);
            }
        }

        self.closed = true;
        self.shared.bump(|s| s.committed += 1);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PersistenceError> {
        self.ensure_open()?;
        self.discard();
        self.shared.bump(|s| s.rolled_back += 1);
        Ok(())
    }

    async fn release(mut self) {
        if !self.closed {
            self.discard();
        }
        self.shared.bump(|s| s.released += 1);
    }
}

#[async_trait::async_trait]
impl SessionFactory for InMemoryQueueStore {
    type Session = InMemorySession;

    async fn open(&self) -> Result<Self::Session, PersistenceError> {
        self.shared.bump(|s| s.opened += 1);
        Ok(InMemorySession {
            shared: Arc::clone(&self.shared),
            entries: BTreeMap::new(),
            claims: BTreeMap::new(),
            closed: false,
        })
    }
}

#[async_trait::async_trait]
impl QueueEntryStore for InMemoryQueueStore {
    async fn create_entry(
        &self,
        session: &mut Self::Session,
        ian: &WorkItemId,
        payload: JsonValue,
    ) -> Result<QueueEntry, PersistenceError> {
        session.ensure_open()?;
        if Shared::faulted(&self.shared.faults.entry_for, ian)? {
            return Err(PersistenceError::Unavailable(format!(
                "injected entry failure for {ian}"
            )));
        }

        let entry = QueueEntry::new(ian.clone(), payload);
        session.put_entry(entry.clone())?;
        Ok(entry)
    }

    async fn delete_entry(
        &self,
        session: &mut Self::Session,
        entry_id: QueueEntryId,
    ) -> Result<(), PersistenceError> {
        session.ensure_open()?;
        if self.shared.faults.deletes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(format!(
                "injected delete failure for {entry_id}"
            )));
        }
        if session.visible_entry(entry_id)?.is_none() {
            return Ok(());
        }
        session.remove_entry(entry_id)
    }

    async fn update_status(
        &self,
        session: &mut Self::Session,
        entry_id: QueueEntryId,
        status: EntryStatus,
        body: JsonValue,
    ) -> Result<(), PersistenceError> {
        session.ensure_open()?;
        let mut entry = session
            .visible_entry(entry_id)?
            .ok_or(PersistenceError::EntryNotFound(entry_id))?;
        entry.status = status;
        entry.body = Some(body);
        entry.updated_at = Utc::now();
        session.put_entry(entry)
    }

    async fn latest_for(&self, ian: &WorkItemId) -> Result<Option<QueueEntry>, PersistenceError> {
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .entries
            .values()
            .filter(|e| &e.ian == ian)
            .max_by_key(|e| (e.created_at, e.id))
            .cloned())
    }

    async fn mark_failed(&self, entry_id: QueueEntryId, message: &str) -> Result<(), PersistenceError> {
        let mut tables = self.shared.tables.write().map_err(|_| poisoned())?;
        let entry = tables
            .entries
            .get_mut(&entry_id)
            .ok_or(PersistenceError::EntryNotFound(entry_id))?;
        entry.status = EntryStatus::Failed;
        entry.message = Some(message.to_string());
        entry.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClaimStore for InMemoryQueueStore {
    async fn create_claim(
        &self,
        session: &mut Self::Session,
        entry: &QueueEntry,
        claim: JsonValue,
    ) -> Result<QueueEntryClaim, PersistenceError> {
        session.ensure_open()?;
        if Shared::faulted(&self.shared.faults.claim_for, &entry.ian)? {
            return Err(PersistenceError::Unavailable(format!(
                "injected claim failure for {}",
                entry.ian
            )));
        }
        if session.visible_entry(entry.id)?.is_none() {
            return Err(PersistenceError::Constraint(format!(
                "queue entry {} does not exist",
                entry.id
            )));
        }

        let claim = QueueEntryClaim::new(entry, claim);
        session.put_claim(claim.clone())?;
        Ok(claim)
    }

    async fn find_for_entry(
        &self,
        entry_id: QueueEntryId,
    ) -> Result<Option<QueueEntryClaim>, PersistenceError> {
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        Ok(tables.claims.get(&entry_id).cloned())
    }
}
