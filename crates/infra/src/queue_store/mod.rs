//! Queue entry + claim persistence boundary.
//!
//! Both stores share one session type, so an entry and its claim are always
//! written inside the same transaction.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryQueueStore, InMemorySession, SessionStats};
pub use postgres::{PgSession, PostgresQueueStore};
pub use r#trait::{
    ClaimStore, EntryStatus, PersistenceError, QueueEntry, QueueEntryClaim, QueueEntryStore,
    Session, SessionFactory, StatusView,
};
