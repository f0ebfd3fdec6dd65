//! `claimflow-core`: shared building blocks for the claim pipeline.
//!
//! This crate contains **pure** types (no infrastructure concerns): identifiers,
//! the incoming lab-test request shape, and the requesting user.

pub mod error;
pub mod id;
pub mod request;
pub mod user;

pub use error::{DomainError, DomainResult};
pub use id::{ClaimId, QueueEntryId, WorkItemId};
pub use request::{IncomingRequest, RequestBody};
pub use user::RequestingUser;
