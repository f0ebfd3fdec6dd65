//! Infrastructure message bus implementations.
//!
//! The bus abstraction lives in `claimflow-messaging`; this module provides the
//! Redis-backed transport.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsMessageBus;
