//! Infrastructure layer: stores, bus and cache adapters, evaluator client,
//! configuration, and the submission/consumption pipeline built on them.

pub mod config;
pub mod evaluator;
pub mod message_bus;
pub mod pipeline;
pub mod queue_store;
pub mod reference_cache;

#[cfg(test)]
mod integration_tests;

pub use config::{ConsumptionSchedule, PipelineConfig, ValidationPolicy};
pub use pipeline::{BatchOrchestrator, BatchReceipt, PipelineError, TransactionFailure};
