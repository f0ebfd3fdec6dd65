//! Process-wide tracing setup shared by the claimflow binaries.

/// Initialize process-wide observability (tracing/logging) from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;
