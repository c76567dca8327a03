//! Orchestration error types

use thiserror::Error;

/// Faults of the orchestration layer itself
///
/// Adapter failures never appear here: they are data inside a
/// [`TierResult`](crate::types::TierResult).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestrationError {
    /// Session deadline passed; the session ends degraded
    #[error("Session deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded { deadline_ms: u64 },

    /// Cache store unreachable; logged and bypassed
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Session store unreachable; logged and bypassed
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// Broken invariant or failed tier computation; the session ends in error
    #[error("Internal orchestration error: {0}")]
    Internal(String),
}

impl OrchestrationError {
    /// Machine-readable kind carried by terminal `error` events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::PersistenceUnavailable(_) => "persistence_unavailable",
            Self::Internal(_) => "internal",
        }
    }
}
