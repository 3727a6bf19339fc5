//! Error types for the cache engine

use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the cache engine
///
/// Infrastructure failures (`TierUnavailable`, most `Serialization` cases) are
/// absorbed inside the engine and only show up in logs and stats. The error a
/// caller actually sees from [`get_or_set`](crate::CacheEngine::get_or_set) is
/// either its own factory error or an argument problem.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Shared backend unreachable or timed out
    #[error("shared tier unavailable during {op}: {reason}")]
    TierUnavailable {
        /// Operation that failed (e.g. "get", "publish")
        op: &'static str,
        /// Backend error or timeout description
        reason: String,
    },

    /// The caller-supplied computation failed
    ///
    /// Every coalesced waiter receives a clone of the same error.
    #[error("{0}")]
    Factory(Arc<anyhow::Error>),

    /// A value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Malformed key, tag, pattern or option
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid engine configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    pub(crate) fn factory(err: anyhow::Error) -> Self {
        Self::Factory(Arc::new(err))
    }

    /// The caller's original error, when this is a factory failure
    ///
    /// Use `downcast_ref` on the result to recover the concrete error type.
    #[must_use]
    pub fn factory_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Factory(err) => Some(err.as_ref()),
            _ => None,
        }
    }

    /// Whether this error came from the caller's computation
    #[must_use]
    pub fn is_factory(&self) -> bool {
        matches!(self, Self::Factory(_))
    }
}

/// Result alias used across the crate's public API
pub type CacheResult<T> = Result<T, CacheError>;
