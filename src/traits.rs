//! Storage tier traits
//!
//! This module defines the two seams of the engine:
//!
//! - `StorageTier`: the common contract both tiers satisfy
//!   (`get` / `set` / `delete` / `scan_keys`), returning [`TierResult`] so a tier
//!   can report itself unavailable instead of failing.
//! - `SharedBackend`: the raw, byte-level contract of a cross-process store with
//!   tag sets and pub/sub. Backends return `anyhow::Result`; the
//!   [`SharedTier`](crate::shared_tier::SharedTier) wrapper turns every error and
//!   timeout into [`TierResult::Unavailable`].
//!
//! # Example: Custom Shared Backend
//!
//! ```rust,ignore
//! use shared_cache_engine::{SharedBackend, KeyFilter, async_trait};
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct MyStore { /* ... */ }
//!
//! #[async_trait]
//! impl SharedBackend for MyStore {
//!     async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> { /* ... */ }
//!     async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> { /* ... */ }
//!     // ... remaining methods
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

use crate::entry::CacheEntry;

/// Outcome of a tier call
///
/// `Unavailable` is not an error: it tells the engine to fall back to the
/// local tier (reads) or keep the write local-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierResult<T> {
    Available(T),
    Unavailable,
}

impl<T> TierResult<T> {
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    /// Convert into `Option`, mapping `Unavailable` to `None`
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Available(v) => Some(v),
            Self::Unavailable => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TierResult<U> {
        match self {
            Self::Available(v) => TierResult::Available(f(v)),
            Self::Unavailable => TierResult::Unavailable,
        }
    }
}

/// Key selection for scans and bulk removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    All,
    Prefix(String),
    Contains(String),
}

impl KeyFilter {
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Contains(needle) => key.contains(needle.as_str()),
        }
    }

    /// Build from an optional prefix (`None` selects everything)
    #[must_use]
    pub fn from_prefix(prefix: Option<&str>) -> Self {
        match prefix {
            Some(p) if !p.is_empty() => Self::Prefix(p.to_string()),
            _ => Self::All,
        }
    }
}

/// Common contract of the local and shared tiers
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the engine calls them from many tasks.
#[async_trait]
pub trait StorageTier: Send + Sync {
    /// Get a live entry
    ///
    /// * `Available(Some(entry))` - entry found and not expired
    /// * `Available(None)` - key absent or expired
    /// * `Unavailable` - tier could not be reached
    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>>;

    /// Store an entry, replacing any previous one; TTL comes from the entry
    async fn set(&self, key: &str, entry: &CacheEntry) -> TierResult<()>;

    /// Remove a key; `Available(false)` when it was not present
    async fn delete(&self, key: &str) -> TierResult<bool>;

    /// Enumerate keys selected by `filter`
    async fn scan_keys(&self, filter: &KeyFilter) -> TierResult<Vec<String>>;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Cross-process store behind the shared tier
///
/// Implement this trait to plug in a distributed store other than Redis.
/// Values are opaque bytes; tag sets and pub/sub are part of the contract
/// because the tag index and event bus live in the shared store.
///
/// Errors from any method are treated as "tier unavailable" by the engine.
#[async_trait]
pub trait SharedBackend: Send + Sync {
    /// Get raw bytes for a key, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store bytes with a time-to-live
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Remove a key, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Remove many keys, returning how many existed
    async fn remove_bulk(&self, keys: &[String]) -> Result<usize>;

    /// Enumerate data keys (never tag sets) selected by `filter`
    async fn scan_keys(&self, filter: &KeyFilter) -> Result<Vec<String>>;

    /// Add `key` to the member set of `tag`
    ///
    /// The set must live at least as long as `ttl`.
    async fn tag_add(&self, tag: &str, key: &str, ttl: Duration) -> Result<()>;

    /// Member keys of `tag`; members may no longer be live
    async fn tag_members(&self, tag: &str) -> Result<Vec<String>>;

    /// Remove `key` from the member set of `tag`
    async fn tag_remove_member(&self, tag: &str, key: &str) -> Result<()>;

    /// Drop a tag set entirely
    async fn tag_drop(&self, tag: &str) -> Result<()>;

    /// Drop every tag set, returning how many were removed
    async fn tag_drop_all(&self) -> Result<usize>;

    /// Publish a message on a broadcast channel
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a broadcast channel
    ///
    /// The stream ends when the underlying connection is lost; callers
    /// resubscribe.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;

    /// Check that the backend is reachable
    async fn health_check(&self) -> bool;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}
