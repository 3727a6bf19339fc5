//! Local Tier - Bounded In-Process Cache
//!
//! `DashMap`-backed cache that acts as write-through buffer in front of the
//! shared tier and as sole store while the shared tier is degraded.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::entry::CacheEntry;
use crate::traits::{KeyFilter, StorageTier, TierResult};

/// Fraction of entries reclaimed when the size ceiling is exceeded
const EVICTION_FRACTION: f64 = 0.2;

/// Bounded concurrent map with expiry-on-read
///
/// **Features**:
/// - Expiry checked on every read; expired entries are removed and count as misses
/// - Periodic sweep via [`cleanup_expired`](Self::cleanup_expired)
/// - Size ceiling; when exceeded, the 20% of entries closest to expiry are
///   evicted (an expiry-ordered approximation of LRU)
/// - Tags are kept on the entries themselves, so tag removal is a linear scan
pub struct LocalTier {
    map: Arc<DashMap<String, CacheEntry>>,
    max_entries: usize,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    sets: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
    expirations: Arc<AtomicU64>,
}

impl LocalTier {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        debug!(max_entries, "Initializing local tier");

        Self {
            map: Arc::new(DashMap::new()),
            max_entries: max_entries.max(1),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            sets: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
            expirations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get a live entry, removing it if expired
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.map.get(key) {
            if entry.is_expired() {
                drop(entry); // Release read lock
                self.map.remove_if(key, |_, e| e.is_expired());
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Live entry without touching hit/miss counters
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.map.get(key).filter(|e| !e.is_expired()).map(|e| e.clone())
    }

    /// Insert or replace an entry, evicting if the ceiling is exceeded
    pub fn insert(&self, key: &str, entry: CacheEntry) {
        self.map.insert(key.to_string(), entry);
        self.sets.fetch_add(1, Ordering::Relaxed);
        if self.map.len() > self.max_entries {
            self.evict_nearest_expiry();
        }
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.map.remove(key).map(|(_, entry)| entry)
    }

    /// Remaining TTL of a live entry
    #[must_use]
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        self.map
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.remaining_ttl())
    }

    /// Remove every entry carrying `tag`, returning the removed keys
    pub fn remove_tagged(&self, tag: &str) -> Vec<String> {
        self.remove_where(|_, entry| entry.has_tag(tag))
    }

    /// Remove every entry whose key is selected by `filter`
    pub fn remove_matching(&self, filter: &KeyFilter) -> Vec<String> {
        self.remove_where(|key, _| filter.matches(key))
    }

    fn remove_where(&self, mut predicate: impl FnMut(&str, &CacheEntry) -> bool) -> Vec<String> {
        let mut removed = Vec::new();
        self.map.retain(|key, entry| {
            if predicate(key, entry) {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Keys selected by `filter`, live entries only
    #[must_use]
    pub fn keys(&self, filter: &KeyFilter) -> Vec<String> {
        self.map
            .iter()
            .filter(|e| !e.value().is_expired() && filter.matches(e.key()))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Drop expired entries (called periodically by the engine)
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(count = removed, "[Local] Cleaned up expired entries");
        }
        removed
    }

    /// Evict the 20% of entries nearest to expiry
    fn evict_nearest_expiry(&self) -> usize {
        let mut by_expiry: Vec<(u64, String)> = self
            .map
            .iter()
            .map(|e| (e.value().expires_at_ms, e.key().clone()))
            .collect();
        by_expiry.sort_unstable();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let count = ((by_expiry.len() as f64) * EVICTION_FRACTION).ceil() as usize;
        let count = count.max(1);

        for (_, key) in by_expiry.iter().take(count) {
            self.map.remove(key);
        }
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        debug!(evicted = count, size = self.map.len(), "[Local] Size ceiling exceeded, evicted nearest-to-expiry entries");
        count
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> LocalTierStats {
        LocalTierStats {
            size: self.map.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Counters kept by the local tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LocalTierStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
}

// ===== Trait Implementations =====

use async_trait::async_trait;

/// The local tier is always reachable
#[async_trait]
impl StorageTier for LocalTier {
    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        TierResult::Available(self.get_entry(key))
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> TierResult<()> {
        self.insert(key, entry.clone());
        TierResult::Available(())
    }

    async fn delete(&self, key: &str) -> TierResult<bool> {
        TierResult::Available(self.remove(key).is_some())
    }

    async fn scan_keys(&self, filter: &KeyFilter) -> TierResult<Vec<String>> {
        TierResult::Available(self.keys(filter))
    }

    fn name(&self) -> &'static str {
        "Local"
    }
}
