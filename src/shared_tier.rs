//! Shared tier wrapper
//!
//! [`SharedTier`] puts a timeout around every [`SharedBackend`] call and turns
//! every error into [`TierResult::Unavailable`]. After a failure the tier is
//! marked degraded and calls short-circuit until `retry_interval` has passed;
//! the next call after that is a trial that either restores the tier or keeps
//! it degraded for another interval.
//!
//! Writes the backend misses while degraded are remembered as
//! [`MissedWrite`]s, bounded by the journal capacity, so the engine can replay
//! them once the tier answers again.

use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::entry::{CacheEntry, duration_millis};
use crate::error::CacheError;
use crate::traits::{KeyFilter, SharedBackend, StorageTier, TierResult};

const DEFAULT_JOURNAL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Health {
    degraded_since: Option<Instant>,
    last_failure: Option<Instant>,
}

/// A mutation the shared backend did not see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissedWrite {
    /// Key written or deleted locally; replay mirrors the local state
    Key(String),
    /// Tag invalidated
    Tag(String),
    /// Keys selected by a filter removed (clear or pattern invalidation)
    Filter(KeyFilter),
}

/// Degrading wrapper around the shared backend
pub struct SharedTier {
    backend: Option<Arc<dyn SharedBackend>>,
    timeout: Duration,
    retry_interval: Duration,
    health: Mutex<Health>,
    failures: AtomicU64,
    skipped: AtomicU64,
    journal: Mutex<VecDeque<MissedWrite>>,
    journal_capacity: usize,
    replay_pending: AtomicBool,
    replay_gate: tokio::sync::Mutex<()>,
}

impl SharedTier {
    pub fn new(backend: Arc<dyn SharedBackend>, timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            backend: Some(backend),
            timeout,
            retry_interval,
            health: Mutex::new(Health::default()),
            failures: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            journal: Mutex::new(VecDeque::new()),
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            replay_pending: AtomicBool::new(false),
            replay_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// A tier with no backend: every call is `Unavailable` (local-only mode)
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            backend: None,
            timeout: Duration::from_millis(1),
            retry_interval: Duration::MAX,
            health: Mutex::new(Health::default()),
            failures: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            journal: Mutex::new(VecDeque::new()),
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            replay_pending: AtomicBool::new(false),
            replay_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Bound the number of remembered missed writes
    #[must_use]
    pub fn with_journal_capacity(mut self, capacity: usize) -> Self {
        self.journal_capacity = capacity.max(1);
        self
    }

    /// Whether calls currently reach the backend
    ///
    /// A degraded tier reports available again once the retry interval has
    /// elapsed, so the next call retries the backend.
    #[must_use]
    pub fn is_available(&self) -> bool {
        if self.backend.is_none() {
            return false;
        }
        let health = self.health.lock();
        match health.last_failure {
            Some(at) if health.degraded_since.is_some() => at.elapsed() >= self.retry_interval,
            _ => true,
        }
    }

    /// Whether a backend is configured at all
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map_or("none", |b| b.name())
    }

    /// Number of failed or timed-out backend calls
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Number of calls short-circuited while degraded
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    fn usable(&self) -> Option<&Arc<dyn SharedBackend>> {
        let backend = self.backend.as_ref()?;
        if self.is_available() {
            Some(backend)
        } else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    async fn guard<T, Fut>(&self, op: &'static str, fut: Fut) -> TierResult<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                self.mark_healthy();
                TierResult::Available(value)
            }
            Ok(Err(e)) => {
                self.mark_failed(&CacheError::TierUnavailable {
                    op,
                    reason: format!("{e:#}"),
                });
                TierResult::Unavailable
            }
            Err(_) => {
                self.mark_failed(&CacheError::TierUnavailable {
                    op,
                    reason: format!("timed out after {}ms", duration_millis(self.timeout)),
                });
                TierResult::Unavailable
            }
        }
    }

    /// Record that the backend could not be reached outside of a call
    pub(crate) fn mark_unreachable(&self, op: &'static str, reason: String) {
        self.mark_failed(&CacheError::TierUnavailable { op, reason });
    }

    // ===== Missed writes =====

    /// Remember a mutation the backend did not see
    ///
    /// A repeated write moves to the back of the journal. A full journal
    /// collapses into a single full clear, which is always a safe replay for a
    /// cache. No-op without a backend.
    pub fn record_missed(&self, write: MissedWrite) {
        if self.backend.is_none() {
            return;
        }
        let mut journal = self.journal.lock();
        if write == MissedWrite::Filter(KeyFilter::All) {
            journal.clear();
        } else if let Some(pos) = journal.iter().position(|w| *w == write) {
            journal.remove(pos);
        } else if journal.len() >= self.journal_capacity {
            warn!(
                capacity = self.journal_capacity,
                "Missed-write journal full, a full clear will be replayed on recovery"
            );
            journal.clear();
            journal.push_back(MissedWrite::Filter(KeyFilter::All));
        }
        journal.push_back(write);
        self.replay_pending.store(true, Ordering::SeqCst);
    }

    /// Whether missed writes are waiting and the backend can take them
    #[must_use]
    pub fn needs_replay(&self) -> bool {
        self.replay_pending.load(Ordering::SeqCst) && self.is_available()
    }

    /// Number of missed writes waiting for replay
    #[must_use]
    pub fn missed_writes(&self) -> usize {
        self.journal.lock().len()
    }

    /// Serializes replays; held for the whole replay
    pub(crate) async fn replay_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.replay_gate.lock().await
    }

    /// Take every missed write, oldest first
    ///
    /// [`needs_replay`](Self::needs_replay) keeps reporting `true` until
    /// [`finish_replay`](Self::finish_replay), so concurrent readers wait on
    /// the replay lock instead of reading stale shared entries.
    pub(crate) fn take_missed(&self) -> Vec<MissedWrite> {
        self.journal.lock().drain(..).collect()
    }

    /// Put back writes that were not replayed, ahead of any recorded since
    pub(crate) fn finish_replay(&self, unapplied: Vec<MissedWrite>) {
        let mut journal = self.journal.lock();
        for write in unapplied.into_iter().rev() {
            if !journal.contains(&write) {
                journal.push_front(write);
            }
        }
        self.replay_pending.store(!journal.is_empty(), Ordering::SeqCst);
    }

    fn mark_healthy(&self) {
        let mut health = self.health.lock();
        if let Some(since) = health.degraded_since.take() {
            info!(
                backend = self.backend_name(),
                degraded_for_ms = duration_millis(since.elapsed()),
                "Shared tier recovered"
            );
        }
        health.last_failure = None;
    }

    fn mark_failed(&self, err: &CacheError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut health = self.health.lock();
        let now = Instant::now();
        if health.degraded_since.is_none() {
            health.degraded_since = Some(now);
            warn!(backend = self.backend_name(), error = %err, "Shared tier unavailable, falling back to local tier");
        } else {
            debug!(backend = self.backend_name(), error = %err, "Shared tier still unavailable");
        }
        health.last_failure = Some(now);
    }

    pub async fn get_raw(&self, key: &str) -> TierResult<Option<Vec<u8>>> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("get", backend.get(key)).await
    }

    pub async fn set_raw(&self, key: &str, value: &[u8], ttl: Duration) -> TierResult<()> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("set", backend.set_with_ttl(key, value, ttl)).await
    }

    pub async fn remove_bulk(&self, keys: &[String]) -> TierResult<usize> {
        if keys.is_empty() {
            return TierResult::Available(0);
        }
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("remove_bulk", backend.remove_bulk(keys)).await
    }

    pub async fn tag_add(&self, tag: &str, key: &str, ttl: Duration) -> TierResult<()> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("tag_add", backend.tag_add(tag, key, ttl)).await
    }

    pub async fn tag_members(&self, tag: &str) -> TierResult<Vec<String>> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("tag_members", backend.tag_members(tag)).await
    }

    pub async fn tag_remove_member(&self, tag: &str, key: &str) -> TierResult<()> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("tag_remove_member", backend.tag_remove_member(tag, key)).await
    }

    pub async fn tag_drop(&self, tag: &str) -> TierResult<()> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("tag_drop", backend.tag_drop(tag)).await
    }

    pub async fn tag_drop_all(&self) -> TierResult<usize> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("tag_drop_all", backend.tag_drop_all()).await
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> TierResult<()> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("publish", backend.publish(channel, payload)).await
    }

    /// Open a subscription stream
    ///
    /// Only establishing the subscription is bounded by the timeout; the
    /// returned stream is long-lived.
    pub async fn subscribe(&self, channel: &str) -> TierResult<BoxStream<'static, String>> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("subscribe", backend.subscribe(channel)).await
    }

    pub async fn health_check(&self) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        match tokio::time::timeout(self.timeout, backend.health_check()).await {
            Ok(true) => {
                self.mark_healthy();
                true
            }
            Ok(false) => {
                self.mark_failed(&CacheError::TierUnavailable {
                    op: "health_check",
                    reason: "backend reported unhealthy".into(),
                });
                false
            }
            Err(_) => {
                self.mark_failed(&CacheError::TierUnavailable {
                    op: "health_check",
                    reason: "timed out".into(),
                });
                false
            }
        }
    }
}

/// Entry-level view of the shared tier
///
/// Entries are JSON-encoded. An entry that fails to encode is reported
/// `Unavailable` for that write so the engine keeps it local-only; one that
/// fails to decode is treated as absent.
#[async_trait::async_trait]
impl StorageTier for SharedTier {
    async fn get(&self, key: &str) -> TierResult<Option<CacheEntry>> {
        self.get_raw(key).await.map(|bytes| {
            bytes.and_then(|bytes| match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) if !entry.is_expired() => Some(entry),
                Ok(_) => None,
                Err(e) => {
                    warn!(key = %key, error = %e, "Undecodable entry in shared tier, treating as miss");
                    None
                }
            })
        })
    }

    async fn set(&self, key: &str, entry: &CacheEntry) -> TierResult<()> {
        let bytes = match serde_json::to_vec(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = CacheError::Serialization(e.to_string());
                warn!(key = %key, error = %err, "Entry not encodable for shared tier, keeping it local");
                return TierResult::Unavailable;
            }
        };
        self.set_raw(key, &bytes, entry.remaining_ttl()).await
    }

    async fn delete(&self, key: &str) -> TierResult<bool> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("delete", backend.remove(key)).await
    }

    async fn scan_keys(&self, filter: &KeyFilter) -> TierResult<Vec<String>> {
        let Some(backend) = self.usable() else {
            return TierResult::Unavailable;
        };
        self.guard("scan_keys", backend.scan_keys(filter)).await
    }

    fn name(&self) -> &'static str {
        "Shared"
    }
}
