//! Memory Tier - In-Process Shared Backend
//!
//! A [`SharedBackend`] that lives in process memory. Several engines holding the
//! same `Arc<MemoryTier>` behave like several server instances sharing one
//! Redis: same keyspace, same tag sets, same pub/sub channels.
//!
//! It also simulates an unhealthy store: [`set_offline`](MemoryTier::set_offline)
//! makes every call fail and ends open subscriptions, like a dropped Redis
//! connection, and [`set_latency`](MemoryTier::set_latency) delays
//! every call, which is how fallback and timeout behaviour is exercised without
//! a real network.

use anyhow::{Result, bail};
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::traits::{KeyFilter, SharedBackend};

const CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct TagSet {
    members: HashSet<String>,
    expires_at: Instant,
}

/// In-process stand-in for a shared store
pub struct MemoryTier {
    data: DashMap<String, StoredValue>,
    tags: DashMap<String, TagSet>,
    bus: broadcast::Sender<(String, String)>,
    outages: broadcast::Sender<()>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    published: AtomicU64,
}

impl MemoryTier {
    #[must_use]
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (outages, _) = broadcast::channel(1);
        Self {
            data: DashMap::new(),
            tags: DashMap::new(),
            bus,
            outages,
            offline: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    /// Make every call fail (`true`) or succeed again (`false`)
    ///
    /// Going offline ends every open subscription stream.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if offline {
            let _ = self.outages.send(());
        }
        debug!(offline, "[Memory] Availability changed");
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Number of live data keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.iter().filter(|e| e.value().expires_at > Instant::now()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a tag set currently exists
    #[must_use]
    pub fn has_tag_set(&self, tag: &str) -> bool {
        self.tags.get(tag).is_some_and(|set| set.expires_at > Instant::now())
    }

    /// Number of messages published so far
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    async fn simulate(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            bail!("memory tier is offline");
        }
        Ok(())
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Trait Implementations =====

use async_trait::async_trait;

#[async_trait]
impl SharedBackend for MemoryTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.simulate().await?;
        let Some(stored) = self.data.get(key) else {
            return Ok(None);
        };
        if stored.expires_at <= Instant::now() {
            drop(stored);
            self.data.remove_if(key, |_, v| v.expires_at <= Instant::now());
            return Ok(None);
        }
        Ok(Some(stored.bytes.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.simulate().await?;
        self.data.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.simulate().await?;
        Ok(self
            .data
            .remove(key)
            .is_some_and(|(_, v)| v.expires_at > Instant::now()))
    }

    async fn remove_bulk(&self, keys: &[String]) -> Result<usize> {
        self.simulate().await?;
        let now = Instant::now();
        Ok(keys
            .iter()
            .filter_map(|key| self.data.remove(key))
            .filter(|(_, v)| v.expires_at > now)
            .count())
    }

    async fn scan_keys(&self, filter: &KeyFilter) -> Result<Vec<String>> {
        self.simulate().await?;
        let now = Instant::now();
        Ok(self
            .data
            .iter()
            .filter(|e| e.value().expires_at > now && filter.matches(e.key()))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn tag_add(&self, tag: &str, key: &str, ttl: Duration) -> Result<()> {
        self.simulate().await?;
        let now = Instant::now();
        let expires_at = now + ttl;
        let mut set = self.tags.entry(tag.to_string()).or_insert_with(|| TagSet {
            members: HashSet::new(),
            expires_at,
        });
        if set.expires_at <= now {
            set.members.clear();
        }
        set.members.insert(key.to_string());
        if set.expires_at < expires_at {
            set.expires_at = expires_at;
        }
        Ok(())
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>> {
        self.simulate().await?;
        Ok(self
            .tags
            .get(tag)
            .filter(|set| set.expires_at > Instant::now())
            .map(|set| set.members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn tag_remove_member(&self, tag: &str, key: &str) -> Result<()> {
        self.simulate().await?;
        if let Some(mut set) = self.tags.get_mut(tag) {
            set.members.remove(key);
        }
        self.tags.remove_if(tag, |_, set| set.members.is_empty());
        Ok(())
    }

    async fn tag_drop(&self, tag: &str) -> Result<()> {
        self.simulate().await?;
        self.tags.remove(tag);
        Ok(())
    }

    async fn tag_drop_all(&self) -> Result<usize> {
        self.simulate().await?;
        let count = self.tags.len();
        self.tags.clear();
        Ok(count)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.simulate().await?;
        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is not an error, same as Redis PUBLISH returning 0
        let _ = self.bus.send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        self.simulate().await?;
        let rx = self.bus.subscribe();
        let outage_rx = self.outages.subscribe();
        let channel = channel.to_string();

        let stream = futures_util::stream::unfold((rx, outage_rx), move |(mut rx, mut outage_rx)| {
            let channel = channel.clone();
            async move {
                loop {
                    let message = tokio::select! {
                        message = rx.recv() => message,
                        _ = outage_rx.recv() => {
                            debug!("[Memory] Subscription dropped by outage");
                            return None;
                        }
                    };
                    match message {
                        Ok((ch, payload)) if ch == channel => return Some((payload, (rx, outage_rx))),
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "[Memory] Subscriber lagged, messages dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> bool {
        self.simulate().await.is_ok()
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
