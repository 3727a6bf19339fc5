//! Warming scheduler
//!
//! Keeps a registry of latency-sensitive keys and periodically checks how much
//! of their TTL is left. Keys close to expiry are flagged; the next read of a
//! flagged key refreshes it in the background. Keys that have disappeared from
//! both tiers are dropped from the registry.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

use crate::backends::LocalTier;
use crate::entry::QualityClass;
use crate::shared_tier::SharedTier;
use crate::traits::{KeyFilter, StorageTier, TierResult};

#[derive(Debug, Clone)]
struct Registration {
    quality_class: QualityClass,
    registered_at: Instant,
    flagged: bool,
}

/// Outcome of one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmingReport {
    /// Keys examined
    pub scanned: usize,
    /// Keys whose remaining TTL is below the threshold
    pub flagged: Vec<String>,
    /// Keys dropped from the registry because no tier holds them
    pub removed: usize,
}

/// Warming counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmingStats {
    pub registered: usize,
    pub runs: u64,
    pub keys_flagged: u64,
}

pub struct WarmingScheduler {
    registry: DashMap<String, Registration>,
    runs: AtomicU64,
    flagged: AtomicU64,
}

impl WarmingScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: DashMap::new(),
            runs: AtomicU64::new(0),
            flagged: AtomicU64::new(0),
        }
    }

    /// Track a key; re-registering resets its flag
    pub fn register(&self, key: &str, quality_class: QualityClass) {
        self.registry.insert(
            key.to_string(),
            Registration {
                quality_class,
                registered_at: Instant::now(),
                flagged: false,
            },
        );
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.registry.remove(key).is_some()
    }

    /// Drop every registration selected by `filter`
    pub fn unregister_matching(&self, filter: &KeyFilter) -> usize {
        let before = self.registry.len();
        self.registry.retain(|key, _| !filter.matches(key));
        before - self.registry.len()
    }

    pub fn clear(&self) {
        self.registry.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    #[must_use]
    pub fn is_registered(&self, key: &str) -> bool {
        self.registry.contains_key(key)
    }

    /// Whether the last pass flagged `key`
    #[must_use]
    pub fn is_flagged(&self, key: &str) -> bool {
        self.registry.get(key).is_some_and(|r| r.flagged)
    }

    /// Examine every registered key once
    ///
    /// The entry is looked up locally first and in the shared tier otherwise.
    /// A key is only dropped when the shared tier positively reports it absent
    /// (or there is no shared tier); an unreachable shared tier keeps it.
    pub async fn tick(&self, local: &LocalTier, shared: &SharedTier, threshold: f64) -> WarmingReport {
        self.runs.fetch_add(1, Ordering::Relaxed);

        let keys: Vec<String> = self.registry.iter().map(|r| r.key().clone()).collect();
        let mut report = WarmingReport {
            scanned: keys.len(),
            ..WarmingReport::default()
        };

        for key in keys {
            let entry = match local.peek(&key) {
                Some(entry) => Some(entry),
                None if shared.is_configured() => match shared.get(&key).await {
                    TierResult::Available(entry) => entry,
                    // Unknown, check again next pass
                    TierResult::Unavailable => continue,
                },
                None => None,
            };

            let Some(entry) = entry else {
                if self.registry.remove(&key).is_some() {
                    report.removed += 1;
                }
                continue;
            };

            let below = entry.is_below_fraction(threshold);
            if let Some(mut registration) = self.registry.get_mut(&key) {
                registration.flagged = below;
            }
            if below {
                report.flagged.push(key);
            }
        }

        self.flagged.fetch_add(report.flagged.len() as u64, Ordering::Relaxed);
        debug!(
            scanned = report.scanned,
            flagged = report.flagged.len(),
            removed = report.removed,
            "Warming pass complete"
        );
        report
    }

    /// Registered keys of a class, oldest registration first
    #[must_use]
    pub fn keys_for(&self, quality_class: QualityClass) -> Vec<String> {
        let mut keys: Vec<(Instant, String)> = self
            .registry
            .iter()
            .filter(|r| r.quality_class == quality_class)
            .map(|r| (r.registered_at, r.key().clone()))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, key)| key).collect()
    }

    #[must_use]
    pub fn stats(&self) -> WarmingStats {
        WarmingStats {
            registered: self.registry.len(),
            runs: self.runs.load(Ordering::Relaxed),
            keys_flagged: self.flagged.load(Ordering::Relaxed),
        }
    }
}

impl Default for WarmingScheduler {
    fn default() -> Self {
        Self::new()
    }
}
