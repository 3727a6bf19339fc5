//! Statistics collection
//!
//! Lock-free counters for the hot path plus a small mutex-guarded table of
//! per-quality-class latency accumulators.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::entry::{QualityClass, duration_millis};

/// Tier that served a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTier {
    Local,
    Shared,
}

#[derive(Debug, Default)]
struct LatencyAccumulator {
    reads: u64,
    read_total_us: u64,
    read_max_us: u64,
    sla_breaches: u64,
    computations: u64,
    compute_total_us: u64,
    compute_max_us: u64,
}

/// Latency figures for one quality class
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyClassStats {
    /// Cache reads served
    pub reads: u64,
    pub avg_read_ms: f64,
    pub max_read_ms: f64,
    /// Latency target, if the class has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_ms: Option<u64>,
    /// Reads slower than the target
    pub sla_breaches: u64,
    /// Factory runs
    pub computations: u64,
    pub avg_compute_ms: f64,
    pub max_compute_ms: f64,
}

/// Snapshot of engine statistics, as served by a diagnostics endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Entries held by the local tier
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups that hit, 0 when there were none
    pub hit_rate: f64,
    pub local_hits: u64,
    pub shared_hits: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Writes that could only reach the local tier
    pub fallback_writes: u64,
    /// Callers that awaited another caller's computation
    pub coalesced: u64,
    pub in_flight: usize,
    pub latency_class_stats: BTreeMap<QualityClass, LatencyClassStats>,
    pub background_refreshes: u64,
    pub background_refresh_failures: u64,
    pub etl_events: u64,
    pub etl_invalidations: u64,
    pub warming_keys: usize,
    pub warming_runs: u64,
    pub keys_flagged: u64,
    pub shared_available: bool,
    pub shared_failures: u64,
}

#[derive(Debug, Default)]
pub struct StatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    fallback_writes: AtomicU64,
    background_refreshes: AtomicU64,
    background_refresh_failures: AtomicU64,
    etl_events: AtomicU64,
    etl_invalidations: AtomicU64,
    latency: Mutex<HashMap<QualityClass, LatencyAccumulator>>,
}

impl StatsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: HitTier) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        match tier {
            HitTier::Local => self.local_hits.fetch_add(1, Ordering::Relaxed),
            HitTier::Shared => self.shared_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_write(&self) {
        self.fallback_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_background_refresh(&self, succeeded: bool) {
        if succeeded {
            self.background_refreshes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.background_refresh_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_etl_event(&self) {
        self.etl_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_etl_invalidation(&self) {
        self.etl_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the latency of a read served from cache
    pub fn record_read_latency(&self, class: QualityClass, elapsed: Duration, sla: Option<Duration>) {
        let us = duration_micros(elapsed);
        let mut latency = self.latency.lock();
        let acc = latency.entry(class).or_default();
        acc.reads += 1;
        acc.read_total_us = acc.read_total_us.saturating_add(us);
        acc.read_max_us = acc.read_max_us.max(us);
        if sla.is_some_and(|sla| elapsed > sla) {
            acc.sla_breaches += 1;
        }
    }

    /// Record the duration of a factory run
    pub fn record_compute_latency(&self, class: QualityClass, elapsed: Duration) {
        let us = duration_micros(elapsed);
        let mut latency = self.latency.lock();
        let acc = latency.entry(class).or_default();
        acc.computations += 1;
        acc.compute_total_us = acc.compute_total_us.saturating_add(us);
        acc.compute_max_us = acc.compute_max_us.max(us);
    }

    /// Fill the counter fields of a [`CacheStats`]
    ///
    /// `sla` supplies each class's latency target. Fields owned by other
    /// components are left at their defaults.
    pub fn snapshot(&self, sla: impl Fn(QualityClass) -> Option<Duration>) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        let latency_class_stats = self
            .latency
            .lock()
            .iter()
            .map(|(class, acc)| (*class, acc.to_stats(sla(*class))))
            .collect();

        CacheStats {
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            fallback_writes: self.fallback_writes.load(Ordering::Relaxed),
            latency_class_stats,
            background_refreshes: self.background_refreshes.load(Ordering::Relaxed),
            background_refresh_failures: self.background_refresh_failures.load(Ordering::Relaxed),
            etl_events: self.etl_events.load(Ordering::Relaxed),
            etl_invalidations: self.etl_invalidations.load(Ordering::Relaxed),
            ..CacheStats::default()
        }
    }
}

impl LatencyAccumulator {
    #[allow(clippy::cast_precision_loss)]
    fn to_stats(&self, sla: Option<Duration>) -> LatencyClassStats {
        let avg = |total: u64, count: u64| {
            if count == 0 { 0.0 } else { total as f64 / count as f64 / 1000.0 }
        };
        LatencyClassStats {
            reads: self.reads,
            avg_read_ms: avg(self.read_total_us, self.reads),
            max_read_ms: self.read_max_us as f64 / 1000.0,
            sla_ms: sla.map(duration_millis),
            sla_breaches: self.sla_breaches,
            computations: self.computations,
            avg_compute_ms: avg(self.compute_total_us, self.computations),
            max_compute_ms: self.compute_max_us as f64 / 1000.0,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        let rate = hits as f64 / total as f64 * 100.0;
        (rate * 100.0).round() / 100.0
    }
}

fn duration_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        assert!((hit_rate(0, 0) - 0.0).abs() < f64::EPSILON);
        assert!((hit_rate(1, 2) - 33.33).abs() < 1e-9);
        assert!((hit_rate(4, 0) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counters() {
        let stats = StatsCollector::new();
        stats.record_hit(HitTier::Local);
        stats.record_hit(HitTier::Shared);
        stats.record_miss();
        stats.record_background_refresh(true);
        stats.record_background_refresh(false);

        let snapshot = stats.snapshot(|_| None);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.local_hits, 1);
        assert_eq!(snapshot.shared_hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.background_refreshes, 1);
        assert_eq!(snapshot.background_refresh_failures, 1);
    }

    #[test]
    fn test_latency_by_class_and_sla() {
        let stats = StatsCollector::new();
        let sla = Some(Duration::from_millis(100));
        stats.record_read_latency(QualityClass::LatencySensitive, Duration::from_millis(10), sla);
        stats.record_read_latency(QualityClass::LatencySensitive, Duration::from_millis(150), sla);
        stats.record_compute_latency(QualityClass::Standard, Duration::from_millis(40));

        let snapshot = stats.snapshot(|class| match class {
            QualityClass::LatencySensitive => sla,
            QualityClass::Standard => None,
        });
        let kpi = &snapshot.latency_class_stats[&QualityClass::LatencySensitive];
        assert_eq!(kpi.reads, 2);
        assert_eq!(kpi.sla_breaches, 1);
        assert_eq!(kpi.sla_ms, Some(100));
        assert!((kpi.avg_read_ms - 80.0).abs() < 1e-9);

        let standard = &snapshot.latency_class_stats[&QualityClass::Standard];
        assert_eq!(standard.computations, 1);
        assert_eq!(standard.reads, 0);

        let json = serde_json::to_value(&snapshot).unwrap_or_default();
        assert!(json["latency_class_stats"]["latency-sensitive"].is_object());
    }
}
