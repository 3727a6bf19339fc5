//! Integration tests for shared tier fallback
//!
//! Tests that an unavailable or slow shared tier degrades to local-only
//! operation without failing callers, and that the engine recovers

mod common;

use common::*;
use shared_cache_engine::{CacheEngineBuilder, GetOrSetOptions, SetOptions};
use std::time::{Duration, Instant};

/// Scenario: shared tier down, set then get in the same process
#[tokio::test]
async fn test_set_get_while_shared_offline() {
    let (engine, backend) = setup_engine().await;
    backend.set_offline(true);

    assert!(engine.set("e", &99, SetOptions::default()).await);
    assert_eq!(engine.get::<i32>("e").await, Some(99));

    let stats = engine.get_stats();
    assert_eq!(stats.fallback_writes, 1);
    assert_eq!(stats.local_hits, 1);
    assert!(!stats.shared_available);
    assert!(stats.shared_failures >= 1);
    assert!(!engine.health_check().await);
    engine.shutdown().await;
}

/// A slow shared tier is cut off by the per-call timeout
#[tokio::test]
async fn test_slow_shared_tier_times_out() {
    let (engine, backend) = setup_engine().await;
    backend.set_latency(Duration::from_millis(500));

    let started = Instant::now();
    assert!(engine.set("slow", &"value", SetOptions::default()).await);
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "set took {:?}",
        started.elapsed()
    );
    assert_eq!(engine.get::<String>("slow").await.as_deref(), Some("value"));
    assert_cache_stats!(engine, fallback_writes == 1);
    engine.shutdown().await;
}

/// get_or_set keeps working (and coalescing) with the shared tier down
#[tokio::test]
async fn test_get_or_set_while_shared_offline() {
    let (engine, backend) = setup_engine().await;
    backend.set_offline(true);
    let key = test_key("offline_compute");

    let first = engine
        .get_or_set(&key, || async { Ok(test_data::LeadSummary::new(1)) }, GetOrSetOptions::default())
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    let second = engine
        .get_or_set(
            &key,
            || async { Ok(test_data::LeadSummary::new(2)) },
            GetOrSetOptions::default(),
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(first, second, "second call served from the local tier");
    engine.shutdown().await;
}

/// After the retry interval the shared tier is tried and used again
#[tokio::test]
async fn test_recovery_after_outage() {
    let (engine, backend) = setup_engine().await;

    backend.set_offline(true);
    engine.set("during-outage", &1, SetOptions::default()).await;
    assert!(!engine.is_shared_available());

    backend.set_offline(false);
    // test_config() retries after 200ms
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(engine.is_shared_available());

    assert!(engine.set("after-outage", &2, SetOptions::default()).await);
    assert_eq!(backend.len(), 2, "the outage write is replayed before the next write");
    assert!(engine.health_check().await);

    // The outage write is still served locally
    assert_eq!(engine.get::<i32>("during-outage").await, Some(1));
    engine.shutdown().await;
}

/// Invalidation succeeds while the shared tier is down
#[tokio::test]
async fn test_invalidation_while_shared_offline() {
    let (engine, backend) = setup_engine().await;

    engine.set("inventory:1", &1, SetOptions::default()).await;
    backend.set_offline(true);

    assert!(engine.invalidate_pattern("inventory").await);
    assert!(engine.delete("inventory:1").await);
    assert!(engine.clear(None).await);
    assert!(engine.get::<i32>("inventory:1").await.is_none());
    engine.shutdown().await;
}

/// Invalidations made during an outage still apply to the shared tier afterwards
#[tokio::test]
async fn test_outage_invalidations_replayed_after_recovery() {
    let (engine, backend) = setup_engine().await;

    engine.set("inventory:1", &1, SetOptions::default().tags(["x"])).await;
    engine.set("d", &2, SetOptions::default()).await;
    engine.set("report", &"old", SetOptions::default()).await;
    assert_eq!(backend.len(), 3);

    backend.set_offline(true);
    assert!(engine.invalidate_tag("x").await);
    assert!(engine.invalidate_pattern("inventory").await);
    assert!(engine.delete("d").await);
    assert!(engine.set("report", &"new", SetOptions::default()).await);

    backend.set_offline(false);
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(engine.get::<i32>("inventory:1").await, None);
    assert_eq!(engine.get::<i32>("d").await, None);
    assert_eq!(engine.get::<String>("report").await.as_deref(), Some("new"));
    assert_eq!(backend.len(), 1, "only the rewritten report is left in the shared tier");
    assert!(!backend.has_tag_set("x"));
    engine.shutdown().await;
}

/// A clear made during an outage empties the shared tier once it is back
#[tokio::test]
async fn test_outage_clear_replayed_after_recovery() {
    let (engine, backend) = setup_engine().await;

    engine.set("kpi:1", &1, SetOptions::default()).await;
    engine.set("kpi:2", &2, SetOptions::default()).await;
    engine.set("leads:1", &3, SetOptions::default()).await;

    backend.set_offline(true);
    assert!(engine.clear(Some("kpi:")).await);

    backend.set_offline(false);
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert!(!engine.exists("kpi:1").await);
    assert_eq!(engine.get::<i32>("kpi:2").await, None);
    assert_eq!(engine.get::<i32>("leads:1").await, Some(3));
    assert_eq!(backend.len(), 1);
    engine.shutdown().await;
}

/// An engine built without a shared tier is healthy and fully usable
#[tokio::test]
async fn test_local_only_engine() {
    let engine = CacheEngineBuilder::new()
        .with_config(test_config())
        .local_only()
        .build()
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    assert!(engine.health_check().await);
    assert!(engine.set("k", &1, SetOptions::default().tags(["t"])).await);
    assert_eq!(engine.get::<i32>("k").await, Some(1));
    assert!(engine.invalidate_tag("t").await);
    assert!(engine.get::<i32>("k").await.is_none());
    engine.shutdown().await;
}
