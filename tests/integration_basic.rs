//! Integration tests for basic cache operations
//!
//! Tests set/get, TTL expiry, exists, delete and key prefixes

mod common;

use common::*;
use serde_json::json;
use shared_cache_engine::{KeyCodec, SetOptions};
use std::time::Duration;

/// Test basic set and get
#[tokio::test]
async fn test_set_and_get() {
    let (engine, _) = setup_engine().await;
    let key = test_key("basic");
    let value = test_data::json_inventory(1);

    assert!(engine.set(&key, &value, SetOptions::default()).await);

    let cached: Option<serde_json::Value> = engine.get(&key).await;
    assert_eq!(cached, Some(value));
    assert_cache_stats!(engine, hits == 1);
    engine.shutdown().await;
}

/// Scenario: value readable before its TTL, gone after
#[tokio::test]
async fn test_ttl_expiry() {
    let (engine, _) = setup_engine().await;
    let key = test_key("ttl");

    assert!(engine.set(&key, &42, SetOptions::default().ttl(Duration::from_millis(500))).await);
    assert_eq!(engine.get::<i32>(&key).await, Some(42));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(engine.get::<i32>(&key).await, None);
    assert!(!engine.exists(&key).await);
    engine.shutdown().await;
}

/// Test typed values round-trip through the shared tier
#[tokio::test]
async fn test_typed_value_from_shared_tier() {
    let (engines, _) = setup_cluster(2).await;
    let key = test_key("typed");
    let summary = test_data::LeadSummary::new(7);

    assert!(engines[0].set(&key, &summary, SetOptions::default()).await);

    // The second engine has never seen the key locally
    let cached: Option<test_data::LeadSummary> = engines[1].get(&key).await;
    assert_eq!(cached, Some(summary));
    assert_cache_stats!(engines[1], shared_hits == 1);

    for engine in &engines {
        engine.shutdown().await;
    }
}

/// Test exists without affecting statistics
#[tokio::test]
async fn test_exists() {
    let (engine, _) = setup_engine().await;
    let key = test_key("exists");

    assert!(!engine.exists(&key).await);
    engine.set(&key, &"present", SetOptions::default()).await;
    assert!(engine.exists(&key).await);

    let stats = engine.get_stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 0);
    engine.shutdown().await;
}

/// Test delete is idempotent
#[tokio::test]
async fn test_delete() {
    let (engine, backend) = setup_engine().await;
    let key = test_key("delete");

    engine.set(&key, &1, SetOptions::default().tags(["dealer:1"])).await;
    assert!(engine.delete(&key).await);
    assert!(engine.get::<i32>(&key).await.is_none());
    assert!(backend.is_empty());
    assert!(!backend.has_tag_set("dealer:1"));

    // Deleting again succeeds and changes nothing
    assert!(engine.delete(&key).await);
    assert!(engine.delete("never-set").await);
    engine.shutdown().await;
}

/// Test key prefix is prepended on write
#[tokio::test]
async fn test_prefix() {
    let (engine, _) = setup_engine().await;

    assert!(engine.set("42", &"report", SetOptions::default().prefix("kpi:")).await);
    assert_eq!(engine.get::<String>("kpi:42").await.as_deref(), Some("report"));
    assert!(engine.get::<String>("42").await.is_none());
    engine.shutdown().await;
}

/// Test keys built by the codec address the same entry
#[tokio::test]
async fn test_key_codec_keys() {
    let (engine, _) = setup_engine().await;

    let write_key = KeyCodec::new("kpi:")
        .part("leads")
        .part(json!({"dealer": 7, "range": "30d"}))
        .build();
    let read_key = KeyCodec::new("kpi:")
        .part("leads")
        .part(json!({"range": "30d", "dealer": 7}))
        .build();
    assert_eq!(write_key, read_key);

    engine.set(&write_key, &120, SetOptions::default()).await;
    assert_eq!(engine.get::<u32>(&read_key).await, Some(120));
    engine.shutdown().await;
}

/// Test invalid arguments are rejected without side effects
#[tokio::test]
async fn test_invalid_arguments() {
    let (engine, backend) = setup_engine().await;

    assert!(!engine.set("", &1, SetOptions::default()).await);
    assert!(!engine.set("k", &1, SetOptions::default().tags([""])).await);
    assert!(!engine.set("k", &1, SetOptions::default().tags(["has space"])).await);
    assert!(!engine.set("k", &1, SetOptions::default().tags(["x".repeat(129)])).await);
    assert!(!engine.set("k", &1, SetOptions::default().ttl(Duration::ZERO)).await);

    assert!(backend.is_empty());
    assert_cache_stats!(engine, sets == 0);
    engine.shutdown().await;
}

/// Test latency-sensitive entries get the shorter class TTL
#[tokio::test]
async fn test_class_ttl() {
    let (engine, backend) = setup_engine().await;
    let key = test_key("kpi");

    engine.set(&key, &1, SetOptions::default().latency_sensitive()).await;

    let raw = shared_cache_engine::SharedBackend::get(backend.as_ref(), &key)
        .await
        .unwrap_or_else(|e| panic!("backend get failed: {e}"))
        .unwrap_or_else(|| panic!("entry missing from shared tier"));
    let entry: shared_cache_engine::CacheEntry =
        serde_json::from_slice(&raw).unwrap_or_else(|e| panic!("bad entry: {e}"));
    assert_eq!(entry.ttl(), Duration::from_secs(60));
    assert_eq!(entry.quality_class, shared_cache_engine::QualityClass::LatencySensitive);
    assert_cache_stats!(engine, warming_keys == 1);
    engine.shutdown().await;
}
