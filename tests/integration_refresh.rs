//! Integration tests for background refresh and warming
//!
//! Tests that latency-sensitive entries near expiry are refreshed without
//! blocking the reader, and that the warming scheduler flags them

mod common;

use anyhow::anyhow;
use common::*;
use shared_cache_engine::{CacheConfig, CacheEvent, GetOrSetOptions, SetOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

fn kpi_options() -> GetOrSetOptions {
    GetOrSetOptions::default()
        .latency_sensitive()
        .ttl(Duration::from_millis(400))
}

async fn next_refresh_event(rx: &mut tokio::sync::broadcast::Receiver<CacheEvent>) -> CacheEvent {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event @ CacheEvent::BackgroundRefresh { .. })) => return event,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => panic!("event channel error: {e}"),
            Err(_) => panic!("no background refresh event"),
        }
    }
}

/// Reads near expiry return the current value at once and refresh behind it
#[tokio::test]
async fn test_background_refresh_does_not_block() {
    let (engine, _) = setup_engine().await;
    let key = test_key("kpi_refresh");
    let mut events = engine.subscribe();

    let first = engine
        .get_or_set(&key, || async { Ok(1_u32) }, kpi_options())
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(first, 1);

    // Past the refresh threshold (half the TTL), still valid
    tokio::time::sleep(Duration::from_millis(250)).await;

    let started = Instant::now();
    let served = engine
        .get_or_set(
            &key,
            || async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(2_u32)
            },
            kpi_options(),
        )
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(served, 1, "current value served while refreshing");
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "read waited for the refresh: {:?}",
        started.elapsed()
    );

    let event = next_refresh_event(&mut events).await;
    assert_eq!(
        event,
        CacheEvent::BackgroundRefresh {
            key: key.clone(),
            succeeded: true,
            error: None
        }
    );
    assert_eq!(engine.get::<u32>(&key).await, Some(2));
    assert_cache_stats!(engine, background_refreshes == 1);
    engine.shutdown().await;
}

/// A failed refresh is reported and the cached value keeps being served
#[tokio::test]
async fn test_background_refresh_failure_is_observable() {
    let (engine, _) = setup_engine().await;
    let key = test_key("kpi_refresh_fail");
    let mut events = engine.subscribe();

    engine
        .get_or_set(&key, || async { Ok(10_u32) }, kpi_options())
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(250)).await;

    let served = engine
        .get_or_set::<u32, _, _>(&key, || async { Err(anyhow!("warehouse query timed out")) }, kpi_options())
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(served, 10);

    match next_refresh_event(&mut events).await {
        CacheEvent::BackgroundRefresh { succeeded, error, .. } => {
            assert!(!succeeded);
            assert_eq!(error.as_deref(), Some("warehouse query timed out"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_cache_stats!(engine, background_refresh_failures == 1);
    assert_eq!(engine.get::<u32>(&key).await, Some(10));
    engine.shutdown().await;
}

/// Only one refresh runs per key however many readers trigger it
#[tokio::test]
async fn test_single_refresh_per_key() {
    let (engine, _) = setup_engine().await;
    let key = test_key("kpi_single_refresh");
    let refreshes = Arc::new(AtomicU32::new(0));

    engine
        .get_or_set(&key, || async { Ok(1_u32) }, kpi_options())
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(250)).await;

    for _ in 0..5 {
        let refreshes = Arc::clone(&refreshes);
        let served = engine
            .get_or_set(
                &key,
                move || async move {
                    refreshes.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(2_u32)
                },
                kpi_options(),
            )
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(served, 1);
    }

    assert!(wait_for(|| engine.get_stats().background_refreshes == 1, 1000).await);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    engine.shutdown().await;
}

/// Standard entries are never refreshed in the background
#[tokio::test]
async fn test_standard_entries_not_refreshed() {
    let (engine, _) = setup_engine().await;
    let key = test_key("standard");
    let options = GetOrSetOptions::default().ttl(Duration::from_millis(400));

    engine
        .get_or_set(&key, || async { Ok(1_u32) }, options.clone())
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(250)).await;
    engine
        .get_or_set(&key, || async { Ok(2_u32) }, options)
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.get::<u32>(&key).await, Some(1));
    assert_cache_stats!(engine, background_refreshes == 0);
    engine.shutdown().await;
}

/// Background refresh can be switched off
#[tokio::test]
async fn test_background_refresh_disabled() {
    let config = CacheConfig {
        background_refresh: false,
        ..test_config()
    };
    let (engine, _) = setup_engine_with(config).await;
    let key = test_key("refresh_off");

    engine
        .get_or_set(&key, || async { Ok(1_u32) }, kpi_options())
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    tokio::time::sleep(Duration::from_millis(250)).await;
    engine
        .get_or_set(&key, || async { Ok(2_u32) }, kpi_options())
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.get::<u32>(&key).await, Some(1));
    assert_cache_stats!(engine, in_flight == 0);
    engine.shutdown().await;
}

/// The warming pass flags keys close to expiry and forgets vanished ones
#[tokio::test]
async fn test_warming_flags_keys() {
    let config = CacheConfig {
        warming_threshold: 0.5,
        ..test_config()
    };
    let (engine, _) = setup_engine_with(config).await;
    let mut events = engine.subscribe();

    let near = SetOptions::default().latency_sensitive().ttl(Duration::from_millis(400));
    let far = SetOptions::default().latency_sensitive().ttl(Duration::from_secs(60));
    engine.set("kpi:near", &1, near.clone()).await;
    engine.set("kpi:far", &2, far).await;
    engine.set("kpi:gone", &3, near).await;
    engine.delete("kpi:gone").await;
    assert_cache_stats!(engine, warming_keys == 2);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let report = engine.run_warming().await;
    assert_eq!(report.flagged, vec!["kpi:near".to_string()]);

    let flagged = loop {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(CacheEvent::Warming { flagged })) => break flagged,
            Ok(Ok(_)) => {}
            other => panic!("no warming event: {other:?}"),
        }
    };
    assert_eq!(flagged, vec!["kpi:near".to_string()]);

    // Once expired everywhere the key leaves the registry
    tokio::time::sleep(Duration::from_millis(200)).await;
    let report = engine.run_warming().await;
    assert_eq!(report.removed, 1);

    let stats = engine.get_stats();
    assert_eq!(stats.warming_keys, 1);
    assert_eq!(stats.keys_flagged, 1);
    assert_eq!(stats.warming_runs, 2);
    engine.shutdown().await;
}

/// The scheduled warming loop runs on its own
#[tokio::test]
async fn test_warming_loop_runs() {
    let config = CacheConfig {
        warming_interval: Duration::from_millis(50),
        ..test_config()
    };
    let (engine, _) = setup_engine_with(config).await;

    engine
        .set("kpi:loop", &1, SetOptions::default().latency_sensitive())
        .await;
    assert!(wait_for(|| engine.get_stats().warming_runs >= 2, 1000).await);
    engine.shutdown().await;

    // Stopped loops do not run again
    let runs = engine.get_stats().warming_runs;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.get_stats().warming_runs, runs);
}
