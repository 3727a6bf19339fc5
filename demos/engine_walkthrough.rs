//! Walkthrough: two engines sharing one backend
//!
//! Run with: `cargo run --example engine_walkthrough`
//!
//! Uses the in-process `MemoryTier` so no Redis server is needed. Set
//! `RUST_LOG=shared_cache_engine=debug` to see tier and event logs.

use serde::{Deserialize, Serialize};
use shared_cache_engine::backends::MemoryTier;
use shared_cache_engine::{CacheEngineBuilder, CacheEvent, GetOrSetOptions, SetOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DealerKpi {
    dealer_id: u64,
    leads: u64,
    inventory_turn: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!("=== Shared Cache Engine: Walkthrough ===\n");

    // Two "processes" sharing one backend
    let backend = Arc::new(MemoryTier::new());
    let api = CacheEngineBuilder::new()
        .with_shared_backend(backend.clone())
        .build()
        .await?;
    let worker = CacheEngineBuilder::new()
        .with_shared_backend(backend.clone())
        .build()
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut events = worker.subscribe();

    // 1. Compute once, serve everywhere
    println!("1. get_or_set on the API engine...");
    let kpi = api
        .get_or_set(
            "kpi:dealer:7",
            || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(DealerKpi {
                    dealer_id: 7,
                    leads: 128,
                    inventory_turn: 4.2,
                })
            },
            GetOrSetOptions::default()
                .latency_sensitive()
                .tags(["dealer:7", "kpi"]),
        )
        .await?;
    println!("   computed: {kpi:?}");

    let from_worker = worker.get::<DealerKpi>("kpi:dealer:7").await;
    println!("   worker sees: {from_worker:?}\n");

    // 2. Tagged writes and tag invalidation
    println!("2. Tag invalidation...");
    api.set("leads:dealer:7", &vec![1, 2, 3], SetOptions::default().tags(["dealer:7"]))
        .await;
    api.invalidate_tag("dealer:7").await;
    println!(
        "   after invalidate_tag(dealer:7): kpi={:?} leads={:?}\n",
        worker.get::<DealerKpi>("kpi:dealer:7").await.is_some(),
        worker.get::<Vec<u32>>("leads:dealer:7").await.is_some()
    );

    // 3. ETL-driven invalidation
    println!("3. ETL events...");
    api.set("inventory:dealer:7", &serde_json::json!({"units": 41}), SetOptions::default())
        .await;
    let invalidated = api.handle_etl_event("final_watchdog", "inventory_updated").await;
    println!("   inventory_updated invalidated {invalidated} pattern(s)");
    let invalidated = api.handle_etl_event("crm_sync", "contacts_updated").await;
    println!("   contacts_updated invalidated {invalidated} pattern(s), re-broadcast instead\n");

    // 4. Events seen by the worker
    println!("4. Events received by the worker:");
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
        match event {
            CacheEvent::Set { key } => println!("   set {key}"),
            other => println!("   {}", other.kind()),
        }
    }
    println!();

    // 5. Statistics
    println!("5. Statistics:");
    println!("{}", serde_json::to_string_pretty(&api.get_stats())?);
    println!("   events: {:?}", worker.event_stats());

    api.shutdown().await;
    worker.shutdown().await;
    println!("\n=== Done ===");
    Ok(())
}
