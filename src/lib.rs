//! Shared Cache Engine
//!
//! A two-tier cache for services that run as several processes against one
//! Redis server:
//! - **Local tier**: bounded in-process `DashMap` with expiry-on-read
//! - **Shared tier**: Redis (or any [`SharedBackend`]) behind a timeout that
//!   degrades to local-only operation instead of failing callers
//! - **Stampede protection**: concurrent misses on one key share one computation
//! - **Tag, pattern and ETL-driven invalidation**, propagated to every process
//!   over Pub/Sub
//! - **Background refresh and warming** for latency-sensitive (KPI) entries
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use shared_cache_engine::{CacheEngineBuilder, GetOrSetOptions, KeyCodec, SetOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = CacheEngineBuilder::new().build().await?;
//!
//!     let key = KeyCodec::new("kpi:").part("leads").part(42).build();
//!     let leads: u64 = engine
//!         .get_or_set(&key, || async { Ok(1_250) }, GetOrSetOptions::default().latency_sensitive())
//!         .await?;
//!     tracing::info!(leads, "Leads for dealer 42");
//!
//!     engine.set("inventory:42", &["vin-1", "vin-2"], SetOptions::default().tags(["dealer:42"])).await;
//!     engine.invalidate_tag("dealer:42").await;
//!
//!     let stats = engine.get_stats();
//!     tracing::info!("Hit rate: {:.2}%", stats.hit_rate);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! get ──► Shared tier ──hit──► promote to Local ──► return
//!             │ miss / unavailable
//!             ▼
//!         Local tier ──hit──► return
//!             │ miss
//!             ▼
//!   get_or_set: Coordinator (one computation per key) ──► factory ──► Local + Shared
//! ```

pub mod backends;
pub mod builder;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod entry;
pub mod error;
pub mod etl;
pub mod events;
pub mod key_codec;
pub mod shared_tier;
pub mod stats;
pub mod tag_index;
pub mod traits;
pub mod warming;

pub use builder::CacheEngineBuilder;
pub use config::CacheConfig;
pub use engine::CacheEngine;
pub use entry::{CacheEntry, ClearRequest, GetOrSetOptions, QualityClass, SetOptions};
pub use error::{CacheError, CacheResult};
pub use etl::{EtlRule, EtlRules};
pub use events::{CacheEvent, EventStats};
pub use key_codec::KeyCodec;
pub use stats::{CacheStats, LatencyClassStats};
pub use traits::{KeyFilter, SharedBackend, StorageTier, TierResult};
pub use warming::WarmingReport;

// Re-export async_trait for implementors of SharedBackend
pub use async_trait::async_trait;
