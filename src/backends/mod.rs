//! Storage Backend Implementations
//!
//! # Available Backends
//!
//! ## Local Tier
//! - **`LocalTier`** - bounded `DashMap` cache with expiry-on-read and
//!   nearest-to-expiry eviction
//!
//! ## Shared Tier
//! - **Redis** - distributed store with tag sets and Pub/Sub (feature: `redis`, default)
//! - **`MemoryTier`** - in-process stand-in for Redis; lets several engines in
//!   one process share a keyspace, and can simulate outages and latency
//!
//! # Usage
//!
//! ```rust,no_run
//! use shared_cache_engine::backends::MemoryTier;
//! use shared_cache_engine::CacheEngineBuilder;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let shared = Arc::new(MemoryTier::new());
//! let engine = CacheEngineBuilder::new()
//!     .with_shared_backend(shared)
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod local_tier;
pub mod memory_tier;

#[cfg(feature = "redis")]
pub mod redis_tier;

pub use local_tier::{LocalTier, LocalTierStats};
pub use memory_tier::MemoryTier;

#[cfg(feature = "redis")]
pub use redis_tier::RedisTier;
