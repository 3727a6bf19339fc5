//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - Engine setup over an in-process shared backend
//! - Multi-engine "cluster" setup sharing one backend
//! - Test data generators

#![allow(dead_code)]

use shared_cache_engine::backends::MemoryTier;
use shared_cache_engine::{CacheConfig, CacheEngine, CacheEngineBuilder};
use std::sync::Arc;
use std::time::Duration;

/// Get Redis URL from environment or use default
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Create a test key with a unique suffix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Configuration with short timeouts so fallback paths run quickly
pub fn test_config() -> CacheConfig {
    CacheConfig {
        shared_timeout: Duration::from_millis(100),
        shared_retry_interval: Duration::from_millis(200),
        warming_interval: Duration::from_secs(3600),
        local_sweep_interval: Duration::from_secs(3600),
        ..CacheConfig::default()
    }
}

/// Build an engine over a fresh in-process shared backend
pub async fn setup_engine() -> (CacheEngine, Arc<MemoryTier>) {
    setup_engine_with(test_config()).await
}

pub async fn setup_engine_with(config: CacheConfig) -> (CacheEngine, Arc<MemoryTier>) {
    let backend = Arc::new(MemoryTier::new());
    let engine = build_on(Arc::clone(&backend), config).await;
    (engine, backend)
}

/// Build `n` engines sharing one backend, like `n` processes sharing Redis
pub async fn setup_cluster(n: usize) -> (Vec<CacheEngine>, Arc<MemoryTier>) {
    let backend = Arc::new(MemoryTier::new());
    let mut engines = Vec::with_capacity(n);
    for _ in 0..n {
        engines.push(build_on(Arc::clone(&backend), test_config()).await);
    }
    // Let the event subscribers attach
    tokio::time::sleep(Duration::from_millis(50)).await;
    (engines, backend)
}

/// Build one engine on an existing backend
pub async fn build_on(backend: Arc<MemoryTier>, config: CacheConfig) -> CacheEngine {
    CacheEngineBuilder::new()
        .with_config(config)
        .with_shared_backend(backend)
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build engine: {e}"))
}

/// Generate test data of various types
pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    pub struct LeadSummary {
        pub dealer_id: u64,
        pub leads: u64,
        pub conversion_rate: f64,
    }

    impl LeadSummary {
        pub fn new(dealer_id: u64) -> Self {
            Self {
                dealer_id,
                leads: 100 + dealer_id,
                conversion_rate: 0.25,
            }
        }
    }

    /// Generate JSON inventory data
    pub fn json_inventory(dealer_id: u64) -> serde_json::Value {
        serde_json::json!({
            "dealer_id": dealer_id,
            "vehicles": [
                {"vin": format!("VIN{dealer_id}A"), "status": "in_stock"},
                {"vin": format!("VIN{dealer_id}B"), "status": "sold"}
            ]
        })
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    use tokio::time::{Duration, sleep};

    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }

    false
}

/// Assert that engine stats meet expectations
#[macro_export]
macro_rules! assert_cache_stats {
    ($engine:expr, $field:ident > $value:expr) => {
        let stats = $engine.get_stats();
        assert!(
            stats.$field > $value,
            "Expected {} > {}, got {}",
            stringify!($field),
            $value,
            stats.$field
        );
    };
    ($engine:expr, $field:ident == $value:expr) => {
        let stats = $engine.get_stats();
        assert_eq!(
            stats.$field,
            $value,
            "Expected {} == {}, got {}",
            stringify!($field),
            $value,
            stats.$field
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key1 = test_key("lead");
        let key2 = test_key("lead");
        assert_ne!(key1, key2, "Keys should be unique");
        assert!(key1.starts_with("test_lead_"));
    }
}
