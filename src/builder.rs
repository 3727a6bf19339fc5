//! Cache Engine Builder
//!
//! Constructs a [`CacheEngine`] with either Redis, a caller-supplied shared
//! backend, or no shared tier at all.
//!
//! # Example: Redis from `REDIS_URL`
//!
//! ```rust,no_run
//! use shared_cache_engine::CacheEngineBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = CacheEngineBuilder::new().build().await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom Shared Backend
//!
//! ```rust,ignore
//! use shared_cache_engine::CacheEngineBuilder;
//! use std::sync::Arc;
//!
//! let engine = CacheEngineBuilder::new()
//!     .with_shared_backend(Arc::new(MyStore::new()))
//!     .build()
//!     .await?;
//! ```

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::engine::CacheEngine;
use crate::error::CacheError;
use crate::shared_tier::SharedTier;
use crate::traits::SharedBackend;

/// Builder for [`CacheEngine`]
///
/// # Default Behavior
///
/// With no backend configured, `build()` connects to Redis at `REDIS_URL`
/// (default `redis://127.0.0.1:6379`). If the connection cannot be made
/// within `shared_connect_timeout`, the engine still starts: the shared tier
/// begins degraded, serves from the local tier, and connects once the server
/// answers.
#[derive(Default)]
pub struct CacheEngineBuilder {
    config: Option<CacheConfig>,
    shared_backend: Option<Arc<dyn SharedBackend>>,
    redis_url: Option<String>,
    local_only: bool,
}

impl CacheEngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this configuration instead of [`CacheConfig::default`]
    #[must_use]
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom shared backend
    ///
    /// Several engines built on the same backend share a keyspace and an
    /// event channel, like processes sharing a Redis server.
    #[must_use]
    pub fn with_shared_backend(mut self, backend: Arc<dyn SharedBackend>) -> Self {
        self.shared_backend = Some(backend);
        self
    }

    /// Connect to Redis at this URL instead of `REDIS_URL`
    #[must_use]
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Run without a shared tier
    #[must_use]
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    /// Build the engine and start its background tasks
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if the configuration or the Redis URL is
    /// invalid. An unreachable Redis server is not an error.
    pub async fn build(self) -> Result<CacheEngine, CacheError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let shared = if self.local_only {
            info!("Building cache engine without shared tier");
            SharedTier::disconnected()
        } else if let Some(backend) = self.shared_backend {
            info!(backend = backend.name(), "Using custom shared backend");
            SharedTier::new(backend, config.shared_timeout, config.shared_retry_interval)
        } else {
            connect_default(&config, self.redis_url.as_deref()).await?
        };
        let shared = shared.with_journal_capacity(config.missed_write_capacity);

        let engine = CacheEngine::new(config, shared);
        engine.start_background_tasks();
        Ok(engine)
    }
}

#[cfg(feature = "redis")]
async fn connect_default(config: &CacheConfig, url: Option<&str>) -> Result<SharedTier, CacheError> {
    use crate::backends::RedisTier;
    use crate::backends::redis_tier::env_redis_url;

    let url = url.map_or_else(env_redis_url, ToString::to_string);
    let reason = match tokio::time::timeout(config.shared_connect_timeout, RedisTier::with_url(&url)).await {
        Ok(Ok(redis)) => {
            return Ok(SharedTier::new(
                Arc::new(redis),
                config.shared_timeout,
                config.shared_retry_interval,
            ));
        }
        Ok(Err(e)) => format!("{e:#}"),
        Err(_) => format!(
            "connect timed out after {}ms",
            crate::entry::duration_millis(config.shared_connect_timeout)
        ),
    };

    let redis = RedisTier::connect_lazily(&url).map_err(|e| CacheError::Config(format!("{e:#}")))?;
    warn!(error = %reason, "Redis unavailable, starting degraded and retrying in the background");
    let shared = SharedTier::new(Arc::new(redis), config.shared_timeout, config.shared_retry_interval);
    shared.mark_unreachable("connect", reason);
    Ok(shared)
}

#[cfg(not(feature = "redis"))]
async fn connect_default(_config: &CacheConfig, _url: Option<&str>) -> Result<SharedTier, CacheError> {
    warn!("Built without the `redis` feature and no shared backend given, running local-only");
    Ok(SharedTier::disconnected())
}
