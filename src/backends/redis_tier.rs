//! Redis Tier - Distributed Shared Backend
//!
//! Redis-based [`SharedBackend`]: cached values, tag sets and the cache event
//! channel all live in one Redis deployment shared by every server instance.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::traits::{KeyFilter, SharedBackend};

/// Keys fetched per SCAN iteration
const SCAN_COUNT: usize = 100;

/// `REDIS_URL`, or the local default
pub(crate) fn env_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Redis shared backend with `ConnectionManager` for automatic reconnection
///
/// Layout under the configured namespace (default `cache:`):
/// - `{ns}v:{key}` - cached entry bytes, expiring with the entry
/// - `{ns}t:{tag}` - SET of member keys, expiring no earlier than its longest-lived member
///
/// Key enumeration uses cursor-based SCAN (never KEYS), so it is safe on a
/// production instance.
///
/// The connection manager is created on first use, so a tier built with
/// [`connect_lazily`](Self::connect_lazily) keeps retrying a server that was
/// down at startup.
pub struct RedisTier {
    /// Client kept for opening dedicated Pub/Sub connections
    client: Client,
    /// Redis connection manager - handles reconnection automatically once established
    conn_manager: OnceCell<ConnectionManager>,
    namespace: String,
}

impl RedisTier {
    /// Connect using `REDIS_URL` (default `redis://127.0.0.1:6379`)
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn new() -> Result<Self> {
        Self::with_url(&env_redis_url()).await
    }

    /// Connect to a specific Redis URL
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing Redis tier with ConnectionManager");
        let tier = Self::connect_lazily(redis_url)?;

        // Test connection
        let mut conn = tier.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING health check failed")?;

        info!(redis_url = %redis_url, "Redis tier connected");
        Ok(tier)
    }

    /// Create the client without contacting the server
    ///
    /// The connection is established by the first command and retried by
    /// every command until it succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is not a valid Redis URL.
    pub fn connect_lazily(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;
        Ok(Self {
            client,
            conn_manager: OnceCell::new(),
            namespace: "cache:".to_string(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .conn_manager
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone())
                    .await
                    .context("Failed to establish Redis connection manager")?;
                debug!("[Redis] Connection manager established");
                Ok::<_, anyhow::Error>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    /// Use a different key namespace (e.g. one per environment)
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}v:{key}", self.namespace)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}t:{tag}", self.namespace)
    }

    /// SCAN all Redis keys matching a glob pattern
    async fn scan_raw(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            // SCAN cursor MATCH pattern COUNT 100
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .context("Redis SCAN failed")?;

            cursor = next;
            keys.extend(batch);

            // Cursor 0 means iteration is complete
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    async fn delete_raw(&self, raw_keys: &[String]) -> Result<usize> {
        if raw_keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let count: usize = conn.del(raw_keys).await.context("Redis DEL failed")?;
        Ok(count)
    }
}

/// Escape glob metacharacters so a literal fragment can sit inside a MATCH pattern
fn escape_glob(fragment: &str) -> String {
    let mut escaped = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

// ===== Trait Implementations =====

use async_trait::async_trait;

#[async_trait]
impl SharedBackend for RedisTier {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn
            .get(self.data_key(key))
            .await
            .context("Redis GET failed")?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(self.data_key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .context("Redis SET failed")?;
        debug!(key = %key, ttl_ms = ttl_millis(ttl), "[Redis] Cached key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let removed: usize = conn.del(self.data_key(key)).await.context("Redis DEL failed")?;
        Ok(removed > 0)
    }

    async fn remove_bulk(&self, keys: &[String]) -> Result<usize> {
        let raw: Vec<String> = keys.iter().map(|k| self.data_key(k)).collect();
        let count = self.delete_raw(&raw).await?;
        debug!(count, "[Redis] Removed keys in bulk");
        Ok(count)
    }

    async fn scan_keys(&self, filter: &KeyFilter) -> Result<Vec<String>> {
        let data_prefix = self.data_key("");
        let pattern = match filter {
            KeyFilter::All => format!("{}*", escape_glob(&data_prefix)),
            KeyFilter::Prefix(p) => format!("{}*", escape_glob(&self.data_key(p))),
            KeyFilter::Contains(s) => format!("{}*{}*", escape_glob(&data_prefix), escape_glob(s)),
        };
        let raw = self.scan_raw(&pattern).await?;
        Ok(raw
            .into_iter()
            .filter_map(|k| k.strip_prefix(data_prefix.as_str()).map(ToString::to_string))
            .filter(|k| filter.matches(k))
            .collect())
    }

    async fn tag_add(&self, tag: &str, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let tag_key = self.tag_key(tag);

        let (_, current_pttl): (usize, i64) = redis::pipe()
            .sadd(&tag_key, key)
            .pttl(&tag_key)
            .query_async(&mut conn)
            .await
            .context("Redis SADD failed")?;

        // -1: no expiry yet; otherwise only ever extend
        let wanted = ttl_millis(ttl);
        let needs_extend = current_pttl == -1
            || u64::try_from(current_pttl).is_ok_and(|current| current < wanted);
        if needs_extend {
            let _: () = redis::cmd("PEXPIRE")
                .arg(&tag_key)
                .arg(wanted)
                .query_async(&mut conn)
                .await
                .context("Redis PEXPIRE failed")?;
        }
        Ok(())
    }

    async fn tag_members(&self, tag: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let members: Vec<String> = conn
            .smembers(self.tag_key(tag))
            .await
            .context("Redis SMEMBERS failed")?;
        Ok(members)
    }

    async fn tag_remove_member(&self, tag: &str, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: usize = conn
            .srem(self.tag_key(tag), key)
            .await
            .context("Redis SREM failed")?;
        Ok(())
    }

    async fn tag_drop(&self, tag: &str) -> Result<()> {
        self.delete_raw(&[self.tag_key(tag)]).await?;
        Ok(())
    }

    async fn tag_drop_all(&self) -> Result<usize> {
        let pattern = format!("{}*", escape_glob(&self.tag_key("")));
        let raw = self.scan_raw(&pattern).await?;
        self.delete_raw(&raw).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: usize = conn
            .publish(channel, payload)
            .await
            .context("Failed to publish cache event")?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("Failed to get pubsub connection")?;

        pubsub
            .subscribe(channel)
            .await
            .context("Failed to subscribe to channel")?;

        info!(channel = %channel, "Subscribed to cache event channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(error = %e, "Failed to get message payload");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> bool {
        let Ok(mut conn) = self.connection().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
