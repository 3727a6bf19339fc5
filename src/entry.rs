//! Cache entries and per-call options

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::CacheError;

/// Longest tag accepted by the engine, in bytes
pub const MAX_TAG_LEN: usize = 128;

/// Quality class of an entry
///
/// Latency-sensitive entries (KPI aggregates) get a shorter default TTL, have
/// their read latency tracked against an SLA, and are eligible for warming and
/// background refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityClass {
    #[default]
    Standard,
    LatencySensitive,
}

impl QualityClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::LatencySensitive => "latency-sensitive",
        }
    }
}

/// A cached value with its metadata
///
/// Entries are replaced wholesale on every write. Times are unix milliseconds so
/// the same entry means the same thing in every process that reads it from the
/// shared tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub expires_at_ms: u64,
    pub ttl_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub created_at_ms: u64,
    pub refreshed_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_time_ms: Option<u64>,
    #[serde(default)]
    pub quality_class: QualityClass,
}

impl CacheEntry {
    #[must_use]
    pub fn new(
        value: serde_json::Value,
        ttl: Duration,
        tags: Vec<String>,
        quality_class: QualityClass,
        compute_time: Option<Duration>,
    ) -> Self {
        let now = now_millis();
        let ttl_ms = duration_millis(ttl);
        Self {
            value,
            expires_at_ms: now.saturating_add(ttl_ms),
            ttl_ms,
            tags,
            created_at_ms: now,
            refreshed_at_ms: now,
            compute_time_ms: compute_time.map(duration_millis),
            quality_class,
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        now_millis() >= self.expires_at_ms
    }

    /// Time left before expiry, zero once expired
    #[must_use]
    pub fn remaining_ttl(&self) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_millis()))
    }

    /// TTL the entry was written with
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Whether less than `fraction` of the original TTL remains
    #[must_use]
    pub fn is_below_fraction(&self, fraction: f64) -> bool {
        let remaining = self.remaining_ttl().as_secs_f64();
        remaining < self.ttl().as_secs_f64() * fraction
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Options for [`CacheEngine::set`](crate::CacheEngine::set)
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Entry TTL; the class TTL when `None`
    pub ttl: Option<Duration>,
    /// Prepended to the key before storing
    pub prefix: Option<String>,
    pub tags: Vec<String>,
    pub quality_class: QualityClass,
}

impl SetOptions {
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn latency_sensitive(mut self) -> Self {
        self.quality_class = QualityClass::LatencySensitive;
        self
    }
}

/// Options for [`CacheEngine::get_or_set`](crate::CacheEngine::get_or_set)
#[derive(Debug, Clone, Default)]
pub struct GetOrSetOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub quality_class: QualityClass,
    /// Skip both the cache and any pending computation and recompute now
    pub force_refresh: bool,
}

impl GetOrSetOptions {
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn latency_sensitive(mut self) -> Self {
        self.quality_class = QualityClass::LatencySensitive;
        self
    }

    #[must_use]
    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub(crate) fn as_set_options(&self) -> SetOptions {
        SetOptions {
            ttl: self.ttl,
            prefix: None,
            tags: self.tags.clone(),
            quality_class: self.quality_class,
        }
    }
}

/// Administrative "clear cache" request
///
/// Each present field maps onto the matching invalidation operation; an empty
/// request clears everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearRequest {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

pub(crate) fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::InvalidArgument("cache key must not be empty".into()));
    }
    Ok(())
}

/// Check that a tag is usable as an index entry
///
/// # Errors
///
/// Returns [`CacheError::InvalidArgument`] for empty, oversized, or
/// whitespace/control-character-containing tags.
pub fn validate_tag(tag: &str) -> Result<(), CacheError> {
    if tag.is_empty() {
        return Err(CacheError::InvalidArgument("tag must not be empty".into()));
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(CacheError::InvalidArgument(format!(
            "tag longer than {MAX_TAG_LEN} bytes"
        )));
    }
    if tag.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CacheError::InvalidArgument(format!(
            "tag {tag:?} contains whitespace or control characters"
        )));
    }
    Ok(())
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, duration_millis)
}

pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
