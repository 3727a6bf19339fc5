//! Engine configuration
//!
//! All tunables live in [`CacheConfig`]. Defaults suit polled dashboard
//! queries; [`CacheConfig::from_env`] overrides them from `CACHE_*`
//! environment variables.

use std::time::Duration;

use crate::entry::QualityClass;
use crate::error::CacheError;
use crate::etl::EtlRules;

/// Configuration for [`CacheEngine`](crate::CacheEngine)
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for `standard` entries when the caller gives none
    pub default_ttl: Duration,

    /// TTL for `latency-sensitive` (KPI) entries when the caller gives none
    pub latency_sensitive_ttl: Duration,

    /// Read latency target for latency-sensitive entries
    pub latency_sensitive_sla: Duration,

    /// Maximum number of entries held by the local tier
    pub local_max_entries: usize,

    /// How often the local tier sweeps expired entries
    pub local_sweep_interval: Duration,

    /// Per-call timeout for shared tier operations
    pub shared_timeout: Duration,

    /// Timeout for the initial shared backend connection
    pub shared_connect_timeout: Duration,

    /// How long a degraded shared tier is skipped before it is tried again
    pub shared_retry_interval: Duration,

    /// Writes and invalidations remembered while the shared tier is down,
    /// replayed on recovery; past this many a full clear is replayed instead
    pub missed_write_capacity: usize,

    /// Pub/Sub channel carrying cache events between processes
    pub event_channel: String,

    /// Capacity of the in-process event channel
    pub event_buffer: usize,

    /// Warming scheduler tick
    pub warming_interval: Duration,

    /// Remaining-TTL fraction under which a warmed key is flagged
    ///
    /// Measured against the TTL each entry was written with, not the class TTL.
    pub warming_threshold: f64,

    /// Remaining-TTL fraction under which a read triggers background refresh
    ///
    /// Measured against the TTL each entry was written with, not the class TTL.
    pub refresh_threshold: f64,

    /// Whether reads may trigger background refresh at all
    pub background_refresh: bool,

    /// Pending computations older than this are not joined
    pub pending_max_age: Duration,

    /// ETL `(source, event)` to pattern mapping
    pub etl_rules: EtlRules,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            latency_sensitive_ttl: Duration::from_secs(60),
            latency_sensitive_sla: Duration::from_millis(100),
            local_max_entries: 10_000,
            local_sweep_interval: Duration::from_secs(60),
            shared_timeout: Duration::from_millis(500),
            shared_connect_timeout: Duration::from_secs(2),
            shared_retry_interval: Duration::from_secs(5),
            missed_write_capacity: 1024,
            event_channel: "cache:events".to_string(),
            event_buffer: 1024,
            warming_interval: Duration::from_secs(30),
            warming_threshold: 0.1,
            refresh_threshold: 0.5,
            background_refresh: true,
            pending_max_age: Duration::from_secs(30),
            etl_rules: EtlRules::default(),
        }
    }
}

impl CacheConfig {
    /// Build a configuration from defaults overridden by environment variables
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `CACHE_DEFAULT_TTL_SECS` | `default_ttl` |
    /// | `CACHE_KPI_TTL_SECS` | `latency_sensitive_ttl` |
    /// | `CACHE_KPI_SLA_MS` | `latency_sensitive_sla` |
    /// | `CACHE_LOCAL_MAX_ENTRIES` | `local_max_entries` |
    /// | `CACHE_SHARED_TIMEOUT_MS` | `shared_timeout` |
    /// | `CACHE_EVENT_CHANNEL` | `event_channel` |
    /// | `CACHE_WARMING_INTERVAL_SECS` | `warming_interval` |
    /// | `CACHE_BACKGROUND_REFRESH` | `background_refresh` |
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, CacheError> {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("CACHE_DEFAULT_TTL_SECS")? {
            config.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CACHE_KPI_TTL_SECS")? {
            config.latency_sensitive_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("CACHE_KPI_SLA_MS")? {
            config.latency_sensitive_sla = Duration::from_millis(ms);
        }
        if let Some(max) = env_parse::<usize>("CACHE_LOCAL_MAX_ENTRIES")? {
            config.local_max_entries = max;
        }
        if let Some(ms) = env_parse::<u64>("CACHE_SHARED_TIMEOUT_MS")? {
            config.shared_timeout = Duration::from_millis(ms);
        }
        if let Ok(channel) = std::env::var("CACHE_EVENT_CHANNEL") {
            config.event_channel = channel;
        }
        if let Some(secs) = env_parse::<u64>("CACHE_WARMING_INTERVAL_SECS")? {
            config.warming_interval = Duration::from_secs(secs);
        }
        if let Some(enabled) = env_parse::<bool>("CACHE_BACKGROUND_REFRESH")? {
            config.background_refresh = enabled;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants between fields
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] describing the first violated invariant.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.default_ttl.is_zero() || self.latency_sensitive_ttl.is_zero() {
            return Err(CacheError::Config("class TTLs must be non-zero".into()));
        }
        if self.local_max_entries == 0 {
            return Err(CacheError::Config("local_max_entries must be at least 1".into()));
        }
        if self.shared_timeout.is_zero() {
            return Err(CacheError::Config("shared_timeout must be non-zero".into()));
        }
        for (name, ratio) in [
            ("warming_threshold", self.warming_threshold),
            ("refresh_threshold", self.refresh_threshold),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(CacheError::Config(format!(
                    "{name} must be in (0, 1], got {ratio}"
                )));
            }
        }
        if self.event_channel.trim().is_empty() {
            return Err(CacheError::Config("event_channel must not be empty".into()));
        }
        if self.missed_write_capacity == 0 {
            return Err(CacheError::Config("missed_write_capacity must be at least 1".into()));
        }
        if self.event_buffer == 0 {
            return Err(CacheError::Config("event_buffer must be at least 1".into()));
        }
        if self.local_sweep_interval.is_zero() || self.warming_interval.is_zero() {
            return Err(CacheError::Config("background intervals must be non-zero".into()));
        }
        Ok(())
    }

    /// TTL used for a quality class when the caller does not give one
    #[must_use]
    pub fn class_ttl(&self, class: QualityClass) -> Duration {
        match class {
            QualityClass::Standard => self.default_ttl,
            QualityClass::LatencySensitive => self.latency_sensitive_ttl,
        }
    }

    /// Latency target for a quality class, if it has one
    #[must_use]
    pub fn class_sla(&self, class: QualityClass) -> Option<Duration> {
        match class {
            QualityClass::Standard => None,
            QualityClass::LatencySensitive => Some(self.latency_sensitive_sla),
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>, CacheError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CacheError::Config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}
