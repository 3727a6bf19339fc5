//! Cache engine
//!
//! [`CacheEngine`] ties the tiers, the tag index, the computation coordinator,
//! the event bus and the warming scheduler together behind one cheap-to-clone
//! handle. Reads go to the shared tier first and fall back to the local tier;
//! writes go to both. The shared tier being down never fails a caller:
//! mutations it misses are remembered and replayed before the first operation
//! that finds it reachable again.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backends::LocalTier;
use crate::config::CacheConfig;
use crate::coordinator::{CleanupGuard, ComputationCoordinator, ComputeOutcome};
use crate::entry::{
    CacheEntry, ClearRequest, GetOrSetOptions, QualityClass, SetOptions, duration_millis, validate_key,
    validate_tag,
};
use crate::error::CacheError;
use crate::events::{CacheEvent, EventBus, EventStats};
use crate::shared_tier::{MissedWrite, SharedTier};
use crate::stats::{CacheStats, HitTier, StatsCollector};
use crate::tag_index::TagIndex;
use crate::traits::{KeyFilter, StorageTier, TierResult};
use crate::warming::{WarmingReport, WarmingScheduler};

/// Two-tier cache with stampede protection and cross-process invalidation
///
/// Construct with [`CacheEngineBuilder`](crate::CacheEngineBuilder). Clones
/// share all state; call [`shutdown`](Self::shutdown) once to stop the
/// background tasks.
#[derive(Clone)]
pub struct CacheEngine {
    config: Arc<CacheConfig>,
    local: Arc<LocalTier>,
    shared: Arc<SharedTier>,
    tags: Arc<TagIndex>,
    coordinator: Arc<ComputationCoordinator>,
    events: Arc<EventBus>,
    warming: Arc<WarmingScheduler>,
    stats: Arc<StatsCollector>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CacheEngine {
    pub(crate) fn new(config: CacheConfig, shared: SharedTier) -> Self {
        let shared = Arc::new(shared);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            local: Arc::new(LocalTier::new(config.local_max_entries)),
            tags: Arc::new(TagIndex::new(Arc::clone(&shared))),
            coordinator: Arc::new(ComputationCoordinator::new(config.pending_max_age)),
            events: Arc::new(EventBus::new(
                Arc::clone(&shared),
                config.event_channel.clone(),
                config.event_buffer,
            )),
            warming: Arc::new(WarmingScheduler::new()),
            stats: Arc::new(StatsCollector::new()),
            shared,
            config: Arc::new(config),
            shutdown_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    // ===== Reads =====

    /// Get a value, or `None` on miss
    ///
    /// A stored value that does not decode as `T` counts as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if validate_key(key).is_err() {
            return None;
        }
        self.read(key).await.map(|(value, _)| value)
    }

    /// Whether a live entry exists, without touching hit/miss statistics
    pub async fn exists(&self, key: &str) -> bool {
        if validate_key(key).is_err() {
            return false;
        }
        self.reconcile().await;
        if self.shared.is_available() {
            if let TierResult::Available(Some(_)) = self.shared.get(key).await {
                return true;
            }
        }
        self.local.peek(key).is_some()
    }

    async fn lookup(&self, key: &str) -> Option<(CacheEntry, HitTier)> {
        self.reconcile().await;
        if self.shared.is_available() {
            if let TierResult::Available(Some(entry)) = self.shared.get(key).await {
                // Promote; the entry carries its own expiry
                self.local.insert(key, entry.clone());
                return Some((entry, HitTier::Shared));
            }
        }
        self.local.get_entry(key).map(|entry| (entry, HitTier::Local))
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<(T, CacheEntry)> {
        let started = Instant::now();
        let Some((entry, tier)) = self.lookup(key).await else {
            self.stats.record_miss();
            debug!(key = %key, "Cache miss");
            return None;
        };

        match serde_json::from_value::<T>(entry.value.clone()) {
            Ok(value) => {
                self.stats.record_hit(tier);
                self.stats.record_read_latency(
                    entry.quality_class,
                    started.elapsed(),
                    self.config.class_sla(entry.quality_class),
                );
                debug!(key = %key, tier = ?tier, "Cache hit");
                Some((value, entry))
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Cached value has unexpected shape, treating as miss");
                self.stats.record_miss();
                None
            }
        }
    }

    // ===== Writes =====

    /// Store a value in both tiers
    ///
    /// Returns `false` for an invalid key, tag or TTL, or a value that cannot be
    /// serialized. A shared tier failure still returns `true`: the value is
    /// held locally until the shared tier recovers.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: SetOptions) -> bool {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Value not serializable, not cached");
                return false;
            }
        };
        match self.store(key, value, &options, None).await {
            Ok(_) => true,
            Err(e) => {
                debug!(key = %key, error = %e, "Rejected cache write");
                false
            }
        }
    }

    async fn store(
        &self,
        key: &str,
        value: Value,
        options: &SetOptions,
        compute_time: Option<Duration>,
    ) -> Result<String, CacheError> {
        let full_key = match &options.prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        };
        validate_key(&full_key)?;
        TagIndex::validate(&options.tags)?;
        let ttl = options.ttl.unwrap_or_else(|| self.config.class_ttl(options.quality_class));
        if ttl.is_zero() {
            return Err(CacheError::InvalidArgument("ttl must be non-zero".into()));
        }

        self.reconcile().await;
        let entry = CacheEntry::new(value, ttl, options.tags.clone(), options.quality_class, compute_time);
        self.local.insert(&full_key, entry.clone());
        self.stats.record_set();

        match self.shared.set(&full_key, &entry).await {
            TierResult::Available(()) => {
                if !self.tags.add(&full_key, &options.tags, ttl).await.is_available() {
                    warn!(key = %full_key, "Tag index update failed, retrying after recovery");
                    self.shared.record_missed(MissedWrite::Key(full_key.clone()));
                }
                debug!(key = %full_key, ttl_ms = duration_millis(ttl), "[Local+Shared] Cached");
            }
            TierResult::Unavailable => {
                self.stats.record_fallback_write();
                self.shared.record_missed(MissedWrite::Key(full_key.clone()));
                debug!(key = %full_key, ttl_ms = duration_millis(ttl), "[Local] Cached, shared tier unavailable");
            }
        }

        if options.quality_class == QualityClass::LatencySensitive {
            self.warming.register(&full_key, options.quality_class);
        }
        self.events.publish(CacheEvent::set(full_key.as_str())).await;
        Ok(full_key)
    }

    /// Remove a key from both tiers; removing an absent key succeeds
    pub async fn delete(&self, key: &str) -> bool {
        if validate_key(key).is_err() {
            return false;
        }
        self.reconcile().await;

        let tags = match self.local.remove(key) {
            Some(entry) => entry.tags,
            None => match self.shared.get(key).await {
                TierResult::Available(Some(entry)) => entry.tags,
                _ => Vec::new(),
            },
        };

        match self.shared.delete(key).await {
            TierResult::Available(_) => {
                if !tags.is_empty() {
                    let _ = self.tags.remove_key(key, &tags).await;
                }
            }
            TierResult::Unavailable => self.shared.record_missed(MissedWrite::Key(key.to_string())),
        }
        self.warming.unregister(key);
        self.stats.record_delete();
        self.events.publish(CacheEvent::delete(key)).await;
        debug!(key = %key, "Deleted");
        true
    }

    /// Remove every entry, or every entry whose key starts with `prefix`
    pub async fn clear(&self, prefix: Option<&str>) -> bool {
        let filter = KeyFilter::from_prefix(prefix);
        self.reconcile().await;

        let local_removed = match filter {
            KeyFilter::All => {
                let len = self.local.len();
                self.local.clear();
                self.warming.clear();
                len
            }
            _ => {
                self.warming.unregister_matching(&filter);
                self.local.remove_matching(&filter).len()
            }
        };

        let shared_removed = match self.remove_shared_matching(&filter).await {
            Some(removed) => removed,
            None => {
                self.shared.record_missed(MissedWrite::Filter(filter));
                0
            }
        };

        self.events.publish(CacheEvent::clear(prefix.filter(|p| !p.is_empty()))).await;
        info!(prefix = ?prefix, local_removed, shared_removed, "Cache cleared");
        true
    }

    /// Administrative clear: each present field runs the matching invalidation
    ///
    /// An empty request clears everything.
    pub async fn apply_clear(&self, request: &ClearRequest) -> bool {
        if request.pattern.is_none() && request.tag.is_none() && request.prefix.is_none() {
            return self.clear(None).await;
        }

        let mut ok = true;
        if let Some(pattern) = &request.pattern {
            ok &= self.invalidate_pattern(pattern).await;
        }
        if let Some(tag) = &request.tag {
            ok &= self.invalidate_tag(tag).await;
        }
        if let Some(prefix) = &request.prefix {
            ok &= self.clear(Some(prefix)).await;
        }
        ok
    }

    // ===== Invalidation =====

    /// Remove every key carrying `tag`
    pub async fn invalidate_tag(&self, tag: &str) -> bool {
        if let Err(e) = validate_tag(tag) {
            debug!(tag = %tag, error = %e, "Rejected tag invalidation");
            return false;
        }

        self.reconcile().await;

        let mut shared_removed = 0;
        match self.remove_shared_tagged(tag).await {
            Some(members) => {
                shared_removed = members.len();
                for key in &members {
                    self.local.remove(key);
                    self.warming.unregister(key);
                }
            }
            None => self.shared.record_missed(MissedWrite::Tag(tag.to_string())),
        }

        let local_removed = self.local.remove_tagged(tag);
        for key in &local_removed {
            self.warming.unregister(key);
        }

        self.events.publish(CacheEvent::invalidate_tag(tag)).await;
        info!(tag = %tag, shared_removed, local_removed = local_removed.len(), "Invalidated tag");
        true
    }

    /// Remove every key containing `pattern`
    pub async fn invalidate_pattern(&self, pattern: &str) -> bool {
        if pattern.is_empty() {
            return false;
        }
        let filter = KeyFilter::Contains(pattern.to_string());
        self.reconcile().await;

        let shared_removed = match self.remove_shared_matching(&filter).await {
            Some(removed) => removed,
            None => {
                self.shared.record_missed(MissedWrite::Filter(filter.clone()));
                0
            }
        };
        let local_removed = self.local.remove_matching(&filter).len();
        self.warming.unregister_matching(&filter);

        self.events.publish(CacheEvent::invalidate_pattern(pattern)).await;
        info!(pattern = %pattern, shared_removed, local_removed, "Invalidated pattern");
        true
    }

    /// Remove shared keys selected by `filter`; `None` when the tier is unreachable
    async fn remove_shared_matching(&self, filter: &KeyFilter) -> Option<usize> {
        let keys = self.shared.scan_keys(filter).await.ok()?;
        let removed = self.shared.remove_bulk(&keys).await.ok()?;
        if *filter == KeyFilter::All {
            self.tags.drop_all().await.ok()?;
        }
        Some(removed)
    }

    /// Remove shared keys carrying `tag` and the tag set itself
    async fn remove_shared_tagged(&self, tag: &str) -> Option<Vec<String>> {
        let members = self.tags.members(tag).await.ok()?;
        self.shared.remove_bulk(&members).await.ok()?;
        self.tags.drop_tag(tag).await.ok()?;
        Some(members)
    }

    // ===== Recovery =====

    /// Replay writes the shared tier missed, once it is reachable again
    ///
    /// Runs at the start of every read and mutation. Callers arriving during a
    /// replay wait for it so they never read entries the replay is about to
    /// remove. Must not be reached from [`replay`](Self::replay).
    async fn reconcile(&self) {
        if !self.shared.needs_replay() {
            return;
        }
        let _gate = self.shared.replay_lock().await;
        if !self.shared.needs_replay() {
            return;
        }

        let missed = self.shared.take_missed();
        let total = missed.len();
        let mut pending = missed.into_iter();
        let mut unapplied = Vec::new();
        for write in pending.by_ref() {
            if !self.replay(&write).await {
                unapplied.push(write);
                break;
            }
        }
        unapplied.extend(pending);

        if unapplied.is_empty() {
            info!(writes = total, "Replayed writes missed during shared tier outage");
        } else {
            warn!(
                applied = total - unapplied.len(),
                remaining = unapplied.len(),
                "Shared tier failed during replay, retrying after next recovery"
            );
        }
        self.shared.finish_replay(unapplied);
    }

    /// Apply one missed write to the shared tier and announce it to peers
    async fn replay(&self, write: &MissedWrite) -> bool {
        match write {
            MissedWrite::Key(key) => match self.local.peek(key) {
                Some(entry) => {
                    if !self.shared.set(key, &entry).await.is_available() {
                        return false;
                    }
                    if !self.tags.add(key, &entry.tags, entry.remaining_ttl()).await.is_available() {
                        return false;
                    }
                    self.events.publish_remote(CacheEvent::set(key.as_str())).await;
                }
                None => {
                    if !self.shared.delete(key).await.is_available() {
                        return false;
                    }
                    self.events.publish_remote(CacheEvent::delete(key.as_str())).await;
                }
            },
            MissedWrite::Tag(tag) => {
                if self.remove_shared_tagged(tag).await.is_none() {
                    return false;
                }
                self.events.publish_remote(CacheEvent::invalidate_tag(tag.as_str())).await;
            }
            MissedWrite::Filter(filter) => {
                if self.remove_shared_matching(filter).await.is_none() {
                    return false;
                }
                let event = match filter {
                    KeyFilter::All => CacheEvent::clear(None),
                    KeyFilter::Prefix(prefix) => CacheEvent::clear(Some(prefix.as_str())),
                    KeyFilter::Contains(pattern) => CacheEvent::invalidate_pattern(pattern.as_str()),
                };
                self.events.publish_remote(event).await;
            }
        }
        debug!(write = ?write, "Replayed missed write");
        true
    }

    /// React to an upstream data-load notification
    ///
    /// Known `(source, event)` pairs invalidate their configured patterns;
    /// unknown pairs are re-broadcast as [`CacheEvent::EtlEvent`]. Returns the
    /// number of patterns invalidated.
    pub async fn handle_etl_event(&self, source: &str, event: &str) -> usize {
        self.stats.record_etl_event();

        let patterns = self.config.etl_rules.patterns_for(source, event);
        if patterns.is_empty() {
            debug!(etl_source = %source, etl_event = %event, "No ETL rule, re-broadcasting");
            self.events.publish(CacheEvent::etl(source, event)).await;
            return 0;
        }

        let mut invalidated = 0;
        for pattern in &patterns {
            if self.invalidate_pattern(pattern).await {
                self.stats.record_etl_invalidation();
                invalidated += 1;
            }
        }
        info!(etl_source = %source, etl_event = %event, patterns = ?patterns, "Applied ETL invalidation");
        invalidated
    }

    // ===== Get-or-compute =====

    /// Get a cached value or compute it with stampede protection
    ///
    /// Concurrent callers missing the same key share one factory run and all
    /// receive its value or its error. A caller that missed just as another
    /// computation finished is served the stored value instead of running the
    /// factory again. A latency-sensitive hit whose remaining
    /// TTL has dropped below the refresh threshold is returned immediately
    /// while a refresh runs in the background.
    ///
    /// # Errors
    ///
    /// - [`CacheError::InvalidArgument`] for an invalid key, tag or TTL
    /// - [`CacheError::Factory`] when the factory fails or panics
    /// - [`CacheError::Serialization`] when the value cannot be converted to or from `T`
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, factory: F, options: GetOrSetOptions) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        validate_key(key)?;
        TagIndex::validate(&options.tags)?;
        if options.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(CacheError::InvalidArgument("ttl must be non-zero".into()));
        }

        if !options.force_refresh {
            if let Some(pending) = self.coordinator.join(key) {
                debug!(key = %key, "Joining pending computation");
                return decode(pending.await?);
            }

            if let Some((value, entry)) = self.read::<T>(key).await {
                if self.needs_refresh(key, &entry) {
                    self.spawn_refresh(key, factory, &options);
                }
                return Ok(value);
            }
        }

        let task = computation_task(self.clone(), key.to_string(), factory, options.clone(), !options.force_refresh);
        let computation = if options.force_refresh {
            debug!(key = %key, "Forced recomputation");
            self.coordinator.start(key, task)
        } else {
            self.coordinator.join_or_start(key, task).into_computation()
        };
        decode(computation.await?)
    }

    /// Run a factory and store its result
    async fn compute_and_store<T, F, Fut>(&self, key: &str, factory: F, options: &GetOrSetOptions) -> ComputeOutcome
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let value = factory().await.map_err(CacheError::factory)?;
        let elapsed = started.elapsed();
        let value = serde_json::to_value(&value).map_err(|e| CacheError::Serialization(e.to_string()))?;

        self.stats.record_compute_latency(options.quality_class, elapsed);
        self.store(key, value.clone(), &options.as_set_options(), Some(elapsed)).await?;
        debug!(key = %key, compute_ms = duration_millis(elapsed), "Computed and cached");
        Ok(value)
    }

    /// Stored value for `key` if it decodes as `T`, without touching hit/miss counters
    async fn cached_value<T: DeserializeOwned>(&self, key: &str) -> Option<Value> {
        let (entry, _) = self.lookup(key).await?;
        serde_json::from_value::<T>(entry.value.clone()).ok()?;
        Some(entry.value)
    }

    fn needs_refresh(&self, key: &str, entry: &CacheEntry) -> bool {
        self.config.background_refresh
            && entry.quality_class == QualityClass::LatencySensitive
            && (entry.is_below_fraction(self.config.refresh_threshold) || self.warming.is_flagged(key))
    }

    /// Recompute a key without making the caller wait
    ///
    /// Skipped when a computation for the key is already pending. The outcome
    /// is counted and announced as [`CacheEvent::BackgroundRefresh`] on the
    /// local event channel.
    fn spawn_refresh<T, F, Fut>(&self, key: &str, factory: F, options: &GetOrSetOptions)
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let task = computation_task(self.clone(), key.to_string(), factory, options.clone(), false);
        let Some(computation) = self.coordinator.try_start(key, task) else {
            debug!(key = %key, "Refresh already pending");
            return;
        };
        debug!(key = %key, "Background refresh started");

        let engine = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let outcome = computation.await;
            engine.finish_refresh(key, outcome);
        });
    }

    fn finish_refresh(&self, key: String, outcome: ComputeOutcome) {
        let event = match outcome {
            Ok(_) => {
                self.stats.record_background_refresh(true);
                debug!(key = %key, "Background refresh complete");
                CacheEvent::BackgroundRefresh {
                    key,
                    succeeded: true,
                    error: None,
                }
            }
            Err(e) => {
                self.stats.record_background_refresh(false);
                warn!(key = %key, error = %e, "Background refresh failed, serving cached value until expiry");
                CacheEvent::BackgroundRefresh {
                    key,
                    succeeded: false,
                    error: Some(e.to_string()),
                }
            }
        };
        self.events.notify_local(event);
    }

    // ===== Observability =====

    #[must_use]
    pub fn get_stats(&self) -> CacheStats {
        let mut stats = self.stats.snapshot(|class| self.config.class_sla(class));
        stats.size = self.local.len();
        stats.coalesced = self.coordinator.coalesced();
        stats.in_flight = self.coordinator.in_flight();

        let warming = self.warming.stats();
        stats.warming_keys = warming.registered;
        stats.warming_runs = warming.runs;
        stats.keys_flagged = warming.keys_flagged;

        stats.shared_available = self.shared.is_available();
        stats.shared_failures = self.shared.failures();
        stats
    }

    #[must_use]
    pub fn event_stats(&self) -> EventStats {
        self.events.stats()
    }

    /// Receive every event this engine emits or applies from other instances
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Check the shared tier
    ///
    /// Healthy when the shared tier answers, or when the engine runs
    /// local-only by configuration.
    pub async fn health_check(&self) -> bool {
        if !self.shared.is_configured() {
            return true;
        }
        self.shared.health_check().await
    }

    #[must_use]
    pub fn is_shared_available(&self) -> bool {
        self.shared.is_available()
    }

    /// Id stamped on events this engine publishes
    #[must_use]
    pub fn instance_id(&self) -> &str {
        self.events.origin()
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Run one warming pass now
    pub async fn run_warming(&self) -> WarmingReport {
        run_warming_pass(&self.warming, &self.local, &self.shared, &self.events, self.config.warming_threshold).await
    }

    // ===== Lifecycle =====

    /// Start the event subscriber, the local sweep and the warming loop
    pub(crate) fn start_background_tasks(&self) {
        let mut handles = Vec::with_capacity(3);

        if self.shared.is_configured() {
            let local = Arc::clone(&self.local);
            let warming = Arc::clone(&self.warming);
            handles.push(self.events.start(
                move |event| {
                    apply_remote_event(&local, &warming, &event);
                    async { Ok::<(), anyhow::Error>(()) }
                },
                self.shutdown_tx.subscribe(),
                self.config.shared_retry_interval,
            ));
        }

        handles.push(self.spawn_sweeper());
        handles.push(self.spawn_warming());
        self.tasks.lock().extend(handles);
        info!(
            shared = self.shared.backend_name(),
            instance = %self.events.origin(),
            "Cache engine started"
        );
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let local = Arc::clone(&self.local);
        let interval = self.config.local_sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        local.cleanup_expired();
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn spawn_warming(&self) -> JoinHandle<()> {
        let warming = Arc::clone(&self.warming);
        let local = Arc::clone(&self.local);
        let shared = Arc::clone(&self.shared);
        let events = Arc::clone(&self.events);
        let interval = self.config.warming_interval;
        let threshold = self.config.warming_threshold;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_warming_pass(&warming, &local, &shared, &events, threshold).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Stop background tasks and wait for them to finish
    ///
    /// Computations already running are left to complete.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Cache engine stopped");
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, CacheError> {
    serde_json::from_value(value).map_err(|e| CacheError::Serialization(e.to_string()))
}

/// Work registered with the coordinator for one key
///
/// With `recheck`, a value stored between the caller's miss and the
/// registration is returned instead of running the factory.
fn computation_task<T, F, Fut>(
    engine: CacheEngine,
    key: String,
    factory: F,
    options: GetOrSetOptions,
    recheck: bool,
) -> impl FnOnce(CleanupGuard) -> BoxFuture<'static, ComputeOutcome>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    move |guard| {
        async move {
            let _guard = guard;
            if recheck {
                if let Some(value) = engine.cached_value::<T>(&key).await {
                    debug!(key = %key, "Value stored while waiting to compute, skipping factory");
                    return Ok(value);
                }
            }
            engine.compute_and_store(&key, factory, &options).await
        }
        .boxed()
    }
}

async fn run_warming_pass(
    warming: &WarmingScheduler,
    local: &LocalTier,
    shared: &SharedTier,
    events: &EventBus,
    threshold: f64,
) -> WarmingReport {
    let report = warming.tick(local, shared, threshold).await;
    if !report.flagged.is_empty() {
        events.notify_local(CacheEvent::Warming {
            flagged: report.flagged.clone(),
        });
    }
    report
}

/// Mirror another instance's mutation in the local tier
fn apply_remote_event(local: &LocalTier, warming: &WarmingScheduler, event: &CacheEvent) {
    match event {
        CacheEvent::Set { key } => {
            local.remove(key);
        }
        CacheEvent::Delete { key } => {
            local.remove(key);
            warming.unregister(key);
        }
        CacheEvent::Clear { prefix } => match KeyFilter::from_prefix(prefix.as_deref()) {
            KeyFilter::All => {
                local.clear();
                warming.clear();
            }
            filter => {
                local.remove_matching(&filter);
                warming.unregister_matching(&filter);
            }
        },
        CacheEvent::InvalidateTag { tag } => {
            for key in local.remove_tagged(tag) {
                warming.unregister(&key);
            }
        }
        CacheEvent::InvalidatePattern { pattern } => {
            let filter = KeyFilter::Contains(pattern.clone());
            local.remove_matching(&filter);
            warming.unregister_matching(&filter);
        }
        CacheEvent::EtlEvent { .. } | CacheEvent::BackgroundRefresh { .. } | CacheEvent::Warming { .. } => {}
    }
    debug!(kind = event.kind(), "Applied remote cache event");
}
