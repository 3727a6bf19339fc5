//! Cache events and cross-process propagation
//!
//! Every mutating engine operation emits a [`CacheEvent`]. Events fan out twice:
//! to in-process observers over a `tokio::sync::broadcast` channel, and to the
//! other server instances over the shared tier's Pub/Sub channel. Each instance
//! runs a subscriber task that applies remote events to its local tier, which
//! bounds how long local mirrors can diverge after a remote write.

use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::shared_tier::SharedTier;
use crate::traits::TierResult;

/// Cache lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    /// A key was written
    Set { key: String },

    /// A key was removed
    Delete { key: String },

    /// All keys (or all keys under a prefix) were removed
    Clear {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },

    /// Every key carrying a tag was removed
    InvalidateTag { tag: String },

    /// Every key containing a substring was removed
    InvalidatePattern { pattern: String },

    /// An upstream data load changed a domain no ETL rule knows about
    EtlEvent { etl_source: String, etl_event: String },

    /// A background refresh finished
    BackgroundRefresh {
        key: String,
        succeeded: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The warming scheduler flagged keys close to expiry
    Warming { flagged: Vec<String> },
}

impl CacheEvent {
    pub fn set(key: impl Into<String>) -> Self {
        Self::Set { key: key.into() }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    #[must_use]
    pub fn clear(prefix: Option<&str>) -> Self {
        Self::Clear {
            prefix: prefix.map(ToString::to_string),
        }
    }

    pub fn invalidate_tag(tag: impl Into<String>) -> Self {
        Self::InvalidateTag { tag: tag.into() }
    }

    pub fn invalidate_pattern(pattern: impl Into<String>) -> Self {
        Self::InvalidatePattern {
            pattern: pattern.into(),
        }
    }

    pub fn etl(source: impl Into<String>, event: impl Into<String>) -> Self {
        Self::EtlEvent {
            etl_source: source.into(),
            etl_event: event.into(),
        }
    }

    /// Wire name of the event type
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Delete { .. } => "delete",
            Self::Clear { .. } => "clear",
            Self::InvalidateTag { .. } => "invalidate_tag",
            Self::InvalidatePattern { .. } => "invalidate_pattern",
            Self::EtlEvent { .. } => "etl_event",
            Self::BackgroundRefresh { .. } => "background_refresh",
            Self::Warming { .. } => "warming",
        }
    }
}

/// Event as sent over the shared channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Instance id of the publishing engine
    pub origin: String,
    pub event: CacheEvent,
}

impl EventEnvelope {
    /// Serialize to JSON for transmission
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize cache event")
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid envelope.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize cache event")
    }
}

/// Statistics for event propagation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventStats {
    /// Events that reached the shared channel
    pub messages_sent: u64,

    /// Events that could not be published (shared tier unavailable)
    pub publish_failures: u64,

    /// Remote events applied
    pub messages_received: u64,

    /// Own events echoed back by the channel and skipped
    pub own_echoes_ignored: u64,

    /// Malformed payloads and handler failures
    pub processing_errors: u64,
}

#[derive(Debug, Default)]
struct AtomicEventStats {
    messages_sent: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    own_echoes_ignored: AtomicU64,
    processing_errors: AtomicU64,
}

impl AtomicEventStats {
    fn snapshot(&self) -> EventStats {
        EventStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            own_echoes_ignored: self.own_echoes_ignored.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }
}

/// Publish/subscribe hub for cache events
pub struct EventBus {
    shared: Arc<SharedTier>,
    channel: String,
    origin: String,
    local_tx: broadcast::Sender<CacheEvent>,
    stats: Arc<AtomicEventStats>,
}

impl EventBus {
    pub fn new(shared: Arc<SharedTier>, channel: impl Into<String>, buffer: usize) -> Self {
        let (local_tx, _) = broadcast::channel(buffer.max(1));
        Self {
            shared,
            channel: channel.into(),
            origin: Uuid::new_v4().to_string(),
            local_tx,
            stats: Arc::new(AtomicEventStats::default()),
        }
    }

    /// Instance id stamped on every published event
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive every event this instance emits or applies
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.local_tx.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> EventStats {
        self.stats.snapshot()
    }

    /// Deliver an event to in-process observers only
    pub fn notify_local(&self, event: CacheEvent) {
        // No receivers is fine
        let _ = self.local_tx.send(event);
    }

    /// Emit an event locally and to the other instances
    ///
    /// Returns whether the event reached the shared channel. Failure is not an
    /// error: other instances converge when their entries expire.
    pub async fn publish(&self, event: CacheEvent) -> bool {
        self.notify_local(event.clone());
        self.publish_remote(event).await
    }

    /// Send an event to the other instances only
    pub async fn publish_remote(&self, event: CacheEvent) -> bool {
        let kind = event.kind();
        let envelope = EventEnvelope {
            origin: self.origin.clone(),
            event,
        };
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, kind, "Dropping unserializable cache event");
                self.stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        match self.shared.publish(&self.channel, &json).await {
            TierResult::Available(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                debug!(kind, channel = %self.channel, "Published cache event");
                true
            }
            TierResult::Unavailable => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Start the subscriber background task
    ///
    /// `handler` is called for every event published by another instance;
    /// applied events are then forwarded to local observers. The task
    /// resubscribes after `retry` when the subscription drops and exits when
    /// `shutdown_rx` fires.
    pub fn start<F, Fut>(
        &self,
        handler: F,
        mut shutdown_rx: broadcast::Receiver<()>,
        retry: Duration,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(CacheEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let ctx = SubscriberContext {
            shared: Arc::clone(&self.shared),
            channel: self.channel.clone(),
            origin: self.origin.clone(),
            local_tx: self.local_tx.clone(),
            stats: Arc::clone(&self.stats),
        };

        tokio::spawn(async move {
            let handler = Arc::new(handler);

            loop {
                match ctx.run(Arc::clone(&handler), &mut shutdown_rx).await {
                    Ok(()) => {
                        info!("Cache event subscriber shutting down...");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, retry_ms = u64::try_from(retry.as_millis()).unwrap_or(u64::MAX), "Cache event subscription lost, retrying");

                        // Wait before reconnecting
                        tokio::select! {
                            () = tokio::time::sleep(retry) => {},
                            _ = shutdown_rx.recv() => {
                                info!("Cache event subscriber shutting down...");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}

struct SubscriberContext {
    shared: Arc<SharedTier>,
    channel: String,
    origin: String,
    local_tx: broadcast::Sender<CacheEvent>,
    stats: Arc<AtomicEventStats>,
}

impl SubscriberContext {
    /// Internal subscriber loop; `Ok` means shutdown was requested
    async fn run<F, Fut>(&self, handler: Arc<F>, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<()>
    where
        F: Fn(CacheEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut stream = match self.shared.subscribe(&self.channel).await {
            TierResult::Available(stream) => stream,
            TierResult::Unavailable => return Err(anyhow!("shared tier unavailable")),
        };
        debug!(channel = %self.channel, "Listening for cache events");

        loop {
            // Wait for message or shutdown signal
            tokio::select! {
                msg = stream.next() => {
                    let Some(payload) = msg else {
                        return Err(anyhow!("Pub/Sub message stream ended"));
                    };
                    self.process(&payload, handler.as_ref()).await;
                }
                _ = shutdown_rx.recv() => {
                    return Ok(());
                }
            }
        }
    }

    async fn process<F, Fut>(&self, payload: &str, handler: &F)
    where
        F: Fn(CacheEvent) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let envelope = match EventEnvelope::from_json(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Failed to decode cache event");
                self.stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if envelope.origin == self.origin {
            self.stats.own_echoes_ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let event = envelope.event;
        if let Err(e) = handler(event.clone()).await {
            error!(error = %e, kind = event.kind(), "Cache event handler error");
            self.stats.processing_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let _ = self.local_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryTier;
    use parking_lot::Mutex;

    fn bus_pair() -> (EventBus, EventBus) {
        let backend = Arc::new(MemoryTier::new());
        let make = || {
            let shared = Arc::new(SharedTier::new(
                Arc::clone(&backend) as Arc<dyn crate::traits::SharedBackend>,
                Duration::from_millis(100),
                Duration::from_millis(100),
            ));
            EventBus::new(shared, "test:events", 16)
        };
        (make(), make())
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(CacheEvent::invalidate_tag("kpi")).unwrap_or_default();
        assert_eq!(json, serde_json::json!({"type": "invalidate_tag", "tag": "kpi"}));

        let json = serde_json::to_value(CacheEvent::clear(None)).unwrap_or_default();
        assert_eq!(json, serde_json::json!({"type": "clear"}));

        let json = serde_json::to_value(CacheEvent::etl("final_watchdog", "inventory_updated")).unwrap_or_default();
        assert_eq!(json["etl_source"], "final_watchdog");
        assert_eq!(json["etl_event"], "inventory_updated");
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = EventEnvelope {
            origin: "node-a".into(),
            event: CacheEvent::BackgroundRefresh {
                key: "kpi:leads".into(),
                succeeded: false,
                error: Some("timeout".into()),
            },
        };
        let json = envelope.to_json().unwrap_or_default();
        let parsed = EventEnvelope::from_json(&json).ok();
        assert_eq!(parsed, Some(envelope));
        assert!(EventEnvelope::from_json("{\"origin\":1}").is_err());
    }

    #[tokio::test]
    async fn test_remote_events_reach_handler_and_echoes_are_skipped() {
        let (a, b) = bus_pair();
        let (shutdown_tx, _) = broadcast::channel(1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_b = Arc::clone(&seen);
        let handle_b = b.start(
            move |event| {
                let seen = Arc::clone(&seen_b);
                async move {
                    seen.lock().push(event);
                    Ok(())
                }
            },
            shutdown_tx.subscribe(),
            Duration::from_millis(50),
        );
        let handle_a = a.start(|_| async { Ok(()) }, shutdown_tx.subscribe(), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut local = a.subscribe();
        assert!(a.publish(CacheEvent::delete("k1")).await);
        assert_eq!(local.recv().await.ok(), Some(CacheEvent::delete("k1")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().clone(), vec![CacheEvent::delete("k1")]);
        assert_eq!(b.stats().messages_received, 1);
        assert_eq!(a.stats().own_echoes_ignored, 1);
        assert_eq!(a.stats().messages_sent, 1);

        let _ = shutdown_tx.send(());
        let _ = tokio::time::timeout(Duration::from_secs(1), handle_a).await;
        let _ = tokio::time::timeout(Duration::from_secs(1), handle_b).await;
    }

    #[tokio::test]
    async fn test_publish_without_shared_tier() {
        let bus = EventBus::new(Arc::new(SharedTier::disconnected()), "c", 4);
        let mut local = bus.subscribe();
        assert!(!bus.publish(CacheEvent::set("k")).await);
        assert_eq!(local.recv().await.ok(), Some(CacheEvent::set("k")));
        assert_eq!(bus.stats().publish_failures, 1);
    }
}
