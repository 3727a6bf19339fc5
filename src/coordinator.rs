//! Computation coordinator - stampede protection
//!
//! Per-process registry of in-flight computations keyed by cache key. The
//! first caller to miss starts the computation; everyone arriving while it is
//! pending awaits the same shared future and receives a clone of its result.
//!
//! Computations run as spawned tasks, so a caller dropping its future never
//! cancels work other waiters depend on. Each registration is removed by a
//! [`CleanupGuard`] owned by the task, which runs on success, error and panic
//! alike, and only removes the registration it created.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::error::CacheError;

/// Result of a computation as seen by every waiter
pub type ComputeOutcome = Result<serde_json::Value, CacheError>;

/// Cloneable handle on a pending computation
pub type SharedComputation = Shared<BoxFuture<'static, ComputeOutcome>>;

struct PendingComputation {
    id: Uuid,
    started_at: Instant,
    /// Refreshes of a value that is still cached; readers are not made to wait
    background: bool,
    computation: SharedComputation,
}

/// RAII cleanup guard for in-flight computation tracking
///
/// Moved into the computation task; dropping it deregisters the computation
/// unless a newer one has replaced it in the meantime.
pub struct CleanupGuard {
    map: Arc<DashMap<String, PendingComputation>>,
    key: String,
    id: Uuid,
}

impl CleanupGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let id = self.id;
        self.map.remove_if(&self.key, |_, pending| pending.id == id);
    }
}

/// How a caller was admitted to a computation
pub enum Admission {
    /// Joined a computation another caller started
    Joined(SharedComputation),
    /// Started a new computation
    Started(SharedComputation),
}

impl Admission {
    #[must_use]
    pub fn into_computation(self) -> SharedComputation {
        match self {
            Self::Joined(c) | Self::Started(c) => c,
        }
    }

    #[must_use]
    pub fn started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

pub struct ComputationCoordinator {
    pending: Arc<DashMap<String, PendingComputation>>,
    max_age: Duration,
    started: AtomicU64,
    coalesced: AtomicU64,
}

impl ComputationCoordinator {
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            max_age,
            started: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    fn is_fresh(&self, pending: &PendingComputation) -> bool {
        pending.started_at.elapsed() < self.max_age
    }

    /// Join a fresh foreground computation for `key`, if any
    ///
    /// Background refreshes are skipped: the value they replace is still
    /// cached and should be served instead.
    pub fn join(&self, key: &str) -> Option<SharedComputation> {
        let pending = self.pending.get(key)?;
        if !pending.background && self.is_fresh(&pending) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            Some(pending.computation.clone())
        } else {
            None
        }
    }

    /// Join a fresh pending computation, or start one with `start`
    ///
    /// Check and registration happen under the map's entry lock, so two
    /// callers that both missed the cache cannot both start.
    pub fn join_or_start<F>(&self, key: &str, start: F) -> Admission
    where
        F: FnOnce(CleanupGuard) -> BoxFuture<'static, ComputeOutcome>,
    {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(occupied) if self.is_fresh(occupied.get()) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                Admission::Joined(occupied.get().computation.clone())
            }
            Entry::Occupied(mut occupied) => {
                debug!(key = %key, "Pending computation exceeded max age, starting a new one");
                let pending = self.launch(key, start, false);
                let computation = pending.computation.clone();
                occupied.insert(pending);
                Admission::Started(computation)
            }
            Entry::Vacant(vacant) => {
                let pending = self.launch(key, start, false);
                let computation = pending.computation.clone();
                vacant.insert(pending);
                Admission::Started(computation)
            }
        }
    }

    /// Start a computation that replaces any registered one (forced refresh)
    pub fn start<F>(&self, key: &str, start: F) -> SharedComputation
    where
        F: FnOnce(CleanupGuard) -> BoxFuture<'static, ComputeOutcome>,
    {
        // Registered under the entry lock so the guard of a computation that
        // finishes immediately cannot run before the registration exists
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let pending = self.launch(key, start, false);
                let computation = pending.computation.clone();
                occupied.insert(pending);
                computation
            }
            Entry::Vacant(vacant) => {
                let pending = self.launch(key, start, false);
                let computation = pending.computation.clone();
                vacant.insert(pending);
                computation
            }
        }
    }

    /// Start a background refresh unless a fresh computation is pending
    pub fn try_start<F>(&self, key: &str, start: F) -> Option<SharedComputation>
    where
        F: FnOnce(CleanupGuard) -> BoxFuture<'static, ComputeOutcome>,
    {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(occupied) if self.is_fresh(occupied.get()) => None,
            Entry::Occupied(mut occupied) => {
                let pending = self.launch(key, start, true);
                let computation = pending.computation.clone();
                occupied.insert(pending);
                Some(computation)
            }
            Entry::Vacant(vacant) => {
                let pending = self.launch(key, start, true);
                let computation = pending.computation.clone();
                vacant.insert(pending);
                Some(computation)
            }
        }
    }

    fn launch<F>(&self, key: &str, start: F, background: bool) -> PendingComputation
    where
        F: FnOnce(CleanupGuard) -> BoxFuture<'static, ComputeOutcome>,
    {
        let id = Uuid::new_v4();
        let guard = CleanupGuard {
            map: Arc::clone(&self.pending),
            key: key.to_string(),
            id,
        };
        self.started.fetch_add(1, Ordering::Relaxed);

        let key_owned = key.to_string();
        let handle = tokio::spawn(start(guard));
        let computation = async move {
            handle.await.unwrap_or_else(|e| {
                Err(CacheError::factory(anyhow::anyhow!(
                    "computation for '{key_owned}' did not complete: {e}"
                )))
            })
        }
        .boxed()
        .shared();

        PendingComputation {
            id,
            started_at: Instant::now(),
            background,
            computation,
        }
    }

    /// Number of computations currently registered
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Computations started since creation
    #[must_use]
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Callers that joined an existing computation instead of starting one
    #[must_use]
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn slow(value: serde_json::Value, runs: Arc<AtomicU32>) -> impl FnOnce(CleanupGuard) -> BoxFuture<'static, ComputeOutcome> {
        move |guard| {
            async move {
                let _guard = guard;
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let coordinator = ComputationCoordinator::new(Duration::from_secs(30));
        let runs = Arc::new(AtomicU32::new(0));

        let first = coordinator.join_or_start("k", slow(json!(7), Arc::clone(&runs)));
        let second = coordinator.join_or_start("k", slow(json!(8), Arc::clone(&runs)));
        assert!(first.started());
        assert!(!second.started());
        assert_eq!(coordinator.in_flight(), 1);

        let (a, b) = tokio::join!(first.into_computation(), second.into_computation());
        assert_eq!(a.ok(), Some(json!(7)));
        assert_eq!(b.ok(), Some(json!(7)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.coalesced(), 1);
        assert_eq!(coordinator.in_flight(), 0, "registration removed after completion");
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_cleared() {
        let coordinator = ComputationCoordinator::new(Duration::from_secs(30));
        let computation = coordinator
            .join_or_start("k", |guard| {
                async move {
                    let _guard = guard;
                    Err(CacheError::factory(anyhow::anyhow!("db down")))
                }
                .boxed()
            })
            .into_computation();

        let joined = coordinator.join("k");
        let result = computation.await;
        assert!(matches!(result, Err(CacheError::Factory(_))));
        if let Some(joined) = joined {
            assert_eq!(joined.await.err().map(|e| e.to_string()).as_deref(), Some("db down"));
        }
        assert!(!coordinator.is_pending("k"));
    }

    #[tokio::test]
    async fn test_panic_is_reported_and_cleared() {
        let coordinator = ComputationCoordinator::new(Duration::from_secs(30));
        let computation = coordinator
            .join_or_start("k", |guard| {
                async move {
                    let _guard = guard;
                    let blew_up = true;
                    if blew_up {
                        panic!("factory blew up");
                    }
                    Ok(json!(0))
                }
                .boxed()
            })
            .into_computation();

        assert!(matches!(computation.await, Err(CacheError::Factory(_))));
        assert!(!coordinator.is_pending("k"));
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_cancel() {
        let coordinator = ComputationCoordinator::new(Duration::from_secs(30));
        let finished = Arc::new(AtomicU32::new(0));
        let finished_clone = Arc::clone(&finished);

        let computation = coordinator
            .join_or_start("k", move |guard| {
                async move {
                    let _guard = guard;
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    finished_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(1))
                }
                .boxed()
            })
            .into_computation();
        drop(computation);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_pending("k"));
    }

    #[tokio::test]
    async fn test_stale_pending_is_not_joined() {
        let coordinator = ComputationCoordinator::new(Duration::from_millis(10));
        let runs = Arc::new(AtomicU32::new(0));

        let first = coordinator.join_or_start("k", slow(json!(1), Arc::clone(&runs)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.join("k").is_none());

        let second = coordinator.join_or_start("k", slow(json!(2), Arc::clone(&runs)));
        assert!(second.started());

        let (a, b) = tokio::join!(first.into_computation(), second.into_computation());
        assert_eq!(a.ok(), Some(json!(1)));
        assert_eq!(b.ok(), Some(json!(2)));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_try_start_skips_when_pending() {
        let coordinator = ComputationCoordinator::new(Duration::from_secs(30));
        let runs = Arc::new(AtomicU32::new(0));

        let first = coordinator.try_start("k", slow(json!(1), Arc::clone(&runs)));
        let second = coordinator.try_start("k", slow(json!(2), Arc::clone(&runs)));
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(coordinator.join("k").is_none(), "readers do not wait on refreshes");
        if let Some(c) = first {
            let _ = c.await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
