//! Refresh coordinator (C8): owns the only path that writes to the memory
//! store and the disk snapshot. Concurrent callers of [`RefreshCoordinator::refresh_all`]
//! collapse onto a single in-flight upstream call rather than stampeding it,
//! modeled on the single-flight pattern common to cache-fronting clients —
//! the teacher's own `cache::service::CacheService` serializes writers
//! through one lock for the same reason, this just adds waiter fan-in so a
//! burst of webhook events doesn't trigger a burst of full refreshes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{info, instrument, warn};

use crate::cache::MemoryStore;
use crate::circuit::CircuitBreaker;
use crate::error::{FlagrError, Result};
use crate::model::Flag;
use crate::snapshot::DiskSnapshot;
use crate::upstream::Upstream;

enum RefreshState {
    Idle,
    InFlight(Arc<Notify>),
}

/// A change signaled by the upstream out-of-band, via webhook or an
/// operator-triggered admin call. Carries flag keys rather than ids since
/// that's what callers and the wire payload both use.
#[derive(Debug, Clone)]
pub enum InvalidationEvent {
    FlagsUpdated(Vec<String>),
    FlagsDeleted(Vec<String>),
}

/// Refresh health, surfaced through [`crate::ClientStats`] per §4.6/§7:
/// `last_refresh` tracks recency, `consecutive_fails` is what a host polls
/// to decide whether the cached flag set is going stale.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RefreshStats {
    pub last_refresh_unix_secs: Option<u64>,
    pub consecutive_fails: u32,
    pub total_refreshes: u64,
    pub total_failures: u64,
}

pub struct RefreshCoordinator {
    upstream: Arc<dyn Upstream>,
    store: Arc<MemoryStore>,
    circuit: Arc<CircuitBreaker>,
    snapshot: Option<Arc<DiskSnapshot>>,
    state: Mutex<RefreshState>,
    key_index: RwLock<HashMap<String, i64>>,
    stats: Mutex<RefreshStats>,
}

impl RefreshCoordinator {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: Arc<MemoryStore>,
        circuit: Arc<CircuitBreaker>,
        snapshot: Option<Arc<DiskSnapshot>>,
    ) -> Self {
        Self {
            upstream,
            store,
            circuit,
            snapshot,
            state: Mutex::new(RefreshState::Idle),
            key_index: RwLock::new(HashMap::new()),
            stats: Mutex::new(RefreshStats::default()),
        }
    }

    pub async fn stats(&self) -> RefreshStats {
        self.stats.lock().await.clone()
    }

    async fn record_refresh_outcome(&self, result: &Result<()>) {
        let mut stats = self.stats.lock().await;
        match result {
            Ok(()) => {
                stats.consecutive_fails = 0;
                stats.total_refreshes += 1;
                stats.last_refresh_unix_secs =
                    SystemTime::now().duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs());
            }
            Err(_) => {
                stats.consecutive_fails += 1;
                stats.total_failures += 1;
            }
        }
    }

    /// Populates the store from the disk snapshot (if any), then attempts a
    /// bounded synchronous refresh so `Client::new` returns with data that's
    /// at most `initial_timeout` stale. A refresh failure here is only fatal
    /// when the disk snapshot left the store empty too — with no seeded
    /// state and no live upstream, `Client::new` has nothing to serve and
    /// must fail rather than start silently empty.
    #[instrument(skip(self))]
    pub async fn initial_load(&self, initial_timeout: Duration) -> Result<()> {
        let mut seeded_from_disk = false;
        if let Some(snapshot) = &self.snapshot {
            let flags = snapshot.load().await?;
            seeded_from_disk = !flags.is_empty();
            let mut index = self.key_index.write().await;
            for (key, flag) in flags {
                index.insert(key.clone(), flag.id);
                self.store.set(key, flag).await;
            }
            info!(flags = index.len(), "seeded memory store from disk snapshot");
        }

        match tokio::time::timeout(initial_timeout, self.refresh_all()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                if seeded_from_disk {
                    warn!(error = %err, "initial refresh failed, continuing with disk snapshot state");
                    Ok(())
                } else {
                    Err(err)
                }
            }
            Err(_) => {
                if seeded_from_disk {
                    warn!("initial refresh did not complete within initial_timeout, continuing with disk snapshot state");
                    Ok(())
                } else {
                    Err(FlagrError::Config(
                        "initial refresh did not complete within initial_timeout and no disk snapshot is available".into(),
                    ))
                }
            }
        }
    }

    /// Fetches the complete flag set from upstream and replaces the memory
    /// store and disk snapshot wholesale. Single-flight: a caller that
    /// arrives while a refresh is already in progress waits for it instead
    /// of starting a second one, and returns once it observes completion.
    #[instrument(skip(self))]
    pub async fn refresh_all(&self) -> Result<()> {
        let waiter = {
            let mut state = self.state.lock().await;
            match &*state {
                RefreshState::InFlight(notify) => Some(notify.clone()),
                RefreshState::Idle => {
                    *state = RefreshState::InFlight(Arc::new(Notify::new()));
                    None
                }
            }
        };

        if let Some(notify) = waiter {
            notify.notified().await;
            return Ok(());
        }

        let result = self.do_refresh_all().await;
        self.record_refresh_outcome(&result).await;

        let mut state = self.state.lock().await;
        if let RefreshState::InFlight(notify) = std::mem::replace(&mut *state, RefreshState::Idle) {
            notify.notify_waiters();
        }
        result
    }

    async fn do_refresh_all(&self) -> Result<()> {
        let upstream = self.upstream.clone();
        let flags = self.circuit.call(|| async move { upstream.list_flags().await }).await?;

        let mut accepted = HashMap::with_capacity(flags.len());
        for flag in flags {
            if let Err(err) = flag.validate() {
                warn!(flag_key = %flag.key, error = %err, "dropping invalid flag from refresh");
                continue;
            }
            accepted.insert(flag.key.clone(), flag);
        }

        let stale_keys: Vec<String> = {
            let index = self.key_index.read().await;
            index
                .keys()
                .filter(|key| !accepted.contains_key(key.as_str()))
                .cloned()
                .collect()
        };
        for key in &stale_keys {
            self.store.delete(key).await;
        }

        let mut index = self.key_index.write().await;
        index.clear();
        for (key, flag) in &accepted {
            index.insert(key.clone(), flag.id);
            self.store.set(key.clone(), flag.clone()).await;
        }
        drop(index);

        info!(flags = accepted.len(), removed = stale_keys.len(), "completed full refresh");

        if let Some(snapshot) = &self.snapshot {
            snapshot.save(&accepted).await?;
        }
        Ok(())
    }

    /// Refetches a single flag by key when its id is known from a prior
    /// refresh, else falls back to a full refresh. Used for targeted
    /// `flag.updated` invalidation so one changed flag doesn't force a
    /// list-everything round trip.
    #[instrument(skip(self))]
    pub async fn invalidate_flag(&self, key: &str) -> Result<()> {
        let id = self.key_index.read().await.get(key).copied();
        let Some(id) = id else {
            return self.refresh_all().await;
        };

        let upstream = self.upstream.clone();
        let flag = self.circuit.call(|| async move { upstream.get_flag(id).await }).await?;
        flag.validate()?;

        self.store.set(key.to_string(), flag).await;
        if let Some(snapshot) = &self.snapshot {
            snapshot.save(&self.store.snapshot_all().await).await?;
        }
        Ok(())
    }

    /// Removes a flag the upstream reports deleted. Idempotent: deleting an
    /// already-absent key is not an error.
    #[instrument(skip(self))]
    pub async fn invalidate_deleted(&self, key: &str) -> Result<()> {
        self.store.delete(key).await;
        self.key_index.write().await.remove(key);
        if let Some(snapshot) = &self.snapshot {
            snapshot.save(&self.store.snapshot_all().await).await?;
        }
        Ok(())
    }

    /// Drops the entire cache and repopulates it from upstream.
    #[instrument(skip(self))]
    pub async fn invalidate_all(&self) -> Result<()> {
        self.store.clear().await;
        self.key_index.write().await.clear();
        self.refresh_all().await
    }

    /// Applies a webhook- or admin-sourced event. `flag.updated` refetches
    /// just the named keys; `flag.deleted` removes them outright.
    #[instrument(skip(self, event))]
    pub async fn apply_event(&self, event: InvalidationEvent) -> Result<()> {
        match event {
            InvalidationEvent::FlagsUpdated(keys) => {
                for key in keys {
                    self.invalidate_flag(&key).await?;
                }
            }
            InvalidationEvent::FlagsDeleted(keys) => {
                for key in keys {
                    self.invalidate_deleted(&key).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn snapshot_flags(&self) -> HashMap<String, Flag> {
        self.store.snapshot_all().await
    }

    /// Best-effort final persistence on shutdown: writes whatever is
    /// currently in the memory store to disk, swallowing failures since
    /// there's no caller left to meaningfully react to them.
    #[instrument(skip(self))]
    pub async fn save_on_shutdown(&self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let flags = self.store.snapshot_all().await;
        if let Err(err) = snapshot.save(&flags).await {
            warn!(error = %err, "best-effort final disk save on shutdown failed");
        }
    }

    /// Runs the periodic background refresh until `shutdown` is signaled.
    /// A failed tick is logged and retried at the next interval — the
    /// circuit breaker already governs how aggressively it hits a degraded
    /// upstream.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh_all().await {
                        let consecutive_fails = self.stats().await.consecutive_fails;
                        warn!(error = %err, consecutive_fails, "periodic refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stopping periodic refresh");
                        return;
                    }
                }
            }
        }
    }
}
