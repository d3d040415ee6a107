// src/cache/mod.rs
//! Two-tier read-through cache: memory (DashMap) in front of a file directory.
//!
//! A miss runs the caller's producer once per key no matter how many callers
//! ask concurrently; everybody awaits the same shared future. The durable
//! lookup is part of that shared future so it is also done once.
//!
//! The in-flight map only holds weak handles. When every waiter has given up
//! (a collector timeout) the fetch is dropped with them, and the next caller
//! starts a fresh one.

pub mod durable;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use metrics::{counter, gauge};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::error::CollectError;

use self::durable::{DurableEntry, DurableStore, ReadOutcome};

type CacheValue = Arc<Vec<u8>>;
type FetchFuture = BoxFuture<'static, Result<CacheValue, CollectError>>;
type SharedFetch = Shared<FetchFuture>;

/// Which TTL a collector's results live under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlClass {
    /// Live charts and keyword lists (`cache.memory_ttl`).
    Realtime,
    /// Slow-moving analysis results (`cache.file_ttl`).
    Analytical,
}

#[derive(Debug, Clone)]
struct MemEntry {
    value: CacheValue,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    /// False when the durable write failed; `shutdown` retries those.
    durable: bool,
}

/// Counts from one `sweep`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub memory_expired: usize,
    pub durable_expired: usize,
    pub durable_corrupt: usize,
}

struct Inner {
    cfg: CacheConfig,
    memory: DashMap<String, MemEntry>,
    inflight: DashMap<String, WeakShared<FetchFuture>>,
    durable: Option<DurableStore>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share the same tiers.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(3650))
}

impl Cache {
    /// Create the cache directory and drop expired/corrupt files found there.
    /// If the directory is unusable the cache runs memory-only.
    pub async fn open(cfg: CacheConfig) -> Self {
        crate::metrics::ensure_metrics_described();
        let durable = match DurableStore::open(&cfg.dir).await {
            Ok(store) => {
                match store.sweep(Utc::now()).await {
                    Ok(s) if s.expired + s.corrupt > 0 => tracing::info!(
                        target: "cache",
                        dir = %cfg.dir.display(),
                        expired = s.expired,
                        corrupt = s.corrupt,
                        "dropped stale cache files on open"
                    ),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(target: "cache", error = %e, "initial durable scan failed")
                    }
                }
                Some(store)
            }
            Err(e) => {
                tracing::warn!(
                    target: "cache",
                    dir = %cfg.dir.display(),
                    error = %e,
                    "durable tier unavailable; running memory-only"
                );
                counter!("cache_durable_errors_total").increment(1);
                None
            }
        };
        Self::with_store(cfg, durable)
    }

    /// Memory tier only (nothing touches the filesystem).
    pub fn memory_only(cfg: CacheConfig) -> Self {
        Self::with_store(cfg, None)
    }

    fn with_store(cfg: CacheConfig, durable: Option<DurableStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                memory: DashMap::new(),
                inflight: DashMap::new(),
                durable,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn ttl_for(&self, class: TtlClass) -> Duration {
        match class {
            TtlClass::Realtime => self.inner.cfg.memory_ttl(),
            TtlClass::Analytical => self.inner.cfg.file_ttl(),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.inner.durable.is_some()
    }

    /// Where the durable copy of `key` lives (if the durable tier is enabled).
    pub fn durable_path(&self, key: &str) -> Option<PathBuf> {
        self.inner.durable.as_ref().map(|d| d.path_for(key))
    }

    pub fn memory_len(&self) -> usize {
        self.inner.memory.len()
    }

    /// Memory → durable → `producer`. Producer errors are shared with every
    /// concurrent waiter but never cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<CacheValue, CollectError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Vec<u8>, CollectError>> + Send + 'static,
    {
        if let Some(v) = self.inner.memory_get(key, Utc::now()) {
            counter!("cache_hits_total", "tier" => "memory").increment(1);
            return Ok(v);
        }

        let shared = match self.inner.inflight.entry(key.to_string()) {
            Entry::Occupied(mut o) => match o.get().upgrade() {
                Some(live) => {
                    counter!("cache_inflight_joins_total").increment(1);
                    live
                }
                None => {
                    // Abandoned by all of its waiters; it no longer runs.
                    counter!("cache_inflight_abandoned_total").increment(1);
                    let fut = self.inner.clone().start_fetch(key, ttl, producer);
                    if let Some(weak) = fut.downgrade() {
                        o.insert(weak);
                    }
                    fut
                }
            },
            Entry::Vacant(slot) => {
                // A fetch may have completed between the first check and taking the slot.
                if let Some(v) = self.inner.memory_get(key, Utc::now()) {
                    counter!("cache_hits_total", "tier" => "memory").increment(1);
                    return Ok(v);
                }
                let fut = self.inner.clone().start_fetch(key, ttl, producer);
                if let Some(weak) = fut.downgrade() {
                    slot.insert(weak);
                }
                fut
            }
        };
        shared.await
    }

    /// Typed wrapper over `get_or_fetch` storing values as JSON.
    ///
    /// A stored value that no longer decodes is evicted from both tiers and
    /// the producer runs again; only a second decode failure is an error.
    pub async fn get_or_fetch_json<T, F, Fut>(
        &self,
        source_id: &str,
        key: &str,
        ttl: Duration,
        producer: F,
    ) -> Result<T, CollectError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, CollectError>> + Send + 'static,
    {
        let producer = Arc::new(producer);
        let mut evicted = false;
        loop {
            let produce = producer.clone();
            let owner = source_id.to_string();
            let bytes = self
                .get_or_fetch(key, ttl, move || async move {
                    let value = produce().await?;
                    serde_json::to_vec(&value).map_err(|e| CollectError::parse(owner, e))
                })
                .await?;

            match serde_json::from_slice(&bytes) {
                Ok(v) => return Ok(v),
                Err(e) if !evicted => {
                    tracing::warn!(target: "cache", key, error = %e, kind = "cache_corruption", "cached value does not decode; evicting and refetching");
                    counter!("cache_corrupt_total").increment(1);
                    self.invalidate(key).await;
                    evicted = true;
                }
                Err(e) => {
                    return Err(CollectError::parse(
                        source_id,
                        format!("fetched value unreadable: {e}"),
                    ))
                }
            }
        }
    }

    /// Drop `key` from both tiers.
    pub async fn invalidate(&self, key: &str) {
        self.inner.memory.remove(key);
        if let Some(store) = &self.inner.durable {
            if let Err(e) = store.remove(key).await {
                tracing::warn!(target: "cache", key, error = %e, "durable remove failed");
                counter!("cache_durable_errors_total").increment(1);
            }
        }
    }

    /// Evict expired entries from both tiers (and corrupt durable files).
    pub async fn sweep(&self) -> SweepStats {
        self.inner.sweep(Utc::now()).await
    }

    /// Spawn the periodic sweep loop (`cache.cleanup_interval`). Idempotent.
    pub fn start_sweeper(&self) {
        let mut guard = match self.inner.sweeper.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let inner = self.inner.clone();
        let every = self.inner.cfg.cleanup_interval();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                let s = inner.sweep(Utc::now()).await;
                tracing::debug!(
                    target: "cache",
                    memory = s.memory_expired,
                    durable = s.durable_expired,
                    corrupt = s.durable_corrupt,
                    "cache sweep"
                );
            }
        }));
    }

    pub fn sweeper_running(&self) -> bool {
        match self.inner.sweeper.lock() {
            Ok(g) => g.as_ref().is_some_and(|h| !h.is_finished()),
            Err(poison) => poison.into_inner().as_ref().is_some_and(|h| !h.is_finished()),
        }
    }

    /// Stop the sweeper and persist live memory entries whose durable write
    /// failed earlier. Returns how many were flushed.
    pub async fn shutdown(&self) -> usize {
        let handle = match self.inner.sweeper.lock() {
            Ok(mut g) => g.take(),
            Err(poison) => poison.into_inner().take(),
        };
        if let Some(h) = handle {
            h.abort();
        }

        let Some(store) = &self.inner.durable else {
            return 0;
        };
        let now = Utc::now();
        let pending: Vec<(String, MemEntry)> = self
            .inner
            .memory
            .iter()
            .filter(|e| !e.durable && e.expires_at > now)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut flushed = 0;
        for (key, entry) in pending {
            let de = DurableEntry {
                key: key.clone(),
                created_at: entry.created_at,
                expires_at: entry.expires_at,
                value: entry.value.as_ref().clone(),
            };
            match store.write(&de).await {
                Ok(()) => {
                    if let Some(mut m) = self.inner.memory.get_mut(&key) {
                        m.durable = true;
                    }
                    flushed += 1;
                }
                Err(e) => {
                    tracing::warn!(target: "cache", key, error = %e, "flush on shutdown failed");
                    counter!("cache_durable_errors_total").increment(1);
                }
            }
        }
        tracing::info!(target: "cache", flushed, "cache shut down");
        flushed
    }
}

impl Inner {
    /// The shared fetch for `key`; it clears its own in-flight slot when done.
    fn start_fetch<F, Fut>(self: Arc<Self>, key: &str, ttl: Duration, producer: F) -> SharedFetch
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Vec<u8>, CollectError>> + Send + 'static,
    {
        let owned_key = key.to_string();
        async move {
            let res = self.resolve(&owned_key, ttl, producer).await;
            self.inflight.remove(&owned_key);
            res
        }
        .boxed()
        .shared()
    }

    fn memory_get(&self, key: &str, now: DateTime<Utc>) -> Option<CacheValue> {
        {
            let entry = self.memory.get(key)?;
            if entry.expires_at > now {
                return Some(entry.value.clone());
            }
        }
        self.memory.remove_if(key, |_, e| e.expires_at <= now);
        None
    }

    async fn resolve<F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<CacheValue, CollectError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>, CollectError>>,
    {
        if let Some(store) = &self.durable {
            let now = Utc::now();
            match store.read(key, now).await {
                Ok(ReadOutcome::Hit(entry)) => {
                    let cap = now + chrono_ttl(self.cfg.memory_ttl());
                    let value = Arc::new(entry.value);
                    self.memory.insert(
                        key.to_string(),
                        MemEntry {
                            value: value.clone(),
                            created_at: entry.created_at,
                            expires_at: entry.expires_at.min(cap),
                            durable: true,
                        },
                    );
                    gauge!("cache_memory_entries").set(self.memory.len() as f64);
                    counter!("cache_hits_total", "tier" => "durable").increment(1);
                    return Ok(value);
                }
                Ok(ReadOutcome::Corrupt(reason)) => {
                    tracing::warn!(target: "cache", key, %reason, kind = "cache_corruption", "corrupt durable entry evicted");
                    counter!("cache_corrupt_total").increment(1);
                }
                Ok(ReadOutcome::Miss | ReadOutcome::Expired) => {}
                Err(e) => {
                    tracing::warn!(target: "cache", key, error = %e, "durable read failed");
                    counter!("cache_durable_errors_total").increment(1);
                }
            }
        }

        counter!("cache_misses_total").increment(1);
        let value = Arc::new(producer().await?);
        let created_at = Utc::now();
        let expires_at = created_at + chrono_ttl(ttl);

        self.memory.insert(
            key.to_string(),
            MemEntry {
                value: value.clone(),
                created_at,
                expires_at,
                durable: false,
            },
        );
        gauge!("cache_memory_entries").set(self.memory.len() as f64);

        if let Some(store) = &self.durable {
            let entry = DurableEntry {
                key: key.to_string(),
                created_at,
                expires_at,
                value: value.as_ref().clone(),
            };
            match store.write(&entry).await {
                Ok(()) => {
                    if let Some(mut m) = self.memory.get_mut(key) {
                        m.durable = true;
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "cache", key, error = %e, "durable write failed; kept in memory only");
                    counter!("cache_durable_errors_total").increment(1);
                }
            }
        }
        Ok(value)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> SweepStats {
        let before = self.memory.len();
        self.memory.retain(|_, e| e.expires_at > now);
        let mut stats = SweepStats {
            memory_expired: before.saturating_sub(self.memory.len()),
            ..SweepStats::default()
        };
        gauge!("cache_memory_entries").set(self.memory.len() as f64);

        if let Some(store) = &self.durable {
            match store.sweep(now).await {
                Ok(d) => {
                    stats.durable_expired = d.expired;
                    stats.durable_corrupt = d.corrupt;
                }
                Err(e) => {
                    tracing::warn!(target: "cache", error = %e, "durable sweep failed");
                    counter!("cache_durable_errors_total").increment(1);
                }
            }
        }
        let evicted = stats.memory_expired + stats.durable_expired + stats.durable_corrupt;
        counter!("cache_evictions_total").increment(evicted as u64);
        stats
    }
}
