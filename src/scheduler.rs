// src/scheduler.rs
//! Cycle driver: fan out to collectors, combine, publish, sleep, repeat.
//!
//! The sleep after a cycle is `interval - elapsed` so cycle starts stay on a
//! fixed cadence. A refresh request wakes the driver early; one that arrives
//! mid-cycle starts the next cycle as soon as the current one is published.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::cache::Cache;
use crate::collect::{collect_source, CollectOutcome, RegisteredSource};
use crate::combine::{combine, CombineOptions};
use crate::config::AppConfig;
use crate::error::{CollectError, ErrorKind};
use crate::publish::{PublishError, Publisher};
use crate::types::{CollectionError, CycleResult, SourceBatch, SourceId, SourceReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running(u64),
    Publishing(u64),
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// 0 = run until shut down.
    pub runs: u64,
    pub cycle_timeout: Duration,
    pub max_concurrency: usize,
    pub combine: CombineOptions,
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(c: &AppConfig) -> Self {
        Self {
            interval: c.update_interval(),
            runs: c.runs,
            cycle_timeout: c.cycle_timeout(),
            max_concurrency: c.max_concurrency,
            combine: (&c.combine).into(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

/// Shared state of the driver; also usable directly for one-shot runs.
pub struct Engine {
    sources: Vec<RegisteredSource>,
    cache: Cache,
    publisher: Arc<Publisher>,
    cfg: SchedulerConfig,
    /// Sources rejected with an auth error, with the error that locked them out.
    locked_out: Mutex<BTreeMap<SourceId, CollectionError>>,
    next_cycle_id: AtomicU64,
    /// Serializes cycles so ids are published in order.
    cycle_lock: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<SchedulerState>,
}

struct TaskOutput {
    idx: usize,
    result: Result<Result<CollectOutcome, CollectError>, tokio::time::error::Elapsed>,
    elapsed: Duration,
}

impl Engine {
    pub fn new(
        sources: Vec<RegisteredSource>,
        cache: Cache,
        publisher: Arc<Publisher>,
        cfg: SchedulerConfig,
    ) -> Self {
        crate::metrics::ensure_metrics_described();
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Self {
            sources,
            cache,
            publisher,
            cfg,
            locked_out: Mutex::new(BTreeMap::new()),
            next_cycle_id: AtomicU64::new(1),
            cycle_lock: tokio::sync::Mutex::new(()),
            state_tx,
        }
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, s: SchedulerState) {
        self.state_tx.send_replace(s);
    }

    pub fn locked_out(&self) -> Vec<SourceId> {
        lock(&self.locked_out).keys().cloned().collect()
    }

    /// Lift an auth lockout (e.g. after the credential was fixed).
    pub fn reenable(&self, id: &SourceId) -> bool {
        let removed = lock(&self.locked_out).remove(id).is_some();
        if removed {
            tracing::info!(target: "scheduler", source = %id, "source re-enabled");
        }
        removed
    }

    /// Run one full cycle and publish it.
    pub async fn run_cycle_once(&self) -> Result<Arc<CycleResult>, PublishError> {
        let _guard = self.cycle_lock.lock().await;
        let cycle_id = self.next_cycle_id.fetch_add(1, Ordering::SeqCst);

        self.set_state(SchedulerState::Running(cycle_id));
        let result = self.collect_cycle(cycle_id).await;

        self.set_state(SchedulerState::Publishing(cycle_id));
        let published = self.publisher.publish(result).await;
        self.set_state(SchedulerState::Idle);
        published
    }

    async fn collect_cycle(&self, cycle_id: u64) -> CycleResult {
        let started_at = Utc::now();
        let t0 = Instant::now();
        let locked: BTreeMap<SourceId, CollectionError> = lock(&self.locked_out).clone();

        let sem = Arc::new(Semaphore::new(self.cfg.max_concurrency.max(1)));
        let mut set: JoinSet<TaskOutput> = JoinSet::new();
        let mut spawned: Vec<usize> = Vec::new();
        let mut errors: Vec<(usize, CollectionError)> = Vec::new();
        let mut degraded: BTreeSet<SourceId> = BTreeSet::new();

        for (idx, src) in self.sources.iter().enumerate() {
            if let Some(err) = locked.get(src.id()) {
                degraded.insert(src.id().clone());
                errors.push((idx, err.clone()));
                continue;
            }
            let src = src.clone();
            let cache = self.cache.clone();
            let sem = sem.clone();
            let budget = self.cfg.cycle_timeout;
            set.spawn(async move {
                // The semaphore is never closed.
                let _permit = sem.acquire_owned().await.ok();
                let started = Instant::now();
                let result = tokio::time::timeout(budget, collect_source(&src, &cache)).await;
                TaskOutput {
                    idx,
                    result,
                    elapsed: started.elapsed(),
                }
            });
            spawned.push(idx);
        }

        let mut outputs: Vec<TaskOutput> = Vec::with_capacity(spawned.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(out) => outputs.push(out),
                Err(e) => tracing::error!(target: "scheduler", error = %e, "collector task died"),
            }
        }
        for idx in spawned {
            if outputs.iter().any(|o| o.idx == idx) {
                continue;
            }
            let id = self.sources[idx].id().clone();
            degraded.insert(id.clone());
            errors.push((
                idx,
                CollectionError {
                    source: id,
                    kind: ErrorKind::SourceUnavailable,
                    message: "collector task failed".to_string(),
                },
            ));
        }
        // Completion order must not leak into the result.
        outputs.sort_by_key(|o| o.idx);

        let mut batches = Vec::new();
        let mut reports = Vec::new();
        for out in outputs {
            let src = &self.sources[out.idx];
            let id = src.id().clone();
            let elapsed_ms = out.elapsed.as_millis() as u64;
            match out.result {
                Ok(Ok(outcome)) => {
                    reports.push(SourceReport {
                        source: id.clone(),
                        items: outcome.items.len(),
                        dropped: outcome.dropped,
                        elapsed_ms,
                        ok: true,
                    });
                    batches.push(
                        SourceBatch::new(id, outcome.items)
                            .with_basis(src.collector.score_basis()),
                    );
                }
                Ok(Err(e)) => {
                    let ce = CollectionError::from_collect(id.clone(), &e);
                    if e.is_auth() {
                        tracing::warn!(target: "scheduler", source = %id, error = %e, "auth failure; source locked out until re-enabled");
                        lock(&self.locked_out).insert(id.clone(), ce.clone());
                    }
                    reports.push(SourceReport {
                        source: id.clone(),
                        items: 0,
                        dropped: 0,
                        elapsed_ms,
                        ok: false,
                    });
                    degraded.insert(id);
                    errors.push((out.idx, ce));
                }
                Err(_) => {
                    tracing::warn!(target: "scheduler", source = %id, budget_ms = self.cfg.cycle_timeout.as_millis() as u64, "collector timed out");
                    reports.push(SourceReport {
                        source: id.clone(),
                        items: 0,
                        dropped: 0,
                        elapsed_ms,
                        ok: false,
                    });
                    degraded.insert(id.clone());
                    errors.push((
                        out.idx,
                        CollectionError::timeout(id, self.cfg.cycle_timeout.as_millis()),
                    ));
                }
            }
        }
        errors.sort_by_key(|(idx, _)| *idx);

        let combined = combine(&batches, &self.cfg.combine);
        let finished_at = Utc::now();
        let elapsed = t0.elapsed();

        counter!("scheduler_cycles_total").increment(1);
        histogram!("scheduler_cycle_ms").record(elapsed.as_secs_f64() * 1_000.0);
        gauge!("scheduler_degraded_sources").set(degraded.len() as f64);
        gauge!("scheduler_last_cycle_ts").set(finished_at.timestamp() as f64);
        gauge!("combine_keywords").set(combined.len() as f64);
        tracing::info!(
            target: "scheduler",
            cycle_id,
            sources = self.sources.len(),
            ok = batches.len(),
            degraded = degraded.len(),
            keywords = combined.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "cycle complete"
        );

        CycleResult {
            cycle_id,
            started_at,
            finished_at,
            combined,
            degraded_sources: degraded,
            errors: errors.into_iter().map(|(_, e)| e).collect(),
            batches,
            reports,
        }
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
}

impl Scheduler {
    pub fn new(
        sources: Vec<RegisteredSource>,
        cache: Cache,
        publisher: Arc<Publisher>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            engine: Arc::new(Engine::new(sources, cache, publisher, cfg)),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Start the periodic driver.
    pub fn spawn(self) -> SchedulerHandle {
        let refresh = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = self.engine.clone();
        let state = engine.watch_state();
        let join = tokio::spawn(drive(engine, refresh.clone(), shutdown_rx));
        SchedulerHandle {
            engine: self.engine,
            refresh,
            shutdown: shutdown_tx,
            state,
            join,
        }
    }
}

async fn drive(engine: Arc<Engine>, refresh: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
    let runs = engine.cfg.runs;
    let interval = engine.cfg.interval;
    let mut completed = 0u64;
    tracing::info!(
        target: "scheduler",
        interval_s = interval.as_secs_f64(),
        runs,
        sources = engine.sources.len(),
        "scheduler started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }
        let t0 = Instant::now();
        if let Err(e) = engine.run_cycle_once().await {
            tracing::error!(target: "scheduler", error = %e, "publish failed");
        }
        completed += 1;
        if runs > 0 && completed >= runs {
            tracing::info!(target: "scheduler", completed, "run limit reached");
            break;
        }

        let wait = interval.saturating_sub(t0.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = refresh.notified() => {
                tracing::info!(target: "scheduler", "manual refresh");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    engine.set_state(SchedulerState::Stopped);
    tracing::info!(target: "scheduler", completed, "scheduler stopped");
}

pub struct SchedulerHandle {
    engine: Arc<Engine>,
    refresh: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<SchedulerState>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Start the next cycle now (or right after the running one).
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        self.engine.publisher()
    }

    pub fn reenable(&self, id: &SourceId) -> bool {
        self.engine.reenable(id)
    }

    /// Ask the driver to stop after the current cycle and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(target: "scheduler", error = %e, "scheduler task ended abnormally");
        }
    }

    /// Wait for the driver to stop on its own (run limit).
    pub async fn wait(self) {
        if let Err(e) = self.join.await {
            tracing::error!(target: "scheduler", error = %e, "scheduler task ended abnormally");
        }
    }
}
