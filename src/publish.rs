// src/publish.rs
//! Publisher boundary: latest snapshot, bounded history, keyword drill-down
//! and change notification.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::combine::normalize_keyword;
use crate::types::{CombinedTrend, CycleResult, RawTrendItem};

const BROADCAST_CAPACITY: usize = 16;

/// Called once per accepted cycle, in cycle order.
#[async_trait]
pub trait CycleSink: Send + Sync {
    async fn on_cycle(&self, result: Arc<CycleResult>) -> anyhow::Result<()>;
    fn name(&self) -> &'static str;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("cycle {got} arrived after cycle {latest}")]
    OutOfOrder { latest: u64, got: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordDetail {
    pub trend: CombinedTrend,
    /// Raw items from every source that matched the keyword, by (source, rank).
    pub items: Vec<RawTrendItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub cycle_id: u64,
    pub finished_at: DateTime<Utc>,
    pub total_score: f64,
    pub rank: u32,
}

pub struct Publisher {
    latest: RwLock<Option<Arc<CycleResult>>>,
    history: Mutex<VecDeque<Arc<CycleResult>>>,
    cap: usize,
    tx: broadcast::Sender<Arc<CycleResult>>,
    sinks: RwLock<Vec<Arc<dyn CycleSink>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

impl Publisher {
    pub fn new(history_capacity: usize) -> Self {
        let cap = history_capacity.clamp(1, 10_000);
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            latest: RwLock::new(None),
            history: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
            tx,
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn CycleSink>) {
        match self.sinks.write() {
            Ok(mut g) => g.push(sink),
            Err(poison) => poison.into_inner().push(sink),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CycleResult>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<CycleResult>> {
        match self.latest.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    /// Retained cycles, oldest first.
    pub fn history(&self) -> Vec<Arc<CycleResult>> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Accept a finished cycle. Results must arrive with increasing ids.
    pub async fn publish(&self, result: CycleResult) -> Result<Arc<CycleResult>, PublishError> {
        let result = Arc::new(result);
        {
            let mut latest = match self.latest.write() {
                Ok(g) => g,
                Err(poison) => poison.into_inner(),
            };
            if let Some(prev) = latest.as_ref() {
                if result.cycle_id <= prev.cycle_id {
                    counter!("publish_rejected_total").increment(1);
                    tracing::warn!(
                        target: "publish",
                        latest = prev.cycle_id,
                        got = result.cycle_id,
                        "rejecting out-of-order cycle"
                    );
                    return Err(PublishError::OutOfOrder {
                        latest: prev.cycle_id,
                        got: result.cycle_id,
                    });
                }
            }
            *latest = Some(result.clone());

            let mut hist = lock(&self.history);
            hist.push_back(result.clone());
            while hist.len() > self.cap {
                hist.pop_front();
            }
        }

        counter!("publish_cycles_total").increment(1);
        tracing::info!(
            target: "publish",
            cycle_id = result.cycle_id,
            keywords = result.combined.len(),
            degraded = result.degraded_sources.len(),
            "cycle published"
        );

        // No subscribers is fine.
        let _ = self.tx.send(result.clone());

        let sinks: Vec<Arc<dyn CycleSink>> = match self.sinks.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        };
        for sink in sinks {
            if let Err(e) = sink.on_cycle(result.clone()).await {
                tracing::warn!(target: "publish", sink = sink.name(), error = ?e, "sink failed");
                counter!("notify_errors_total").increment(1);
            }
        }
        Ok(result)
    }

    /// Combined entry plus contributing raw items from the latest cycle.
    pub fn keyword_detail(&self, keyword: &str) -> Option<KeywordDetail> {
        let latest = self.latest()?;
        let norm = normalize_keyword(keyword);
        let trend = latest.trend(&norm)?.clone();

        let mut items: Vec<RawTrendItem> = latest
            .batches
            .iter()
            .flat_map(|b| b.items.iter())
            .filter(|i| normalize_keyword(&i.keyword) == norm)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.source.cmp(&b.source).then(a.rank.cmp(&b.rank)));
        Some(KeywordDetail { trend, items })
    }

    /// Score and rank of `keyword` in every retained cycle where it appeared.
    pub fn keyword_history(&self, keyword: &str) -> Vec<HistoryPoint> {
        let norm = normalize_keyword(keyword);
        lock(&self.history)
            .iter()
            .filter_map(|c| {
                c.trend(&norm).map(|t| HistoryPoint {
                    cycle_id: c.cycle_id,
                    finished_at: c.finished_at,
                    total_score: t.total_score,
                    rank: t.rank,
                })
            })
            .collect()
    }
}
