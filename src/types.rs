// src/types.rs
//! Data model shared by collectors, the combiner, the scheduler and the publisher.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CollectError, ErrorKind};

/// Stable identifier of one configured source (e.g. "youtube", "naver_news").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One item as reported by one source in one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrendItem {
    pub source: SourceId,
    pub keyword: String,
    /// 1-based position in the source's own list.
    pub rank: u32,
    pub raw_score: Option<f64>,
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub collected_at: DateTime<Utc>,
}

impl RawTrendItem {
    pub fn new(source: SourceId, keyword: impl Into<String>, rank: u32) -> Self {
        Self {
            source,
            keyword: keyword.into(),
            rank: rank.max(1),
            raw_score: None,
            url: None,
            metadata: BTreeMap::new(),
            collected_at: Utc::now(),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.raw_score = Some(score);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn collected_at(mut self, ts: DateTime<Utc>) -> Self {
        self.collected_at = ts;
        self
    }
}

/// How the combiner turns a source's items into comparable scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBasis {
    /// Position in the list: `100 * (1 - (rank-1)/max_rank)`.
    #[default]
    Rank,
    /// Relative interest value (0..100) carried in `raw_score`.
    Interest,
}

/// Everything one source contributed to one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBatch {
    pub source: SourceId,
    pub basis: ScoreBasis,
    pub items: Vec<RawTrendItem>,
}

impl SourceBatch {
    pub fn new(source: impl Into<SourceId>, items: Vec<RawTrendItem>) -> Self {
        Self {
            source: source.into(),
            basis: ScoreBasis::Rank,
            items,
        }
    }

    pub fn with_basis(mut self, basis: ScoreBasis) -> Self {
        self.basis = basis;
        self
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One keyword after cross-source merging and ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedTrend {
    pub normalized_keyword: String,
    /// Original spelling from the best-ranked contributing item.
    pub display_keyword: String,
    pub sources: BTreeSet<SourceId>,
    pub source_ranks: BTreeMap<SourceId, u32>,
    pub total_score: f64,
    pub rank: u32,
    pub sample_urls: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

/// A source failure recorded in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionError {
    pub source: SourceId,
    pub kind: ErrorKind,
    pub message: String,
}

impl CollectionError {
    pub fn from_collect(source: SourceId, err: &CollectError) -> Self {
        Self {
            source,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn timeout(source: SourceId, after_ms: u128) -> Self {
        Self {
            source,
            kind: ErrorKind::Timeout,
            message: format!("no result within {after_ms} ms"),
        }
    }
}

/// Per-source bookkeeping for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: SourceId,
    pub items: usize,
    /// Items dropped because they could not be parsed.
    pub dropped: usize,
    pub elapsed_ms: u64,
    pub ok: bool,
}

/// Immutable output of one scheduler cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub combined: Vec<CombinedTrend>,
    pub degraded_sources: BTreeSet<SourceId>,
    pub errors: Vec<CollectionError>,
    /// Raw items per source, kept for keyword detail views.
    pub batches: Vec<SourceBatch>,
    pub reports: Vec<SourceReport>,
}

impl CycleResult {
    pub fn trend(&self, normalized_keyword: &str) -> Option<&CombinedTrend> {
        self.combined
            .iter()
            .find(|t| t.normalized_keyword == normalized_keyword)
    }
}
