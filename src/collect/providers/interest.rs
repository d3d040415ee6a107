// src/collect/providers/interest.rs
//! Interest-over-time analysis for a fixed keyword set.
//!
//! The endpoint returns a timeline of samples, one value per keyword per
//! sample. Some services prefix the JSON with `)]}'` to defeat script
//! inclusion; that first line is skipped.

use async_trait::async_trait;
use serde::Deserialize;

use crate::cache::TtlClass;
use crate::collect::{CollectOutcome, TrendCollector};
use crate::config::SourceParams;
use crate::error::CollectError;
use crate::fetch::{FetchRequest, Fetcher};
use crate::types::{RawTrendItem, ScoreBasis, SourceId};

pub const DEFAULT_WINDOW: &str = "now 1-d";
pub const DEFAULT_GEO: &str = "KR";

#[derive(Debug, Deserialize)]
struct Envelope {
    default: Timeline,
}

#[derive(Debug, Deserialize)]
struct Timeline {
    #[serde(rename = "timelineData", default)]
    timeline_data: Vec<Sample>,
}

#[derive(Debug, Deserialize)]
struct Sample {
    #[serde(default)]
    value: Vec<serde_json::Value>,
}

fn strip_guard(body: &str) -> &str {
    let t = body.trim_start();
    if t.starts_with(")]}'") {
        t.split_once('\n').map(|(_, rest)| rest).unwrap_or("")
    } else {
        t
    }
}

/// Per-keyword mean interest, ranked descending (ties by keyword).
pub fn parse_interest(
    id: &SourceId,
    body: &str,
    keywords: &[String],
    window: &str,
) -> Result<CollectOutcome, CollectError> {
    let env: Envelope = serde_json::from_str(strip_guard(body))
        .map_err(|e| CollectError::parse(id.as_str(), e))?;

    let mut sums = vec![0.0f64; keywords.len()];
    let mut peaks = vec![0.0f64; keywords.len()];
    let mut counts = vec![0usize; keywords.len()];
    for sample in &env.default.timeline_data {
        for (i, v) in sample.value.iter().enumerate().take(keywords.len()) {
            if let Some(x) = super::json_number(v) {
                sums[i] += x;
                peaks[i] = peaks[i].max(x);
                counts[i] += 1;
            }
        }
    }

    let mut out = CollectOutcome::default();
    let mut scored: Vec<(String, f64, f64, usize)> = Vec::with_capacity(keywords.len());
    for (i, kw) in keywords.iter().enumerate() {
        if counts[i] == 0 {
            out.dropped += 1;
            continue;
        }
        scored.push((kw.clone(), sums[i] / counts[i] as f64, peaks[i], counts[i]));
    }
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    for (pos, (kw, mean, peak, samples)) in scored.into_iter().enumerate() {
        let mean = (mean * 100.0).round() / 100.0;
        out.items.push(
            RawTrendItem::new(id.clone(), kw, (pos + 1) as u32)
                .with_score(mean)
                .with_meta("peak", peak)
                .with_meta("samples", samples as u64)
                .with_meta("window", window),
        );
    }
    Ok(out)
}

pub struct InterestCollector {
    id: SourceId,
    fetcher: Fetcher,
    url: String,
}

impl InterestCollector {
    pub fn new(id: SourceId, fetcher: Fetcher, url: String) -> Self {
        Self { id, fetcher, url }
    }
}

#[async_trait]
impl TrendCollector for InterestCollector {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "interest"
    }

    fn ttl_class(&self) -> TtlClass {
        TtlClass::Analytical
    }

    fn score_basis(&self) -> ScoreBasis {
        ScoreBasis::Interest
    }

    async fn fetch_raw(&self, params: &SourceParams) -> Result<CollectOutcome, CollectError> {
        if params.keywords.is_empty() {
            return Err(CollectError::config(self.id.as_str(), "no keywords configured"));
        }
        let window = params.time_window.as_deref().unwrap_or(DEFAULT_WINDOW);
        let geo = params.region.as_deref().unwrap_or(DEFAULT_GEO);
        let mut req = FetchRequest::get(&self.url)
            .query("q", params.keywords.join(","))
            .query("geo", geo)
            .query("time", window);
        if let Some(cat) = &params.category {
            req = req.query("cat", cat.clone());
        }
        let resp = self.fetcher.fetch(&req).await?;
        Ok(parse_interest(&self.id, &resp.text(), &params.keywords, window)?.capped(params.max_items))
    }
}
