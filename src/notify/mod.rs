// src/notify/mod.rs
pub mod webhook;

use crate::types::CycleResult;

pub const DEFAULT_TOP_N: usize = 10;

/// Plain-text summary of a cycle's top keywords.
pub fn summarize(result: &CycleResult, top_n: usize) -> String {
    let mut out = format!(
        "Trending now (cycle {}, {} UTC)",
        result.cycle_id,
        result.finished_at.format("%Y-%m-%d %H:%M")
    );
    if result.combined.is_empty() {
        out.push_str("\n(no keyword reached consensus)");
    }
    for t in result.combined.iter().take(top_n) {
        let sources: Vec<&str> = t.sources.iter().map(|s| s.as_str()).collect();
        out.push_str(&format!(
            "\n{}. {} ({:.1}; {})",
            t.rank,
            t.display_keyword,
            t.total_score,
            sources.join(", ")
        ));
    }
    if !result.degraded_sources.is_empty() {
        let degraded: Vec<&str> = result.degraded_sources.iter().map(|s| s.as_str()).collect();
        out.push_str(&format!("\nDegraded: {}", degraded.join(", ")));
    }
    out
}

/// Suppresses a post when the top list is identical to the last one sent.
#[derive(Debug, Clone, Default)]
pub struct RepeatGate {
    last_sent: Option<Vec<String>>,
}

impl RepeatGate {
    fn fingerprint(result: &CycleResult, top_n: usize) -> Vec<String> {
        result
            .combined
            .iter()
            .take(top_n)
            .map(|t| t.normalized_keyword.clone())
            .collect()
    }

    /// Check only; does not record.
    pub fn should_send(&self, result: &CycleResult, top_n: usize) -> bool {
        match &self.last_sent {
            None => true,
            Some(prev) => *prev != Self::fingerprint(result, top_n),
        }
    }

    /// Record after a successful send.
    pub fn record(&mut self, result: &CycleResult, top_n: usize) {
        self.last_sent = Some(Self::fingerprint(result, top_n));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combine::{combine, CombineOptions};
    use crate::config::CombineMode;
    use crate::types::{RawTrendItem, SourceBatch, SourceId};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn result(id: u64, kws: &[&str]) -> CycleResult {
        let batch = SourceBatch::new(
            "portal",
            kws.iter()
                .enumerate()
                .map(|(i, k)| RawTrendItem::new(SourceId::from("portal"), *k, (i + 1) as u32))
                .collect(),
        );
        let opts = CombineOptions {
            mode: CombineMode::Merge,
            ..CombineOptions::default()
        };
        let ts = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        CycleResult {
            cycle_id: id,
            started_at: ts,
            finished_at: ts,
            combined: combine(std::slice::from_ref(&batch), &opts),
            degraded_sources: BTreeSet::from([SourceId::from("youtube")]),
            errors: Vec::new(),
            batches: vec![batch],
            reports: Vec::new(),
        }
    }

    #[test]
    fn summary_lists_top_and_degraded() {
        let s = summarize(&result(7, &["Alpha", "Beta", "Gamma"]), 2);
        assert!(s.starts_with("Trending now (cycle 7, 2025-09-06 09:00 UTC)"));
        assert!(s.contains("1. Alpha (100.0; portal)"));
        assert!(s.contains("2. Beta"));
        assert!(!s.contains("Gamma"));
        assert!(s.ends_with("Degraded: youtube"));
    }

    #[test]
    fn gate_blocks_identical_top_list() {
        let mut g = RepeatGate::default();
        let a = result(1, &["x", "y"]);
        assert!(g.should_send(&a, 5));
        g.record(&a, 5);
        assert!(!g.should_send(&result(2, &["x", "y"]), 5));
        assert!(g.should_send(&result(3, &["y", "x"]), 5));
    }
}
