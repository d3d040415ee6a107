// src/combine.rs
//! Cross-source merge and ranking.
//!
//! Pure: the output depends only on the batches' contents, never on their
//! order or on the wall clock.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::config::{CombineConfig, CombineMode};
use crate::types::{CombinedTrend, RawTrendItem, ScoreBasis, SourceBatch, SourceId};

#[derive(Debug, Clone, PartialEq)]
pub struct CombineOptions {
    pub mode: CombineMode,
    pub min_sources: usize,
    pub max_results: usize,
    pub raw_score_scale: f64,
    pub sample_urls: usize,
}

impl Default for CombineOptions {
    fn default() -> Self {
        (&CombineConfig::default()).into()
    }
}

impl From<&CombineConfig> for CombineOptions {
    fn from(c: &CombineConfig) -> Self {
        Self {
            mode: c.mode,
            min_sources: c.min_sources,
            max_results: c.max_results,
            raw_score_scale: c.raw_score_scale,
            sample_urls: c.sample_urls,
        }
    }
}

/// Canonical form used to group keywords across sources.
pub fn normalize_keyword(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Curly quotes and guillemets to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Decorations at either end, until nothing changes
    static RE_LEAD_TAG: OnceCell<Regex> = OnceCell::new();
    static RE_TRAIL_TAG: OnceCell<Regex> = OnceCell::new();
    let lead = RE_LEAD_TAG
        .get_or_init(|| Regex::new(r"^\s*(?:\[[^\]]*\]|\([^)]*\)|【[^】]*】)\s*").unwrap());
    let trail = RE_TRAIL_TAG
        .get_or_init(|| Regex::new(r"\s*(?:\[[^\]]*\]|\([^)]*\)|【[^】]*】)\s*$").unwrap());
    loop {
        let before = out.clone();
        out = lead.replace(&out, "").to_string();
        out = trail.replace(&out, "").to_string();
        out = out.trim().trim_start_matches('#').trim().to_string();
        out = strip_wrapping_quotes(&out);
        out = strip_trailing_punct(&out);
        if out == before {
            break;
        }
    }

    // 5) Case fold + collapse whitespace
    out.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_wrapping_quotes(s: &str) -> String {
    let t = s.trim();
    for q in ['"', '\''] {
        if t.len() >= 2 && t.starts_with(q) && t.ends_with(q) {
            return t[1..t.len() - 1].trim().to_string();
        }
    }
    t.to_string()
}

fn strip_trailing_punct(s: &str) -> String {
    let mut out = s.trim_end().to_string();
    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',' | '…' | '~') {
            out.pop();
            out = out.trim_end().to_string();
        } else {
            break;
        }
    }
    out
}

/// Rank-based score in (0, 100].
pub fn rank_score(rank: u32, max_rank: u32) -> f64 {
    let max_rank = max_rank.max(1) as f64;
    let rank = rank.max(1) as f64;
    (100.0 * (1.0 - (rank - 1.0) / max_rank)).max(0.0)
}

fn item_score(basis: ScoreBasis, item: &RawTrendItem, max_rank: u32, scale: f64) -> f64 {
    match (basis, item.raw_score) {
        (ScoreBasis::Interest, Some(raw)) if raw.is_finite() => (raw * scale).clamp(0.0, 100.0),
        _ => rank_score(item.rank, max_rank),
    }
}

#[derive(Debug)]
struct SourceHit {
    best_score: f64,
    best_rank: u32,
}

#[derive(Debug)]
struct Acc {
    hits: BTreeMap<SourceId, SourceHit>,
    /// (rank, source, original text) of the best-ranked item.
    display: (u32, SourceId, String),
    urls: Vec<(SourceId, u32, String)>,
    last_seen: DateTime<Utc>,
}

/// Merge one cycle's batches into a ranked keyword list.
pub fn combine(batches: &[SourceBatch], opts: &CombineOptions) -> Vec<CombinedTrend> {
    let mut ordered: Vec<&SourceBatch> = batches.iter().collect();
    ordered.sort_by(|a, b| a.source.cmp(&b.source));

    let mut groups: BTreeMap<String, Acc> = BTreeMap::new();
    for batch in ordered {
        let max_rank = batch.items.iter().map(|i| i.rank).max().unwrap_or(1);
        for item in &batch.items {
            let norm = normalize_keyword(&item.keyword);
            if norm.is_empty() {
                continue;
            }
            let score = item_score(batch.basis, item, max_rank, opts.raw_score_scale);
            let candidate = (item.rank, batch.source.clone(), item.keyword.trim().to_string());

            let acc = groups.entry(norm).or_insert_with(|| Acc {
                hits: BTreeMap::new(),
                display: candidate.clone(),
                urls: Vec::new(),
                last_seen: item.collected_at,
            });

            let hit = acc.hits.entry(batch.source.clone()).or_insert(SourceHit {
                best_score: score,
                best_rank: item.rank,
            });
            hit.best_score = hit.best_score.max(score);
            hit.best_rank = hit.best_rank.min(item.rank);

            if candidate < acc.display {
                acc.display = candidate;
            }
            if let Some(u) = &item.url {
                acc.urls.push((batch.source.clone(), item.rank, u.clone()));
            }
            acc.last_seen = acc.last_seen.max(item.collected_at);
        }
    }

    let min_sources = match opts.mode {
        CombineMode::Combine => opts.min_sources.max(1),
        CombineMode::Merge => 1,
    };

    let mut trends: Vec<CombinedTrend> = groups
        .into_iter()
        .filter(|(_, acc)| acc.hits.len() >= min_sources)
        .map(|(norm, mut acc)| {
            let total_score: f64 = acc.hits.values().map(|h| h.best_score).sum();
            acc.urls.sort();
            let mut sample_urls: Vec<String> = Vec::new();
            for (_, _, u) in acc.urls {
                if sample_urls.len() >= opts.sample_urls {
                    break;
                }
                if !sample_urls.contains(&u) {
                    sample_urls.push(u);
                }
            }
            CombinedTrend {
                normalized_keyword: norm,
                display_keyword: acc.display.2,
                sources: acc.hits.keys().cloned().collect(),
                source_ranks: acc
                    .hits
                    .iter()
                    .map(|(s, h)| (s.clone(), h.best_rank))
                    .collect(),
                total_score: (total_score * 1e6).round() / 1e6,
                rank: 0,
                sample_urls,
                last_seen: acc.last_seen,
            }
        })
        .collect();

    trends.sort_by(|a, b| {
        b.total_score
            .total_cmp(&a.total_score)
            .then_with(|| a.normalized_keyword.cmp(&b.normalized_keyword))
    });
    trends.truncate(opts.max_results);
    for (i, t) in trends.iter_mut().enumerate() {
        t.rank = (i + 1) as u32;
    }
    trends
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn item(src: &str, kw: &str, rank: u32) -> RawTrendItem {
        RawTrendItem::new(SourceId::from(src), kw, rank).collected_at(ts(1_700_000_000))
    }

    fn batch(src: &str, kws: &[(&str, u32)]) -> SourceBatch {
        SourceBatch::new(src, kws.iter().map(|(k, r)| item(src, k, *r)).collect())
    }

    #[test]
    fn normalizes_decorations() {
        assert_eq!(normalize_keyword("  [속보]  지진   발생 "), "지진 발생");
        assert_eq!(normalize_keyword("#WorldCup"), "worldcup");
        assert_eq!(normalize_keyword("(Video) Goal of the Month"), "goal of the month");
        assert_eq!(normalize_keyword("\u{201C}Quoted Title\u{201D}"), "quoted title");
        assert_eq!(normalize_keyword("Breaking news..."), "breaking news");
        assert_eq!(normalize_keyword("Big reveal… (영상)"), "big reveal");
        assert_eq!(normalize_keyword("<b>Tom &amp; Jerry</b>!!"), "tom & jerry");
        assert_eq!(normalize_keyword("[]"), "");
    }

    #[test]
    fn rank_score_shape() {
        assert_eq!(rank_score(1, 10), 100.0);
        assert!((rank_score(10, 10) - 10.0).abs() < 1e-9);
        assert_eq!(rank_score(1, 1), 100.0);
    }

    #[test]
    fn consensus_example_two_of_three() {
        let batches = vec![
            batch("A", &[("AI", 1)]),
            batch("B", &[("x", 1), ("y", 2), ("AI", 3)]),
            batch("C", &[]),
        ];
        let opts = CombineOptions::default();
        let out = combine(&batches, &opts);
        assert_eq!(out.len(), 1);
        let ai = &out[0];
        assert_eq!(ai.normalized_keyword, "ai");
        assert_eq!(ai.display_keyword, "AI");
        assert_eq!(
            ai.sources.iter().map(SourceId::as_str).collect::<Vec<_>>(),
            ["A", "B"]
        );
        let expected = rank_score(1, 1) + rank_score(3, 3);
        assert!((ai.total_score - expected).abs() < 1e-6);
        assert_eq!(ai.source_ranks[&SourceId::from("B")], 3);

        let strict = CombineOptions {
            min_sources: 3,
            ..CombineOptions::default()
        };
        assert!(combine(&batches, &strict).is_empty());
    }

    #[test]
    fn merge_mode_keeps_single_source_keywords() {
        let batches = vec![batch("A", &[("solo", 1), ("shared", 2)]), batch("B", &[("Shared", 1)])];
        let opts = CombineOptions {
            mode: CombineMode::Merge,
            ..CombineOptions::default()
        };
        let out = combine(&batches, &opts);
        let kws: Vec<_> = out.iter().map(|t| t.normalized_keyword.as_str()).collect();
        assert_eq!(kws, ["shared", "solo"]);
        assert_eq!(out[0].rank, 1);
        assert_eq!(out[1].rank, 2);
        // best-ranked spelling wins: rank 1 on B beats rank 2 on A
        assert_eq!(out[0].display_keyword, "Shared");
    }

    #[test]
    fn deterministic_under_permutation() {
        let a = batch("alpha", &[("one", 1), ("two", 2), ("three", 3)]);
        let b = batch("beta", &[("three", 1), ("one", 2), ("four", 3)]);
        let c = batch("gamma", &[("two", 1), ("four", 2), ("one", 3)]);
        let opts = CombineOptions::default();

        let base = combine(&[a.clone(), b.clone(), c.clone()], &opts);
        for perm in [
            vec![c.clone(), b.clone(), a.clone()],
            vec![b.clone(), a.clone(), c.clone()],
            vec![c.clone(), a.clone(), b.clone()],
        ] {
            assert_eq!(combine(&perm, &opts), base);
        }
        assert_eq!(base[0].normalized_keyword, "one");
    }

    #[test]
    fn equal_scores_tie_break_alphabetically() {
        let batches = vec![
            batch("A", &[("zebra", 1), ("apple", 2)]),
            batch("B", &[("apple", 1), ("zebra", 2)]),
        ];
        let out = combine(&batches, &CombineOptions::default());
        assert_eq!(out[0].total_score, out[1].total_score);
        assert_eq!(out[0].normalized_keyword, "apple");
    }

    #[test]
    fn duplicate_listing_counts_once_with_best_score() {
        let batches = vec![
            batch("A", &[("Cup", 1), ("#cup", 4)]),
            batch("B", &[("cup", 2), ("other", 4)]),
        ];
        let out = combine(&batches, &CombineOptions::default());
        assert_eq!(out.len(), 1);
        let expected = rank_score(1, 4) + rank_score(2, 4);
        assert!((out[0].total_score - expected).abs() < 1e-6);
        assert_eq!(out[0].source_ranks[&SourceId::from("A")], 1);
    }

    #[test]
    fn interest_basis_uses_scaled_raw_score() {
        let interest = SourceBatch::new(
            "gt",
            vec![
                item("gt", "ai", 1).with_score(80.0),
                item("gt", "rain", 2),
            ],
        )
        .with_basis(ScoreBasis::Interest);
        let portal = batch("portal", &[("AI", 1), ("rain", 2)]);
        let opts = CombineOptions {
            raw_score_scale: 2.0,
            ..CombineOptions::default()
        };
        let out = combine(&[interest, portal], &opts);
        let ai = out.iter().find(|t| t.normalized_keyword == "ai").unwrap();
        // 80 * 2 clamps to 100
        assert!((ai.total_score - 200.0).abs() < 1e-6);
        let rain = out.iter().find(|t| t.normalized_keyword == "rain").unwrap();
        // no raw score: rank formula for both sources
        assert!((rain.total_score - 2.0 * rank_score(2, 2)).abs() < 1e-6);
    }

    #[test]
    fn sample_urls_ordered_distinct_and_capped() {
        let a = SourceBatch::new(
            "a",
            vec![item("a", "k", 2).with_url("https://a/2"), item("a", "k!", 1).with_url("https://a/1")],
        );
        let b = SourceBatch::new(
            "b",
            vec![item("b", "K", 1).with_url("https://a/1"), item("b", "other", 2)],
        );
        let c = SourceBatch::new(
            "c",
            vec![item("c", "k", 1).with_url("https://c/1").collected_at(ts(1_800_000_000))],
        );
        let out = combine(&[c, b, a], &CombineOptions::default());
        let k = &out[0];
        assert_eq!(k.sample_urls, ["https://a/1", "https://a/2", "https://c/1"]);
        assert_eq!(k.last_seen, ts(1_800_000_000));
    }

    #[test]
    fn truncates_to_max_results() {
        let kws: Vec<(String, u32)> = (1..=20).map(|i| (format!("kw{i:02}"), i)).collect();
        let refs: Vec<(&str, u32)> = kws.iter().map(|(k, r)| (k.as_str(), *r)).collect();
        let opts = CombineOptions {
            mode: CombineMode::Merge,
            max_results: 5,
            ..CombineOptions::default()
        };
        let out = combine(&[batch("s", &refs)], &opts);
        assert_eq!(out.len(), 5);
        assert_eq!(out[4].rank, 5);
        assert_eq!(out[0].normalized_keyword, "kw01");
    }
}
