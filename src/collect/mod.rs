// src/collect/mod.rs
pub mod providers;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, TtlClass};
use crate::config::{SourceConfig, SourceParams, SourceSpec};
use crate::error::CollectError;
use crate::fetch::Fetcher;
use crate::types::{RawTrendItem, ScoreBasis, SourceId};

use self::providers::{
    interest::InterestCollector, keyword_api::KeywordApiCollector, markup::MarkupCollector,
    rendered::RenderedCollector, rss::RssCollector, youtube::YoutubeCollector,
};

/// Items a collector produced plus how many it had to skip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectOutcome {
    pub items: Vec<RawTrendItem>,
    pub dropped: usize,
}

impl CollectOutcome {
    /// Keep at most `max` items (in source order).
    pub fn capped(mut self, max: usize) -> Self {
        self.items.truncate(max);
        self
    }
}

#[async_trait]
pub trait TrendCollector: Send + Sync {
    fn source_id(&self) -> &SourceId;

    /// Short kind name, used in logs and cache keys.
    fn kind(&self) -> &'static str;

    fn cache_key(&self, params: &SourceParams) -> String {
        cache_key(self.source_id(), self.kind(), params)
    }

    fn ttl_class(&self) -> TtlClass {
        TtlClass::Realtime
    }

    fn score_basis(&self) -> ScoreBasis {
        ScoreBasis::Rank
    }

    async fn fetch_raw(&self, params: &SourceParams) -> Result<CollectOutcome, CollectError>;
}

/// `source|kind|region|category|max|window|kw1,kw2`
pub fn cache_key(source: &SourceId, kind: &str, p: &SourceParams) -> String {
    format!(
        "{source}|{kind}|{}|{}|{}|{}|{}",
        p.region.as_deref().unwrap_or("-"),
        p.category.as_deref().unwrap_or("-"),
        p.max_items,
        p.time_window.as_deref().unwrap_or("-"),
        p.keywords.join(","),
    )
}

/// Clean a scraped/API string for display: decode entities, drop tags,
/// collapse whitespace. Keeps case and punctuation.
pub fn clean_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").unwrap());
    let stripped = re_tags.replace_all(&decoded, " ");

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One configured, enabled source ready to run.
#[derive(Clone)]
pub struct RegisteredSource {
    pub collector: Arc<dyn TrendCollector>,
    pub params: SourceParams,
    pub use_cache: bool,
}

impl RegisteredSource {
    pub fn new(collector: Arc<dyn TrendCollector>, params: SourceParams) -> Self {
        Self {
            collector,
            params,
            use_cache: true,
        }
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn id(&self) -> &SourceId {
        self.collector.source_id()
    }
}

pub fn build_collector(src: &SourceConfig, fetcher: Fetcher) -> Arc<dyn TrendCollector> {
    let id = SourceId::new(src.id.clone());
    match &src.spec {
        SourceSpec::Youtube {
            endpoint,
            api_key_env,
        } => Arc::new(YoutubeCollector::new(
            id,
            fetcher,
            endpoint.clone(),
            api_key_env.clone(),
        )),
        SourceSpec::KeywordApi {
            url,
            list_field,
            keyword_field,
            score_field,
        } => Arc::new(KeywordApiCollector::new(
            id,
            fetcher,
            url.clone(),
            list_field.clone(),
            keyword_field.clone(),
            score_field.clone(),
        )),
        SourceSpec::Rss { url } => Arc::new(RssCollector::new(id, fetcher, url.clone())),
        SourceSpec::Markup {
            url,
            item_selector,
            keyword_selector,
            link_selector,
        } => Arc::new(MarkupCollector::new(
            id,
            fetcher,
            url.clone(),
            item_selector.clone(),
            keyword_selector.clone(),
            link_selector.clone(),
        )),
        SourceSpec::Rendered {
            url,
            render_endpoint,
            token_env,
            item_selector,
            keyword_selector,
            link_selector,
        } => Arc::new(RenderedCollector::new(
            id,
            fetcher,
            url.clone(),
            render_endpoint.clone(),
            token_env.clone(),
            item_selector.clone(),
            keyword_selector.clone(),
            link_selector.clone(),
        )),
        SourceSpec::Interest { url } => {
            Arc::new(InterestCollector::new(id, fetcher, url.clone()))
        }
    }
}

/// Build every enabled source from configuration.
pub fn build_sources<'a>(
    sources: impl IntoIterator<Item = &'a SourceConfig>,
    fetcher: &Fetcher,
) -> Vec<RegisteredSource> {
    sources
        .into_iter()
        .filter(|s| s.enabled)
        .map(|s| {
            let reg = RegisteredSource::new(build_collector(s, fetcher.clone()), s.params());
            if s.cache {
                reg
            } else {
                reg.without_cache()
            }
        })
        .collect()
}

/// Read-through collection: cached result if fresh, otherwise `fetch_raw`.
pub async fn collect_source(
    source: &RegisteredSource,
    cache: &Cache,
) -> Result<CollectOutcome, CollectError> {
    let collector = source.collector.clone();
    let params = source.params.clone();
    let key = collector.cache_key(&params);
    let ttl = cache.ttl_for(collector.ttl_class());
    let id = collector.source_id().to_string();

    let t0 = Instant::now();
    let res = if source.use_cache {
        cache
            .get_or_fetch_json(&id, &key, ttl, move || {
                let collector = collector.clone();
                let params = params.clone();
                async move { collector.fetch_raw(&params).await }
            })
            .await
    } else {
        collector.fetch_raw(&params).await
    };
    histogram!("collector_ms", "source" => id.clone()).record(t0.elapsed().as_secs_f64() * 1_000.0);

    match &res {
        Ok(out) => {
            counter!("collector_items_total", "source" => id.clone()).increment(out.items.len() as u64);
            counter!("collector_dropped_total", "source" => id.clone()).increment(out.dropped as u64);
            if out.dropped > 0 {
                tracing::debug!(target: "collect", source = %id, dropped = out.dropped, "collector skipped unparseable items");
            }
        }
        Err(e) => {
            counter!("collector_errors_total", "source" => id.clone(), "kind" => format!("{:?}", e.kind()))
                .increment(1);
            tracing::warn!(target: "collect", source = %id, error = %e, "collector failed");
        }
    }
    res
}
