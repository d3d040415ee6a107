// src/collect/providers/rss.rs
//! RSS 2.0 news / trends feeds.

use async_trait::async_trait;
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::collect::{clean_text, CollectOutcome, TrendCollector};
use crate::config::SourceParams;
use crate::error::CollectError;
use crate::fetch::{FetchRequest, Fetcher};
use crate::types::{RawTrendItem, SourceId};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    /// Trends feeds carry an approximate search volume ("20,000+").
    #[serde(rename = "ht:approx_traffic")]
    approx_traffic: Option<String>,
}

fn parse_rfc2822_to_unix(ts: &str) -> Option<i64> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
}

fn parse_traffic(s: &str) -> Option<f64> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Entities HTML feeds use that XML does not define.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
}

pub fn parse_feed(
    id: &SourceId,
    xml: &str,
    max_items: usize,
) -> Result<CollectOutcome, CollectError> {
    let cleaned = scrub_html_entities_for_xml(xml);
    let rss: Rss = from_str(&cleaned).map_err(|e| CollectError::parse(id.as_str(), e))?;

    let mut out = CollectOutcome::default();
    for (idx, it) in rss.channel.item.into_iter().enumerate() {
        let title = it.title.as_deref().map(clean_text).unwrap_or_default();
        if title.is_empty() {
            out.dropped += 1;
            continue;
        }
        let mut item = RawTrendItem::new(id.clone(), title, (idx + 1) as u32);
        if let Some(link) = it.link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()) {
            item = item.with_url(link);
        }
        if let Some(ts) = it.pub_date.as_deref().and_then(parse_rfc2822_to_unix) {
            item = item.with_meta("published_at", ts);
        }
        if let Some(desc) = it.description.as_deref().map(clean_text).filter(|d| !d.is_empty()) {
            item = item.with_meta("description", desc);
        }
        if let Some(traffic) = it.approx_traffic.as_deref().and_then(parse_traffic) {
            item = item.with_score(traffic).with_meta("approx_traffic", traffic as u64);
        }
        out.items.push(item);
    }
    Ok(out.capped(max_items))
}

pub struct RssCollector {
    id: SourceId,
    fetcher: Fetcher,
    url: String,
}

impl RssCollector {
    pub fn new(id: SourceId, fetcher: Fetcher, url: String) -> Self {
        Self { id, fetcher, url }
    }
}

#[async_trait]
impl TrendCollector for RssCollector {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "rss"
    }

    async fn fetch_raw(&self, params: &SourceParams) -> Result<CollectOutcome, CollectError> {
        let mut req = FetchRequest::get(&self.url);
        if let Some(geo) = &params.region {
            req = req.query("geo", geo.clone());
        }
        let resp = self.fetcher.fetch(&req).await?;
        parse_feed(&self.id, &resp.text(), params.max_items)
    }
}
