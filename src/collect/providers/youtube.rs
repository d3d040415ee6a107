// src/collect/providers/youtube.rs
//! Video platform "most popular" chart.

use async_trait::async_trait;
use serde_json::Value;

use crate::collect::{clean_text, CollectOutcome, TrendCollector};
use crate::config::SourceParams;
use crate::error::CollectError;
use crate::fetch::{FetchRequest, Fetcher};
use crate::types::{RawTrendItem, SourceId};

use super::json_number;

/// The API refuses more than this per page.
const MAX_PAGE: usize = 50;

pub struct YoutubeCollector {
    id: SourceId,
    fetcher: Fetcher,
    endpoint: String,
    api_key_env: String,
}

impl YoutubeCollector {
    pub fn new(id: SourceId, fetcher: Fetcher, endpoint: String, api_key_env: String) -> Self {
        Self {
            id,
            fetcher,
            endpoint,
            api_key_env,
        }
    }

    fn request(&self, params: &SourceParams, api_key: String) -> FetchRequest {
        let mut req = FetchRequest::get(&self.endpoint)
            .query("part", "snippet,statistics")
            .query("chart", "mostPopular")
            .query("regionCode", params.region.as_deref().unwrap_or("KR"))
            .query("maxResults", params.max_items.min(MAX_PAGE).to_string());
        if let Some(cat) = &params.category {
            req = req.query("videoCategoryId", cat.clone());
        }
        req.query("key", api_key)
    }
}

/// Parse a `videos?chart=mostPopular` response body.
pub fn parse_videos(
    id: &SourceId,
    body: &[u8],
    max_items: usize,
) -> Result<CollectOutcome, CollectError> {
    let doc: Value =
        serde_json::from_slice(body).map_err(|e| CollectError::parse(id.as_str(), e))?;
    let list = doc
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| CollectError::parse(id.as_str(), "missing `items` array"))?;

    let mut out = CollectOutcome::default();
    for (idx, video) in list.iter().enumerate() {
        let snippet = video.get("snippet");
        let title = snippet
            .and_then(|s| s.get("title"))
            .and_then(Value::as_str)
            .map(clean_text)
            .unwrap_or_default();
        if title.is_empty() {
            out.dropped += 1;
            continue;
        }

        let stats = video.get("statistics");
        let stat = |name: &str| stats.and_then(|s| s.get(name)).and_then(json_number);
        let views = stat("viewCount");

        let mut item = RawTrendItem::new(id.clone(), title, (idx + 1) as u32);
        if let Some(v) = views {
            item = item.with_score(v).with_meta("views", v as u64);
        }
        if let Some(vid) = video.get("id").and_then(Value::as_str) {
            item = item.with_url(format!("https://www.youtube.com/watch?v={vid}"));
        }
        if let Some(ch) = snippet.and_then(|s| s.get("channelTitle")).and_then(Value::as_str) {
            item = item.with_meta("channel", ch);
        }
        if let Some(cat) = snippet.and_then(|s| s.get("categoryId")).and_then(Value::as_str) {
            item = item.with_meta("category_id", cat);
        }
        if let Some(l) = stat("likeCount") {
            item = item.with_meta("likes", l as u64);
        }
        if let Some(c) = stat("commentCount") {
            item = item.with_meta("comments", c as u64);
        }
        out.items.push(item);
    }
    Ok(out.capped(max_items))
}

#[async_trait]
impl TrendCollector for YoutubeCollector {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "youtube"
    }

    async fn fetch_raw(&self, params: &SourceParams) -> Result<CollectOutcome, CollectError> {
        let key = std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                CollectError::config(
                    self.id.as_str(),
                    format!("API key env `{}` is not set", self.api_key_env),
                )
            })?;
        let resp = self.fetcher.fetch(&self.request(params, key)).await?;
        parse_videos(&self.id, &resp.body, params.max_items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
      "items": [
        {"id": "abc123",
         "snippet": {"title": "New &amp; Noteworthy MV", "channelTitle": "Label", "categoryId": "10"},
         "statistics": {"viewCount": "150000", "likeCount": "900", "commentCount": "42"}},
        {"id": "broken", "snippet": {"channelTitle": "NoTitle"}},
        {"id": "def456",
         "snippet": {"title": "Match highlights", "channelTitle": "Sports"},
         "statistics": {"viewCount": "9000"}}
      ]
    }"#;

    #[test]
    fn parses_videos_and_drops_untitled() {
        let id = SourceId::from("youtube");
        let out = parse_videos(&id, BODY.as_bytes(), 10).unwrap();
        assert_eq!(out.items.len(), 2);
        assert_eq!(out.dropped, 1);

        let first = &out.items[0];
        assert_eq!(first.keyword, "New & Noteworthy MV");
        assert_eq!(first.rank, 1);
        assert_eq!(first.raw_score, Some(150000.0));
        assert_eq!(first.url.as_deref(), Some("https://www.youtube.com/watch?v=abc123"));
        assert_eq!(first.metadata["channel"], "Label");
        assert_eq!(first.metadata["likes"], 900);

        // position in the chart is kept even though an entry before it was skipped
        assert_eq!(out.items[1].rank, 3);
    }

    #[test]
    fn missing_items_is_parse_error() {
        let id = SourceId::from("youtube");
        let err = parse_videos(&id, br#"{"kind":"x"}"#, 10).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
    }
}
