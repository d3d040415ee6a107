// src/collect/providers/keyword_api.rs
//! Portal rising-keyword list served as JSON.

use async_trait::async_trait;
use serde_json::Value;

use crate::collect::{clean_text, CollectOutcome, TrendCollector};
use crate::config::SourceParams;
use crate::error::CollectError;
use crate::fetch::{FetchRequest, Fetcher};
use crate::types::{RawTrendItem, SourceId};

use super::json_number;

pub struct KeywordApiCollector {
    id: SourceId,
    fetcher: Fetcher,
    url: String,
    list_field: String,
    keyword_field: String,
    score_field: Option<String>,
}

impl KeywordApiCollector {
    pub fn new(
        id: SourceId,
        fetcher: Fetcher,
        url: String,
        list_field: String,
        keyword_field: String,
        score_field: Option<String>,
    ) -> Self {
        Self {
            id,
            fetcher,
            url,
            list_field,
            keyword_field,
            score_field,
        }
    }
}

/// Field layout of one keyword list response.
#[derive(Debug, Clone, Copy)]
pub struct ListShape<'a> {
    /// Dotted path to the array, e.g. `top10` or `data.keywords`.
    pub list_field: &'a str,
    pub keyword_field: &'a str,
    pub score_field: Option<&'a str>,
}

fn lookup<'v>(root: &'v Value, dotted: &str) -> Option<&'v Value> {
    dotted
        .split('.')
        .filter(|p| !p.is_empty())
        .try_fold(root, |v, part| v.get(part))
}

pub fn parse_keyword_list(
    id: &SourceId,
    body: &[u8],
    shape: ListShape<'_>,
    max_items: usize,
) -> Result<CollectOutcome, CollectError> {
    let doc: Value =
        serde_json::from_slice(body).map_err(|e| CollectError::parse(id.as_str(), e))?;
    let list = lookup(&doc, shape.list_field)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            CollectError::parse(id.as_str(), format!("no array at `{}`", shape.list_field))
        })?;

    let mut out = CollectOutcome::default();
    for (idx, entry) in list.iter().enumerate() {
        let keyword = match entry {
            Value::String(s) => Some(s.as_str()),
            Value::Object(_) => entry.get(shape.keyword_field).and_then(Value::as_str),
            _ => None,
        }
        .map(clean_text)
        .unwrap_or_default();
        if keyword.is_empty() {
            out.dropped += 1;
            continue;
        }

        let rank = entry
            .get("rank")
            .and_then(json_number)
            .filter(|r| *r >= 1.0)
            .map(|r| r as u32)
            .unwrap_or((idx + 1) as u32);
        let mut item = RawTrendItem::new(id.clone(), keyword, rank);

        if let Some(score) = shape
            .score_field
            .and_then(|f| entry.get(f))
            .and_then(json_number)
        {
            item = item.with_score(score);
        }
        if let Value::Object(map) = entry {
            for (k, v) in map {
                if k == shape.keyword_field || k == "rank" {
                    continue;
                }
                if matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                    item = item.with_meta(k, v.clone());
                }
            }
            if let Some(link) = map.get("url").and_then(Value::as_str) {
                item = item.with_url(link);
            }
        }
        out.items.push(item);
    }
    out.items.sort_by_key(|i| i.rank);
    Ok(out.capped(max_items))
}

#[async_trait]
impl TrendCollector for KeywordApiCollector {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "keyword_api"
    }

    async fn fetch_raw(&self, params: &SourceParams) -> Result<CollectOutcome, CollectError> {
        let resp = self.fetcher.fetch(&FetchRequest::get(&self.url)).await?;
        let shape = ListShape {
            list_field: &self.list_field,
            keyword_field: &self.keyword_field,
            score_field: self.score_field.as_deref(),
        };
        parse_keyword_list(&self.id, &resp.body, shape, params.max_items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> ListShape<'static> {
        ListShape {
            list_field: "top10",
            keyword_field: "keyword",
            score_field: Some("count"),
        }
    }

    #[test]
    fn parses_ranked_objects() {
        let body = br#"{"now": 1700000000, "top10": [
            {"rank": 2, "keyword": "second", "state": "s", "count": "1,200"},
            {"rank": 1, "keyword": "first &amp; best", "state": "+", "count": 3400},
            {"rank": 3, "state": "n"}
        ]}"#;
        let out = parse_keyword_list(&SourceId::from("signal"), body, shape(), 10).unwrap();
        assert_eq!(out.dropped, 1);
        let kws: Vec<_> = out.items.iter().map(|i| i.keyword.as_str()).collect();
        assert_eq!(kws, ["first & best", "second"]);
        assert_eq!(out.items[0].raw_score, Some(3400.0));
        assert_eq!(out.items[1].raw_score, Some(1200.0));
        assert_eq!(out.items[0].metadata["state"], "+");
    }

    #[test]
    fn plain_strings_rank_by_position_under_nested_path() {
        let body = br#"{"data": {"list": ["a", "b", "c"]}}"#;
        let shape = ListShape {
            list_field: "data.list",
            keyword_field: "keyword",
            score_field: None,
        };
        let out = parse_keyword_list(&SourceId::from("p"), body, shape, 2).unwrap();
        assert_eq!(out.items.len(), 2);
        assert_eq!(out.items[1].keyword, "b");
        assert_eq!(out.items[1].rank, 2);
    }

    #[test]
    fn missing_list_is_parse_error() {
        let err = parse_keyword_list(&SourceId::from("p"), b"{}", shape(), 10).unwrap_err();
        assert!(err.to_string().contains("top10"));
    }
}
