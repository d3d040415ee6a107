// src/collect/providers/markup.rs
//! Static HTML ranking pages scraped with CSS selectors.

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::collect::{clean_text, CollectOutcome, TrendCollector};
use crate::config::SourceParams;
use crate::error::CollectError;
use crate::fetch::{FetchRequest, Fetcher};
use crate::types::{RawTrendItem, SourceId};

/// Selector strings as configured; compiled per parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupSelectors {
    pub item: String,
    pub keyword: String,
    pub link: Option<String>,
}

struct Compiled {
    item: Selector,
    keyword: Selector,
    link: Option<Selector>,
}

impl MarkupSelectors {
    fn compile(&self, id: &SourceId) -> Result<Compiled, CollectError> {
        let parse = |s: &str| {
            Selector::parse(s)
                .map_err(|e| CollectError::config(id.as_str(), format!("bad selector `{s}`: {e:?}")))
        };
        Ok(Compiled {
            item: parse(&self.item)?,
            keyword: parse(&self.keyword)?,
            link: self.link.as_deref().map(parse).transpose()?,
        })
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

fn resolve_link(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("javascript:") || href == "#" {
        return None;
    }
    match base {
        Some(b) => b.join(href).ok().map(|u| u.to_string()),
        None => Url::parse(href).ok().map(|u| u.to_string()),
    }
}

/// Extract ranked items from `html`. Relative links resolve against `page_url`.
pub fn parse_document(
    id: &SourceId,
    html: &str,
    page_url: &str,
    selectors: &MarkupSelectors,
    max_items: usize,
) -> Result<CollectOutcome, CollectError> {
    let sel = selectors.compile(id)?;
    let base = Url::parse(page_url).ok();
    let doc = Html::parse_document(html);

    let mut out = CollectOutcome::default();
    let mut matched = 0usize;
    for (idx, node) in doc.select(&sel.item).enumerate() {
        matched += 1;
        let keyword = node
            .select(&sel.keyword)
            .next()
            .map(element_text)
            .unwrap_or_default();
        if keyword.is_empty() {
            out.dropped += 1;
            continue;
        }

        let mut item = RawTrendItem::new(id.clone(), keyword, (idx + 1) as u32);
        let link_el = match &sel.link {
            Some(ls) => node.select(ls).next(),
            None => node.select(&sel.keyword).next(),
        };
        if let Some(url) = link_el
            .and_then(|el| el.value().attr("href"))
            .and_then(|h| resolve_link(base.as_ref(), h))
        {
            item = item.with_url(url);
        }
        out.items.push(item);
    }

    if matched == 0 {
        return Err(CollectError::parse(
            id.as_str(),
            format!("no elements matched `{}`", selectors.item),
        ));
    }
    Ok(out.capped(max_items))
}

pub struct MarkupCollector {
    id: SourceId,
    fetcher: Fetcher,
    url: String,
    selectors: MarkupSelectors,
}

impl MarkupCollector {
    pub fn new(
        id: SourceId,
        fetcher: Fetcher,
        url: String,
        item_selector: String,
        keyword_selector: String,
        link_selector: Option<String>,
    ) -> Self {
        Self {
            id,
            fetcher,
            url,
            selectors: MarkupSelectors {
                item: item_selector,
                keyword: keyword_selector,
                link: link_selector,
            },
        }
    }
}

#[async_trait]
impl TrendCollector for MarkupCollector {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "markup"
    }

    async fn fetch_raw(&self, params: &SourceParams) -> Result<CollectOutcome, CollectError> {
        let resp = self.fetcher.fetch(&FetchRequest::get(&self.url)).await?;
        parse_document(
            &self.id,
            &resp.text(),
            &self.url,
            &self.selectors,
            params.max_items,
        )
    }
}
