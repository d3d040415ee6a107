// src/collect/providers/rendered.rs
//! Pages that only show their ranking after scripts run. The page is rendered
//! by a remote headless-browser service and the resulting HTML is scraped like
//! any markup source.

use async_trait::async_trait;

use crate::collect::{CollectOutcome, TrendCollector};
use crate::config::SourceParams;
use crate::error::CollectError;
use crate::fetch::{FetchRequest, Fetcher};
use crate::types::SourceId;

use super::markup::{parse_document, MarkupSelectors};

pub struct RenderedCollector {
    id: SourceId,
    fetcher: Fetcher,
    url: String,
    render_endpoint: String,
    token_env: Option<String>,
    selectors: MarkupSelectors,
}

impl RenderedCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SourceId,
        fetcher: Fetcher,
        url: String,
        render_endpoint: String,
        token_env: Option<String>,
        item_selector: String,
        keyword_selector: String,
        link_selector: Option<String>,
    ) -> Self {
        Self {
            id,
            fetcher,
            url,
            render_endpoint: render_endpoint.trim_end_matches('/').to_string(),
            token_env,
            selectors: MarkupSelectors {
                item: item_selector,
                keyword: keyword_selector,
                link: link_selector,
            },
        }
    }

    /// `POST {endpoint}/content[?token=..]` with `{"url": page}`.
    pub fn render_request(&self) -> FetchRequest {
        let mut req = FetchRequest::post_json(
            format!("{}/content", self.render_endpoint),
            serde_json::json!({ "url": self.url }),
        );
        if let Some(token) = self
            .token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty())
        {
            req = req.query("token", token);
        }
        req
    }
}

#[async_trait]
impl TrendCollector for RenderedCollector {
    fn source_id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "rendered"
    }

    async fn fetch_raw(&self, params: &SourceParams) -> Result<CollectOutcome, CollectError> {
        let resp = self
            .fetcher
            .fetch(&self.render_request())
            .await
            .map_err(|e| match e {
                // A dead renderer is not the page's fault.
                crate::error::FetchError::Exhausted { .. } => CollectError::unavailable(
                    self.id.as_str(),
                    format!("rendering service: {e}"),
                ),
                other => other.into(),
            })?;
        let html = resp.text();
        if html.trim().is_empty() {
            return Err(CollectError::parse(self.id.as_str(), "renderer returned an empty document"));
        }
        parse_document(
            &self.id,
            &html,
            &self.url,
            &self.selectors,
            params.max_items,
        )
    }
}
