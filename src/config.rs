// src/config.rs
//! Typed configuration, loaded once at startup and validated before anything runs.
//!
//! Lookup order for the file:
//! 1) `$TREND_CONFIG_PATH`
//! 2) `config/trends.toml`
//! 3) built-in defaults (no sources)
//!
//! `TREND_UPDATE_INTERVAL` and `TREND_RUNS` override the file afterwards.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

pub const ENV_CONFIG_PATH: &str = "TREND_CONFIG_PATH";
pub const ENV_UPDATE_INTERVAL: &str = "TREND_UPDATE_INTERVAL";
pub const ENV_RUNS: &str = "TREND_RUNS";
pub const DEFAULT_CONFIG_PATH: &str = "config/trends.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Seconds between cycle starts.
    pub update_interval: u64,
    /// Number of cycles to run; 0 = unbounded.
    pub runs: u64,
    /// Per-collector budget inside one cycle, seconds.
    pub cycle_timeout: u64,
    pub max_concurrency: usize,
    /// How many past cycles the publisher keeps for keyword history.
    pub history_capacity: usize,
    pub cache: CacheConfig,
    pub collectors: CollectorsConfig,
    pub combine: CombineConfig,
    pub notify: NotifyConfig,
    pub metrics: MetricsConfig,
    pub sources: Vec<SourceConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            update_interval: 300,
            runs: 0,
            cycle_timeout: 60,
            max_concurrency: 8,
            history_capacity: 288,
            cache: CacheConfig::default(),
            collectors: CollectorsConfig::default(),
            combine: CombineConfig::default(),
            notify: NotifyConfig::default(),
            metrics: MetricsConfig::default(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub memory_ttl: u64,
    pub file_ttl: u64,
    pub cleanup_interval: u64,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl: 300,
            file_ttl: 3600,
            cleanup_interval: 3600,
            dir: PathBuf::from(".cache"),
        }
    }
}

impl CacheConfig {
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl)
    }

    pub fn file_ttl(&self) -> Duration {
        Duration::from_secs(self.file_ttl)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CollectorsConfig {
    pub retry: RetryPolicy,
    pub http: HttpConfig,
}

/// Shared, read-only retry schedule for every outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Seconds before the second attempt.
    pub delay: f64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: 1.0,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout, seconds.
    pub timeout: f64,
    /// Fixed User-Agent; a built-in browser list is rotated when unset.
    pub user_agent: Option<String>,
    pub accept_language: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: 10.0,
            user_agent: None,
            accept_language: "ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    /// Consensus filter active.
    #[default]
    Combine,
    /// Every keyword kept regardless of source count.
    Merge,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CombineConfig {
    pub mode: CombineMode,
    pub min_sources: usize,
    pub max_results: usize,
    /// Multiplier applied to `raw_score` for interest-based sources.
    pub raw_score_scale: f64,
    pub sample_urls: usize,
}

impl Default for CombineConfig {
    fn default() -> Self {
        Self {
            mode: CombineMode::Combine,
            min_sources: 2,
            max_results: 100,
            raw_score_scale: 1.0,
            sample_urls: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    /// How many top keywords the webhook summary lists.
    pub top_n: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// e.g. "0.0.0.0:9100"; exporter disabled when unset.
    pub listen: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_items() -> usize {
    20
}

/// One `[[sources]]` entry: shared request parameters plus a kind-specific part.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Read through the shared cache (off = always fetch).
    #[serde(default = "default_true")]
    pub cache: bool,
    /// Region / country / geo code (e.g. "KR").
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default)]
    pub category: Option<String>,
    /// Analytical window, e.g. "now 1-d".
    #[serde(default)]
    pub time_window: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(flatten)]
    pub spec: SourceSpec,
}

impl SourceConfig {
    pub fn params(&self) -> SourceParams {
        SourceParams {
            region: self.region.clone(),
            max_items: self.max_items,
            category: self.category.clone(),
            time_window: self.time_window.clone(),
            keywords: self.keywords.clone(),
        }
    }
}

/// Request parameters handed to `fetch_raw` and folded into cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceParams {
    pub region: Option<String>,
    pub max_items: usize,
    pub category: Option<String>,
    pub time_window: Option<String>,
    pub keywords: Vec<String>,
}

fn default_youtube_endpoint() -> String {
    "https://www.googleapis.com/youtube/v3/videos".to_string()
}

fn default_youtube_key_env() -> String {
    "YOUTUBE_API_KEY".to_string()
}

fn default_list_field() -> String {
    "top10".to_string()
}

fn default_keyword_field() -> String {
    "keyword".to_string()
}

/// Closed set of source kinds. Each builds its own collector.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Video platform "most popular" chart (JSON API).
    Youtube {
        #[serde(default = "default_youtube_endpoint")]
        endpoint: String,
        #[serde(default = "default_youtube_key_env")]
        api_key_env: String,
    },
    /// Portal rising-keyword list (JSON API).
    KeywordApi {
        url: String,
        #[serde(default = "default_list_field")]
        list_field: String,
        #[serde(default = "default_keyword_field")]
        keyword_field: String,
        #[serde(default)]
        score_field: Option<String>,
    },
    /// RSS 2.0 news or trends feed.
    Rss { url: String },
    /// Static HTML page scraped with CSS selectors.
    Markup {
        url: String,
        item_selector: String,
        keyword_selector: String,
        #[serde(default)]
        link_selector: Option<String>,
    },
    /// Page that needs a remote rendering service before scraping.
    Rendered {
        url: String,
        render_endpoint: String,
        #[serde(default)]
        token_env: Option<String>,
        item_selector: String,
        keyword_selector: String,
        #[serde(default)]
        link_selector: Option<String>,
    },
    /// Interest-over-time analysis for configured keywords.
    Interest { url: String },
}

impl SourceSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Youtube { .. } => "youtube",
            Self::KeywordApi { .. } => "keyword_api",
            Self::Rss { .. } => "rss",
            Self::Markup { .. } => "markup",
            Self::Rendered { .. } => "rendered",
            Self::Interest { .. } => "interest",
        }
    }
}

impl AppConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout)
    }

    /// Parse from TOML text without touching the environment.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    /// Apply `TREND_UPDATE_INTERVAL` / `TREND_RUNS` when set and numeric.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_env_u64(ENV_UPDATE_INTERVAL) {
            self.update_interval = v;
        }
        if let Some(v) = parse_env_u64(ENV_RUNS) {
            self.runs = v;
        }
    }

    /// Check every option once; the rest of the crate trusts the result.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_interval == 0 {
            return Err(ConfigError::invalid("update_interval", "must be > 0"));
        }
        if self.cycle_timeout == 0 {
            return Err(ConfigError::invalid("cycle_timeout", "must be > 0"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("max_concurrency", "must be >= 1"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::invalid("history_capacity", "must be >= 1"));
        }
        if self.cache.memory_ttl == 0 || self.cache.file_ttl == 0 {
            return Err(ConfigError::invalid("cache.*_ttl", "TTLs must be > 0"));
        }
        if self.cache.cleanup_interval == 0 {
            return Err(ConfigError::invalid("cache.cleanup_interval", "must be > 0"));
        }

        let retry = &self.collectors.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "collectors.retry.max_attempts",
                "must be >= 1",
            ));
        }
        if !retry.delay.is_finite() || retry.delay < 0.0 {
            return Err(ConfigError::invalid(
                "collectors.retry.delay",
                "must be a finite number >= 0",
            ));
        }
        if !retry.backoff_factor.is_finite() || retry.backoff_factor < 1.0 {
            return Err(ConfigError::invalid(
                "collectors.retry.backoff_factor",
                "must be >= 1.0",
            ));
        }
        if !self.collectors.http.timeout.is_finite() || self.collectors.http.timeout <= 0.0 {
            return Err(ConfigError::invalid("collectors.http.timeout", "must be > 0"));
        }

        if self.combine.min_sources == 0 {
            return Err(ConfigError::invalid("combine.min_sources", "must be >= 1"));
        }
        if self.combine.max_results == 0 {
            return Err(ConfigError::invalid("combine.max_results", "must be >= 1"));
        }
        if !self.combine.raw_score_scale.is_finite() || self.combine.raw_score_scale <= 0.0 {
            return Err(ConfigError::invalid("combine.raw_score_scale", "must be > 0"));
        }

        let mut seen = HashSet::new();
        for src in &self.sources {
            validate_source(src)?;
            if !seen.insert(src.id.as_str()) {
                return Err(ConfigError::DuplicateSource(src.id.clone()));
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn validate_source(src: &SourceConfig) -> Result<(), ConfigError> {
    let key = |field: &str| format!("sources.{}.{}", src.id, field);

    if src.id.trim().is_empty() {
        return Err(ConfigError::invalid("sources.id", "must not be empty"));
    }
    if src.max_items == 0 {
        return Err(ConfigError::invalid(key("max_items"), "must be >= 1"));
    }

    let check_url = |field: &str, u: &str| -> Result<(), ConfigError> {
        url::Url::parse(u)
            .map(|_| ())
            .map_err(|e| ConfigError::invalid(key(field), e.to_string()))
    };
    let check_selector = |field: &str, sel: &str| -> Result<(), ConfigError> {
        scraper::Selector::parse(sel)
            .map(|_| ())
            .map_err(|e| ConfigError::invalid(key(field), format!("{e:?}")))
    };

    match &src.spec {
        SourceSpec::Youtube { endpoint, .. } => check_url("endpoint", endpoint)?,
        SourceSpec::KeywordApi { url, .. } | SourceSpec::Rss { url } => check_url("url", url)?,
        SourceSpec::Markup {
            url,
            item_selector,
            keyword_selector,
            link_selector,
        } => {
            check_url("url", url)?;
            check_selector("item_selector", item_selector)?;
            check_selector("keyword_selector", keyword_selector)?;
            if let Some(l) = link_selector {
                check_selector("link_selector", l)?;
            }
        }
        SourceSpec::Rendered {
            url,
            render_endpoint,
            item_selector,
            keyword_selector,
            link_selector,
            ..
        } => {
            check_url("url", url)?;
            check_url("render_endpoint", render_endpoint)?;
            check_selector("item_selector", item_selector)?;
            check_selector("keyword_selector", keyword_selector)?;
            if let Some(l) = link_selector {
                check_selector("link_selector", l)?;
            }
        }
        SourceSpec::Interest { url } => {
            check_url("url", url)?;
            if src.keywords.is_empty() || src.keywords.len() > 5 {
                return Err(ConfigError::invalid(
                    key("keywords"),
                    "interest sources need 1..=5 keywords",
                ));
            }
        }
    }
    Ok(())
}

fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Load, override from env and validate a config file at `path`.
pub fn load_from(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let mut cfg = AppConfig::from_toml_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    cfg.apply_env_overrides();
    cfg.validate()
        .with_context(|| format!("validating config {}", path.display()))?;
    Ok(cfg)
}

/// Load using env var + fallbacks (see module docs).
pub fn load_default() -> Result<AppConfig> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        }
        return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
    }
    let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        return load_from(&default_path);
    }
    let mut cfg = AppConfig::default();
    cfg.apply_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
update_interval = 120
runs = 3

[cache]
memory_ttl = 60

[collectors.retry]
max_attempts = 5
delay = 0.5

[combine]
mode = "merge"
min_sources = 3

[[sources]]
id = "signal"
kind = "keyword_api"
url = "https://api.signal.bz/news/realtime"
max_items = 10

[[sources]]
id = "daum"
kind = "markup"
url = "https://www.daum.net/"
item_selector = ".list_mini .rank_cont"
keyword_selector = ".link_issue"
link_selector = ".link_issue"

[[sources]]
id = "interest"
kind = "interest"
url = "https://trends.example.com/api/widgetdata/multiline"
region = "KR"
time_window = "now 1-d"
keywords = ["AI", "bitcoin"]
"#;

    #[test]
    fn shipped_config_is_valid() {
        let cfg = AppConfig::from_toml_str(include_str!("../config/trends.toml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.enabled_sources().count(), 4);
    }

    #[test]
    fn parses_sample_with_defaults_filled() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.update_interval, 120);
        assert_eq!(cfg.runs, 3);
        assert_eq!(cfg.cache.memory_ttl, 60);
        assert_eq!(cfg.cache.file_ttl, 3600);
        assert_eq!(cfg.cache.cleanup_interval, 3600);
        assert_eq!(cfg.collectors.retry.max_attempts, 5);
        assert!((cfg.collectors.retry.backoff_factor - 2.0).abs() < 1e-9);
        assert_eq!(cfg.combine.mode, CombineMode::Merge);
        assert_eq!(cfg.combine.min_sources, 3);
        assert_eq!(cfg.sources.len(), 3);
        assert_eq!(cfg.sources[0].max_items, 10);
        assert_eq!(cfg.sources[0].spec.kind_name(), "keyword_api");
        assert!(matches!(
            &cfg.sources[0].spec,
            SourceSpec::KeywordApi { list_field, .. } if list_field == "top10"
        ));
        assert_eq!(cfg.sources[2].params().keywords.len(), 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.update_interval, 300);
        assert_eq!(cfg.runs, 0);
        assert_eq!(cfg.cache.memory_ttl, 300);
        assert_eq!(cfg.cache.file_ttl, 3600);
        assert_eq!(cfg.collectors.retry, RetryPolicy::default());
        assert_eq!(cfg.combine.min_sources, 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_duplicate_ids_and_bad_values() {
        let dup = r#"
[[sources]]
id = "a"
kind = "rss"
url = "https://example.com/rss"
[[sources]]
id = "a"
kind = "rss"
url = "https://example.com/rss2"
"#;
        let cfg = AppConfig::from_toml_str(dup).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateSource(id)) if id == "a"
        ));

        let mut cfg = AppConfig::default();
        cfg.collectors.retry.backoff_factor = 0.5;
        assert!(cfg.validate().is_err());

        let bad_sel = r#"
[[sources]]
id = "m"
kind = "markup"
url = "https://example.com"
item_selector = "li["
keyword_selector = "a"
"#;
        let cfg = AppConfig::from_toml_str(bad_sel).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn interest_requires_keywords() {
        let s = r#"
[[sources]]
id = "g"
kind = "interest"
url = "https://example.com/multiline"
"#;
        let cfg = AppConfig::from_toml_str(s).unwrap();
        assert!(cfg.validate().is_err());
    }
}
