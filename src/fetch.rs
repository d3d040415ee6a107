// src/fetch.rs
//! Outbound requests with retry/backoff and failure classification.
//!
//! `Transport` only moves bytes; `Fetcher` owns the retry schedule and decides
//! what a response means. Tests swap the transport for a scripted one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;

use crate::config::{HttpConfig, RetryPolicy};
use crate::error::FetchError;

/// Body markers that some APIs send instead of (or together with) a 429.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "quotaexceeded",
    "ratelimitexceeded",
    "userratelimitexceeded",
    "too many requests",
];

/// Only this much of an error body is scanned for rate-limit markers.
const BODY_SCAN_LIMIT: usize = 4096;

const BROWSER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub json_body: Option<serde_json::Value>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            json_body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            json_body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }
}

/// Raw response as seen by the retry loop. Header names are lowercase.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Body as text; invalid UTF-8 is replaced rather than rejected.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// Moves one request over the wire. Network-level failures come back as
/// `FetchError::Transient`; any HTTP status is a successful send.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// reqwest-backed transport with browser-like headers.
pub struct HttpTransport {
    client: reqwest::Client,
    user_agent: Option<String>,
    accept_language: String,
    rotation: AtomicUsize,
}

impl HttpTransport {
    pub fn new(cfg: &HttpConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout))
            .build()?;
        Ok(Self {
            client,
            user_agent: cfg.user_agent.clone(),
            accept_language: cfg.accept_language.clone(),
            rotation: AtomicUsize::new(0),
        })
    }

    fn next_user_agent(&self) -> &str {
        match &self.user_agent {
            Some(ua) => ua,
            None => {
                let i = self.rotation.fetch_add(1, Ordering::Relaxed);
                BROWSER_USER_AGENTS[i % BROWSER_USER_AGENTS.len()]
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut builder = match req.method {
            Method::Get => self.client.get(&req.url),
            Method::Post => self.client.post(&req.url),
        };
        builder = builder
            .header(reqwest::header::USER_AGENT, self.next_user_agent())
            .header(reqwest::header::ACCEPT_LANGUAGE, &self.accept_language);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        for (k, v) in &req.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &req.json_body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(network_error)?;
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|s| (k.as_str().to_ascii_lowercase(), s.to_string()))
            })
            .collect();
        let body = resp.bytes().await.map_err(network_error)?.to_vec();
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

fn network_error(e: reqwest::Error) -> FetchError {
    let message = if e.is_timeout() {
        format!("timeout: {e}")
    } else if e.is_connect() {
        format!("connect: {e}")
    } else {
        e.to_string()
    };
    FetchError::Transient {
        status: e.status().map(|s| s.as_u16()),
        message,
    }
}

/// Map a response to the error it represents, or `None` when it is usable.
pub fn classify(resp: &FetchResponse) -> Option<FetchError> {
    let status = resp.status;
    if status < 400 {
        return None;
    }
    let retry_after = resp.header("retry-after").and_then(parse_retry_after);
    if status == 429 || has_rate_limit_marker(&resp.body) {
        return Some(FetchError::RateLimited {
            status,
            retry_after,
        });
    }
    let message = snippet(&resp.body);
    match status {
        500..=599 => Some(FetchError::Transient {
            status: Some(status),
            message,
        }),
        401 | 403 => Some(FetchError::Auth { status, message }),
        _ => Some(FetchError::BadRequest { status, message }),
    }
}

fn has_rate_limit_marker(body: &[u8]) -> bool {
    let head = &body[..body.len().min(BODY_SCAN_LIMIT)];
    let lower = String::from_utf8_lossy(head).to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(&body[..body.len().min(200)]);
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let v = value.trim();
    if let Ok(secs) = v.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(v).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Delay after failed attempt `attempt` (1-based): `delay * factor^(attempt-1)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(30) as i32;
    let secs = policy.initial_delay().as_secs_f64() * policy.backoff_factor.powi(exp);
    Duration::from_secs_f64(secs.min(3600.0))
}

/// Retrying fetcher shared by all collectors.
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn http(cfg: &HttpConfig, policy: RetryPolicy) -> reqwest::Result<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new(cfg)?), policy))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `req`, retrying retryable failures per the policy.
    pub async fn fetch(&self, req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        crate::metrics::ensure_metrics_described();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let t0 = std::time::Instant::now();
            let outcome = match self.transport.send(req).await {
                Ok(resp) => match classify(&resp) {
                    None => Ok(resp),
                    Some(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            histogram!("fetch_request_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

            let err = match outcome {
                Ok(resp) => {
                    counter!("fetch_attempts_total", "outcome" => "ok").increment(1);
                    tracing::debug!(
                        target: "fetch",
                        url = %req.url,
                        attempt,
                        status = resp.status,
                        "fetch ok"
                    );
                    return Ok(resp);
                }
                Err(err) => err,
            };

            counter!("fetch_attempts_total", "outcome" => outcome_label(&err)).increment(1);

            if !err.is_retryable() {
                tracing::warn!(target: "fetch", url = %req.url, attempt, error = %err, "fetch failed (terminal)");
                return Err(err);
            }
            if attempt >= max_attempts {
                tracing::warn!(target: "fetch", url = %req.url, attempt, error = %err, "fetch gave up");
                counter!("fetch_exhausted_total").increment(1);
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let mut delay = backoff_delay(&self.policy, attempt);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint);
            }
            tracing::info!(
                target: "fetch",
                url = %req.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn outcome_label(err: &FetchError) -> &'static str {
    match err {
        FetchError::Transient { .. } => "transient",
        FetchError::RateLimited { .. } => "rate_limited",
        FetchError::Auth { .. } => "auth",
        FetchError::BadRequest { .. } => "bad_request",
        FetchError::Decode(_) => "decode",
        FetchError::Exhausted { .. } => "exhausted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<FetchResponse, FetchError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<FetchResponse, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, _req: &FetchRequest) -> Result<FetchResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(FetchResponse::new(200, "fallback")))
        }
    }

    #[test]
    fn classify_statuses() {
        assert!(classify(&FetchResponse::new(200, "ok")).is_none());
        assert!(matches!(
            classify(&FetchResponse::new(503, "down")),
            Some(FetchError::Transient { status: Some(503), .. })
        ));
        assert!(matches!(
            classify(&FetchResponse::new(401, "nope")),
            Some(FetchError::Auth { status: 401, .. })
        ));
        assert!(matches!(
            classify(&FetchResponse::new(404, "missing")),
            Some(FetchError::BadRequest { status: 404, .. })
        ));
        let r = classify(&FetchResponse::new(429, "").with_header("Retry-After", "7"));
        assert_eq!(
            r,
            Some(FetchError::RateLimited {
                status: 429,
                retry_after: Some(Duration::from_secs(7))
            })
        );
    }

    #[test]
    fn vendor_quota_body_is_rate_limit_not_auth() {
        let body = r#"{"error":{"errors":[{"reason":"quotaExceeded"}],"code":403}}"#;
        let r = classify(&FetchResponse::new(403, body));
        assert!(matches!(r, Some(FetchError::RateLimited { status: 403, .. })));
    }

    #[test]
    fn backoff_schedule_defaults() {
        let p = RetryPolicy::default();
        assert_eq!(backoff_delay(&p, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&p, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&p, 3), Duration::from_secs(4));
    }

    #[test]
    fn backoff_starts_from_initial_delay() {
        let p = RetryPolicy {
            max_attempts: 4,
            delay: 0.5,
            backoff_factor: 3.0,
        };
        assert_eq!(backoff_delay(&p, 1), p.initial_delay());
        assert_eq!(backoff_delay(&p, 3), Duration::from_millis(4500));
    }

    #[test]
    fn undecodable_json_body_is_decode_error() {
        let ok: serde_json::Value = FetchResponse::new(200, r#"{"a":1}"#).json().unwrap();
        assert_eq!(ok["a"], 1);
        let err = FetchResponse::new(200, "<html>")
            .json::<serde_json::Value>()
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn retry_after_http_date_in_past_is_zero() {
        let d = parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(d, Duration::ZERO);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_ok_retries_once() {
        let t = Scripted::new(vec![
            Ok(FetchResponse::new(502, "bad gateway")),
            Ok(FetchResponse::new(200, "hello")),
        ]);
        let f = Fetcher::new(t.clone(), RetryPolicy::default());
        let resp = f.fetch(&FetchRequest::get("http://x/")).await.unwrap();
        assert_eq!(resp.text(), "hello");
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_is_not_retried() {
        let t = Scripted::new(vec![Ok(FetchResponse::new(403, "forbidden"))]);
        let f = Fetcher::new(t.clone(), RetryPolicy::default());
        let err = f.fetch(&FetchRequest::get("http://x/")).await.unwrap_err();
        assert!(matches!(err, FetchError::Auth { status: 403, .. }));
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_extends_delay() {
        let t = Scripted::new(vec![
            Ok(FetchResponse::new(429, "").with_header("retry-after", "5")),
            Ok(FetchResponse::new(200, "ok")),
        ]);
        let f = Fetcher::new(t.clone(), RetryPolicy::default());
        let start = tokio::time::Instant::now();
        f.fetch(&FetchRequest::get("http://x/")).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(5), "waited {waited:?}");
        assert!(waited < Duration::from_secs(6), "waited {waited:?}");
    }
}
