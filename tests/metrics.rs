// tests/metrics.rs
// One recorder per process, so everything lives in a single test.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use trend_aggregator::cache::Cache;
use trend_aggregator::config::{CacheConfig, RetryPolicy};
use trend_aggregator::error::FetchError;
use trend_aggregator::fetch::{FetchRequest, FetchResponse, Fetcher, Transport};
use trend_aggregator::metrics::Metrics;
use trend_aggregator::publish::Publisher;
use trend_aggregator::scheduler::Scheduler;

struct FlakyOnce(std::sync::atomic::AtomicBool);

#[async_trait]
impl Transport for FlakyOnce {
    async fn send(&self, _req: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if self.0.swap(true, std::sync::atomic::Ordering::SeqCst) {
            Ok(FetchResponse::new(200, "{}"))
        } else {
            Ok(FetchResponse::new(503, "busy"))
        }
    }
}

async fn get_text(app: &axum::Router, path: &str) -> (StatusCode, String) {
    let resp = app
        .clone()
        .oneshot(Request::get(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    // axum::body::to_bytes requires an explicit limit
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap(); // 1 MiB
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn metrics_endpoint_exposes_pipeline_series() {
    let metrics = Metrics::install().expect("first recorder in this process");
    let app = metrics.router();

    // fetch: one transient failure then success
    let fetcher = Fetcher::new(
        Arc::new(FlakyOnce(Default::default())),
        RetryPolicy {
            max_attempts: 2,
            delay: 0.0,
            backoff_factor: 1.0,
        },
    );
    fetcher
        .fetch(&FetchRequest::get("http://trends.test/"))
        .await
        .unwrap();

    // cache: miss then memory hit
    let cache = Cache::memory_only(CacheConfig::default());
    for _ in 0..2 {
        cache
            .get_or_fetch("k", Duration::from_secs(60), || async { Ok(b"v".to_vec()) })
            .await
            .unwrap();
    }

    // one empty cycle through scheduler and publisher
    let scheduler = Scheduler::new(
        Vec::new(),
        cache.clone(),
        Arc::new(Publisher::new(4)),
        (&trend_aggregator::AppConfig::default()).into(),
    );
    scheduler.engine().run_cycle_once().await.unwrap();

    let (status, text) = get_text(&app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    for needle in [
        "fetch_attempts_total",
        "fetch_request_ms",
        "cache_misses_total",
        "cache_hits_total",
        "scheduler_cycles_total",
        "scheduler_last_cycle_ts",
        "publish_cycles_total",
    ] {
        assert!(
            text.contains(needle),
            "metrics exposition missing '{needle}'\n{text}"
        );
    }
    assert!(text.contains(r#"outcome="transient""#), "{text}");

    let (status, text) = get_text(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "ok");
}
