// tests/notify_webhook.rs
//! Webhook sink against an in-process receiver.

use std::sync::{Arc, Mutex};

use axum::{http::StatusCode, routing::post, Json, Router};
use chrono::Utc;
use serde_json::Value;
use trend_aggregator::combine::{combine, CombineOptions};
use trend_aggregator::notify::webhook::WebhookNotifier;
use trend_aggregator::publish::{CycleSink, Publisher};
use trend_aggregator::types::{CycleResult, RawTrendItem, SourceBatch, SourceId};

fn cycle(id: u64, keywords: &[&str]) -> CycleResult {
    let batches: Vec<SourceBatch> = ["a", "b"]
        .iter()
        .map(|s| {
            let sid = SourceId::from(*s);
            SourceBatch::new(
                sid.clone(),
                keywords
                    .iter()
                    .enumerate()
                    .map(|(i, k)| RawTrendItem::new(sid.clone(), *k, i as u32 + 1))
                    .collect(),
            )
        })
        .collect();
    let now = Utc::now();
    CycleResult {
        cycle_id: id,
        started_at: now,
        finished_at: now,
        combined: combine(&batches, &CombineOptions::default()),
        degraded_sources: Default::default(),
        errors: vec![],
        batches,
        reports: vec![],
    }
}

async fn spawn_receiver(status: StatusCode) -> (String, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().route(
        "/hook",
        post({
            let seen = seen.clone();
            move |Json(body): Json<Value>| async move {
                seen.lock()
                    .unwrap()
                    .push(body["text"].as_str().unwrap_or_default().to_string());
                status
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), seen)
}

#[tokio::test]
async fn posts_summary_and_skips_unchanged_top_list() {
    let (url, seen) = spawn_receiver(StatusCode::OK).await;
    let publisher = Publisher::new(8);
    publisher.add_sink(Arc::new(WebhookNotifier::new(url).with_top_n(2)));

    publisher.publish(cycle(1, &["AI", "Rain", "Stocks"])).await.unwrap();
    publisher.publish(cycle(2, &["AI", "Rain", "Other"])).await.unwrap();
    publisher.publish(cycle(3, &["Rain", "AI"])).await.unwrap();

    let posts = seen.lock().unwrap().clone();
    assert_eq!(posts.len(), 2, "cycle 2 has the same top 2 as cycle 1");
    assert!(posts[0].starts_with("Trending now (cycle 1,"));
    assert!(posts[0].contains("1. AI (200.0; a, b)"));
    assert!(!posts[0].contains("Stocks"));
    assert!(posts[1].contains("cycle 3"));
}

#[tokio::test]
async fn failed_delivery_is_retried_then_reported() {
    let (url, seen) = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
    let notifier = WebhookNotifier::new(url).with_retries(2).with_timeout(2);

    let err = notifier
        .on_cycle(Arc::new(cycle(1, &["AI"])))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"), "{err}");
    assert_eq!(seen.lock().unwrap().len(), 2);

    // Not recorded as sent, so the same list is attempted again.
    notifier.on_cycle(Arc::new(cycle(2, &["AI"]))).await.unwrap_err();
    assert_eq!(seen.lock().unwrap().len(), 4);
}
