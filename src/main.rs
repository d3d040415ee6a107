//! Trend aggregator binary.
//! Loads configuration, wires collectors, cache, scheduler and publisher, and
//! runs until the run limit is reached or Ctrl-C arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trend_aggregator::collect::build_sources;
use trend_aggregator::config;
use trend_aggregator::metrics::Metrics;
use trend_aggregator::notify::{webhook::WebhookNotifier, DEFAULT_TOP_N};
use trend_aggregator::{Cache, Fetcher, Publisher, Scheduler, SchedulerState};

/// Compact logs by default; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("trend_aggregator=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = config::load_default().context("loading configuration")?;
    if cfg.enabled_sources().next().is_none() {
        tracing::warn!(target: "main", "no enabled sources configured; cycles will be empty");
    }

    if let Some(addr) = cfg.metrics.listen.clone() {
        let metrics = Metrics::install().context("installing prometheus recorder")?;
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding metrics listener on {addr}"))?;
        tracing::info!(target: "main", %addr, "serving /metrics and /health");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics.router()).await {
                tracing::error!(target: "main", error = %e, "metrics server stopped");
            }
        });
    }

    let fetcher = Fetcher::http(&cfg.collectors.http, cfg.collectors.retry)
        .context("building HTTP client")?;

    let cache = Cache::open(cfg.cache.clone()).await;
    cache.start_sweeper();

    let publisher = Arc::new(Publisher::new(cfg.history_capacity));
    if let Some(url) = cfg.notify.webhook_url.clone() {
        let top_n = cfg.notify.top_n.unwrap_or(DEFAULT_TOP_N);
        publisher.add_sink(Arc::new(WebhookNotifier::new(url).with_top_n(top_n)));
    }

    let sources = build_sources(&cfg.sources, &fetcher);
    tracing::info!(
        target: "main",
        sources = sources.len(),
        interval_s = cfg.update_interval,
        runs = cfg.runs,
        "starting trend aggregation"
    );

    let handle = Scheduler::new(sources, cache.clone(), publisher.clone(), (&cfg).into()).spawn();
    let mut state = handle.watch_state();

    let stopped_on_its_own = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::error!(target: "main", error = %e, "signal handler failed");
            }
            tracing::info!(target: "main", "shutdown requested");
            false
        }
        _ = state.wait_for(|s| *s == SchedulerState::Stopped) => true,
    };
    if stopped_on_its_own {
        handle.wait().await;
    } else {
        handle.shutdown().await;
    }

    let flushed = cache.shutdown().await;
    if let Some(last) = publisher.latest() {
        tracing::info!(
            target: "main",
            cycle_id = last.cycle_id,
            keywords = last.combined.len(),
            flushed,
            "bye"
        );
    }
    Ok(())
}
