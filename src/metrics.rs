// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics with help text).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "fetch_attempts_total",
            "Outbound request attempts by outcome."
        );
        describe_counter!(
            "fetch_exhausted_total",
            "Requests that used up every retry attempt."
        );
        describe_histogram!("fetch_request_ms", "Single attempt latency in milliseconds.");

        describe_counter!("cache_hits_total", "Cache hits by tier (memory/durable).");
        describe_counter!("cache_misses_total", "Lookups that ran the producer.");
        describe_counter!(
            "cache_inflight_joins_total",
            "Callers that joined an outstanding fetch instead of starting one."
        );
        describe_counter!(
            "cache_inflight_abandoned_total",
            "Fetches restarted because every earlier waiter timed out."
        );
        describe_counter!("cache_evictions_total", "Entries removed by expiry sweeps.");
        describe_counter!(
            "cache_durable_errors_total",
            "Durable tier read/write failures (memory-only fallback)."
        );
        describe_counter!(
            "cache_corrupt_total",
            "Corrupt durable entries evicted and refetched."
        );
        describe_gauge!("cache_memory_entries", "Live entries in the memory tier.");

        describe_counter!("collector_items_total", "Items returned by collectors.");
        describe_counter!(
            "collector_dropped_total",
            "Items dropped because they could not be parsed."
        );
        describe_counter!("collector_errors_total", "Collector failures by kind.");
        describe_histogram!("collector_ms", "Collection time per source in milliseconds.");

        describe_counter!("scheduler_cycles_total", "Completed cycles.");
        describe_histogram!("scheduler_cycle_ms", "Cycle duration in milliseconds.");
        describe_gauge!(
            "scheduler_degraded_sources",
            "Degraded sources in the last cycle."
        );
        describe_gauge!(
            "scheduler_last_cycle_ts",
            "Unix ts when the last cycle finished."
        );
        describe_gauge!(
            "combine_keywords",
            "Keywords in the last combined ranking."
        );

        describe_counter!("publish_cycles_total", "Cycle results accepted by the publisher.");
        describe_counter!(
            "publish_rejected_total",
            "Cycle results rejected as out of order."
        );
        describe_counter!("notify_errors_total", "Failed webhook deliveries.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Only one recorder per process.
    pub fn install() -> Result<Self, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// `/metrics` (Prometheus exposition) and `/health`.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new()
            .route(
                "/metrics",
                get(move || {
                    let h = handle.clone();
                    async move { h.render() }
                }),
            )
            .route("/health", get(|| async { "ok" }))
    }
}
