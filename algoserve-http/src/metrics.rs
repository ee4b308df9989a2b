//! Prometheus metrics.
//!
//! Request outcomes, execution latency, and pool health are registered on
//! the default registry and exposed through [`metrics_handler`] in text
//! exposition format.

use std::sync::OnceLock;

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramTimer, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

use algoserve_executor::pool::PoolStats;

struct Metrics {
    requests_total: IntCounterVec,
    execution_seconds: HistogramVec,
    pool_workers: IntGaugeVec,
    pool_busy: IntGaugeVec,
    pool_restarts: IntGaugeVec,
}

fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(|| Metrics {
        requests_total: register_int_counter_vec!(
            "algoserve_requests_total",
            "Algorithm requests by outcome code",
            &["algorithm", "version", "code"]
        )
        .expect("requests_total registration"),
        execution_seconds: register_histogram_vec!(
            "algoserve_execution_seconds",
            "Wall-clock time spent in executor submit",
            &["algorithm", "version"]
        )
        .expect("execution_seconds registration"),
        pool_workers: register_int_gauge_vec!(
            "algoserve_pool_workers",
            "Configured worker count per pool",
            &["pool"]
        )
        .expect("pool_workers registration"),
        pool_busy: register_int_gauge_vec!(
            "algoserve_pool_busy_workers",
            "Workers currently executing a task",
            &["pool"]
        )
        .expect("pool_busy registration"),
        pool_restarts: register_int_gauge_vec!(
            "algoserve_pool_worker_restarts_total",
            "Workers replaced after a kill or crash",
            &["pool"]
        )
        .expect("pool_restarts registration"),
    })
}

/// Count one finished request under its envelope code.
pub fn record_outcome(algorithm: &str, version: &str, code: i64) {
    metrics()
        .requests_total
        .with_label_values(&[algorithm, version, &code.to_string()])
        .inc();
}

/// Time an executor submit; the timer records on drop.
pub fn execution_timer(algorithm: &str, version: &str) -> HistogramTimer {
    metrics()
        .execution_seconds
        .with_label_values(&[algorithm, version])
        .start_timer()
}

/// Refresh per-pool gauges from executor stats (called at scrape time).
pub fn update_pool_gauges(stats: &[PoolStats]) {
    let m = metrics();
    for pool in stats {
        m.pool_workers
            .with_label_values(&[&pool.name])
            .set(pool.size as i64);
        m.pool_busy
            .with_label_values(&[&pool.name])
            .set(pool.busy as i64);
        m.pool_restarts
            .with_label_values(&[&pool.name])
            .set(pool.restarts as i64);
    }
}

/// Render the default registry in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    // Touch the metric families so a scrape before the first request still
    // sees them registered.
    let _ = metrics();
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Handler for the `/metrics` endpoint.
pub async fn metrics_handler() -> ([(&'static str, &'static str); 1], String) {
    (
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        encode_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_counter_shows_up_in_exposition() {
        record_outcome("double", "v1", 0);
        record_outcome("double", "v1", 50400);
        let text = encode_metrics();
        assert!(text.contains("algoserve_requests_total"));
        assert!(text.contains("code=\"50400\""));
    }

    #[test]
    fn pool_gauges_follow_stats() {
        update_pool_gauges(&[PoolStats {
            name: "shared".to_string(),
            size: 4,
            busy: 2,
            pending: 1,
            restarts: 7,
        }]);
        let text = encode_metrics();
        assert!(text.contains("algoserve_pool_workers{pool=\"shared\"} 4"));
        assert!(text.contains("algoserve_pool_busy_workers{pool=\"shared\"} 2"));
        assert!(text.contains("algoserve_pool_worker_restarts_total{pool=\"shared\"} 7"));
    }

    #[tokio::test]
    async fn handler_sets_exposition_content_type() {
        let ([(name, value)], body) = metrics_handler().await;
        assert_eq!(name, "content-type");
        assert!(value.starts_with("text/plain"));
        assert!(body.contains("algoserve_execution_seconds") || !body.is_empty());
    }
}
