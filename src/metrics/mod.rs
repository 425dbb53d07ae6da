use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) work anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `GET /metrics` on the
/// control endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "lb_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "lb_http_request_duration_seconds",
            Unit::Seconds,
            "Request duration from the client's perspective"
        );
        describe_gauge!(
            "lb_http_requests_in_flight",
            Unit::Count,
            "Requests currently being processed"
        );

        // connections
        describe_gauge!(
            "lb_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "lb_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        // retries & passive health
        describe_counter!(
            "lb_upstream_retries_total",
            Unit::Count,
            "Retry attempts made by the retry wrapper"
        );
        describe_counter!(
            "lb_peer_ejections_total",
            Unit::Count,
            "Peers ejected after consecutive 5xx responses"
        );
        describe_counter!(
            "lb_peer_recoveries_total",
            Unit::Count,
            "Ejected peers re-admitted after fail_timeout"
        );

        // registry & discovery
        describe_gauge!(
            "lb_virtual_servers_running",
            Unit::Count,
            "Virtual servers currently running"
        );
        describe_counter!(
            "lb_discovery_poll_total",
            Unit::Count,
            "Service discovery poll cycles"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
