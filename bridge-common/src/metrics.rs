use axum::{routing::get, Router};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

pub const TOTAL_SUCCESS: &str = "consumer_total_success_message";
pub const TOTAL_FAILURE: &str = "consumer_total_failure_message";
pub const TOTAL_RETRY: &str = "consumer_total_retry_message";
pub const TOTAL_FILTERED: &str = "consumer_total_filtered_message";
pub const CONSUME_DURATION: &str = "consumer_consume_duration_seconds";

const CONSUME_BUCKETS: &[f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 60.0];

/// Labels shared by every per-message counter and the duration histogram.
pub fn message_labels(
    queue: &str,
    service: &str,
    routing_key: &str,
) -> [(&'static str, String); 3] {
    [
        ("queue", queue.to_owned()),
        ("service", service.to_owned()),
        ("routing_key", routing_key.to_owned()),
    ]
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(CONSUME_DURATION.to_owned()), CONSUME_BUCKETS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Add the `/metrics` render route to an admin router.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();

    router.route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    )
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}
