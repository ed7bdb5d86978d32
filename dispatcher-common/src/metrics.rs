//! Prometheus metrics plumbing shared by the dispatcher binary.

use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Build a Router exposing a `/metrics` endpoint, with a middleware layer recording
/// request counts and latencies for every route it is mounted on top of.
pub fn setup_metrics_router() -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Middleware recording request count and latency metrics.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

/// Records a single dequeue outcome against the named queue.
pub fn record_dequeue(queue: &str, dequeued: bool) {
    let labels = [
        ("queue", queue.to_owned()),
        ("dequeued", dequeued.to_string()),
    ];
    metrics::counter!("dispatcher_dequeue_total", &labels).increment(1);
}

/// Records a terminal resolution (`completed`, `errored`, `failed`) for a job.
pub fn record_resolution(queue: &str, outcome: &str) {
    let labels = [("queue", queue.to_owned()), ("outcome", outcome.to_owned())];
    metrics::counter!("dispatcher_resolution_total", &labels).increment(1);
}

/// Records a requeue, tagging whether it came from the liveness loop or the stalled
/// sweeper.
pub fn record_requeue(queue: &str, reason: &str) {
    let labels = [("queue", queue.to_owned()), ("reason", reason.to_owned())];
    metrics::counter!("dispatcher_requeue_total", &labels).increment(1);
}

/// Gauges the number of admission tokens currently held across all queues.
pub fn set_tokens_held(count: i64) {
    metrics::gauge!("dispatcher_admission_tokens_held").set(count as f64);
}
