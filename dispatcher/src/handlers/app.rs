use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use dispatcher_common::health::HealthRegistry;
use tower_http::limit::RequestBodyLimitLayer;

use crate::dispatcher::Dispatcher;

use super::{dequeue, heartbeat, jobs};

/// Mounts the dispatcher's JSON API on top of `router`. Separate from the metrics
/// router so tests can exercise the API routes alone without standing up a Prometheus
/// recorder.
pub fn add_routes(
    router: Router,
    dispatcher: Arc<Dispatcher>,
    liveness: HealthRegistry,
    max_body_size: usize,
) -> Router {
    let readiness = liveness.clone();
    router
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || std::future::ready(readiness.get_status())),
        )
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
        .route("/dequeue", post(dequeue::dequeue))
        .route(
            "/addExecutionLogEntry",
            post(jobs::add_execution_log_entry),
        )
        .route("/markComplete", post(jobs::mark_complete))
        .route("/markErrored", post(jobs::mark_errored))
        .route("/markFailed", post(jobs::mark_failed))
        .route("/heartbeat", post(heartbeat::heartbeat))
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .with_state(dispatcher)
}

pub async fn index() -> &'static str {
    "dispatcher"
}
