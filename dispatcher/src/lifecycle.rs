//! The liveness loop (§4.2): periodic eviction of silent executors, run alongside the
//! HTTP server as its own long-lived task.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use dispatcher_common::health::HealthHandle;

use crate::dispatcher::Dispatcher;

/// Runs `Dispatcher::cleanup` every `interval`, forever. Reports healthy after each
/// successful tick so the process-wide liveness probe reflects real progress rather
/// than just the task being alive.
pub async fn run_cleanup_loop(
    dispatcher: Arc<Dispatcher>,
    interval: std::time::Duration,
    death_threshold: ChronoDuration,
    health: HealthHandle,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        dispatcher.cleanup(death_threshold).await;
        health.report_healthy().await;
    }
}
