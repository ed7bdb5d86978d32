//! The reset/stalled-job sweeper (§4.5): the ultimate backstop for crash recovery. When
//! a dispatcher process dies holding lock transactions, PostgreSQL releases the row
//! locks at connection close; this loop notices the rows sitting `processing` with a
//! stale heartbeat and returns them to `queued`, or `errored` once their retry budget is
//! exhausted.

use std::sync::Arc;

use dispatcher_common::health::HealthHandle;
use dispatcher_common::Clock;

use crate::registry::QueueRegistry;

pub async fn run_sweeper_loop(
    registry: Arc<QueueRegistry>,
    interval: std::time::Duration,
    clock: Arc<dyn Clock>,
    health: HealthHandle,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = clock.now();
        for store in registry.iter() {
            match store.reset_stalled(now).await {
                Ok(ids) if !ids.is_empty() => {
                    tracing::info!(
                        queue = store.queue_name(),
                        count = ids.len(),
                        "reset stalled records"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%error, queue = store.queue_name(), "reset_stalled failed");
                }
            }
        }
        health.report_healthy().await;
    }
}
