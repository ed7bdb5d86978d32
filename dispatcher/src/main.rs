use std::sync::Arc;

use dispatcher_common::metrics::setup_metrics_router;
use dispatcher_common::health::HealthRegistry;
use dispatcher_common::RealClock;
use envconfig::Envconfig;
use eyre::Result;
use sqlx::postgres::PgPoolOptions;
use time::Duration as TimeDuration;
use tracing::{error, info};

mod config;
mod dispatcher;
mod error;
mod handlers;
mod lifecycle;
mod queues;
mod registry;
mod sweeper;
#[cfg(test)]
mod test_support;

use config::Config;
use dispatcher::Dispatcher;

async fn listen(app: axum::Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    sqlx::migrate!("../dispatcher-common/migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    let registry = queues::build_registry(&pool, &config);
    let queue_registry = Arc::new(registry.clone());

    let clock = Arc::new(RealClock);
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        config.maximum_num_transactions,
        clock.clone(),
        config.job_requeue_delay(),
        config.unreported_max_age(),
    ));

    let health = HealthRegistry::new("liveness");
    let liveness_deadline = TimeDuration::milliseconds(
        i64::try_from(config.job_cleanup_interval().as_millis()).unwrap_or(i64::MAX) * 4,
    );

    let cleanup_health = health
        .register("cleanup_loop".to_owned(), liveness_deadline)
        .await;
    let sweeper_health = health
        .register("stalled_sweeper".to_owned(), liveness_deadline)
        .await;

    let cleanup_loop = tokio::spawn(lifecycle::run_cleanup_loop(
        dispatcher.clone(),
        config.job_cleanup_interval(),
        config.death_threshold(),
        cleanup_health,
    ));

    let sweeper_loop = tokio::spawn(sweeper::run_sweeper_loop(
        queue_registry,
        config.job_cleanup_interval(),
        clock,
        sweeper_health,
    ));

    let app = handlers::add_routes(
        axum::Router::new(),
        dispatcher.clone(),
        health.clone(),
        config.max_request_body_size,
    );
    let app = app.merge(setup_metrics_router());

    let bind = config.bind();
    info!(bind = %bind, "starting dispatcher");

    let http_server = tokio::spawn(listen(app, bind));

    tokio::select! {
        res = cleanup_loop => {
            error!("cleanup loop exited unexpectedly");
            if let Err(error) = res {
                error!(%error, "cleanup loop task panicked");
            }
        }
        res = sweeper_loop => {
            error!("stalled-job sweeper exited unexpectedly");
            if let Err(error) = res {
                error!(%error, "sweeper task panicked");
            }
        }
        res = http_server => {
            error!("http server exited");
            match res {
                Ok(Err(error)) => error!(%error, "http server failed"),
                Err(error) => error!(%error, "http server task panicked"),
                Ok(Ok(())) => {}
            }
        }
    }

    dispatcher.shutdown().await;
    info!("exiting");
}
