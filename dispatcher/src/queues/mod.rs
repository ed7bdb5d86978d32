//! Registered queues (§4.4, §4.6). One module per queue; each contributes a
//! [`QueueStore`](dispatcher_common::QueueStore) to the [`QueueRegistry`] built at
//! startup.

pub mod codeintel;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::registry::QueueRegistry;

/// Builds the static registry of every queue this binary serves. Adding a queue means
/// adding a module here and registering it; nothing else in the dispatcher needs to
/// know about queue-specific payload shapes.
pub fn build_registry(pool: &PgPool, config: &Config) -> QueueRegistry {
    let mut registry = QueueRegistry::new();
    registry.register(
        codeintel::QUEUE_NAME,
        Arc::new(codeintel::store(pool.clone(), config)),
    );
    registry
}
