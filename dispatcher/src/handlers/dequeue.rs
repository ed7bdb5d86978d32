use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use dispatcher_common::JobPayload;
use serde::{Deserialize, Serialize};

use crate::dispatcher::Dispatcher;
use crate::error::DispatcherError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueRequest {
    pub executor_name: String,
    pub executor_hostname: String,
    pub queue_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DequeueResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobPayload>,
    pub dequeued: bool,
}

pub async fn dequeue(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<DequeueRequest>,
) -> Result<Json<DequeueResponse>, DispatcherError> {
    let outcome = dispatcher
        .dequeue(
            &request.queue_name,
            &request.executor_name,
            &request.executor_hostname,
        )
        .await?;

    Ok(Json(match outcome {
        Some(job) => DequeueResponse {
            job: Some(job),
            dequeued: true,
        },
        None => DequeueResponse {
            job: None,
            dequeued: false,
        },
    }))
}
