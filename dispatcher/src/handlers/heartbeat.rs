use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::dispatcher::Dispatcher;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub executor_name: String,
    #[serde(rename = "jobIDs")]
    pub job_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    #[serde(rename = "unknownIDs")]
    pub unknown_ids: Vec<i64>,
}

pub async fn heartbeat(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    let result = dispatcher
        .heartbeat(&request.executor_name, &request.job_ids)
        .await;
    Json(HeartbeatResponse {
        unknown_ids: result.unknown_ids,
    })
}
