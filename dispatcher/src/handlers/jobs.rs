use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use dispatcher_common::ExecutionLogEntry;
use serde::Deserialize;

use crate::dispatcher::Dispatcher;
use crate::error::DispatcherError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddExecutionLogEntryRequest {
    pub executor_name: String,
    pub queue_name: String,
    #[serde(rename = "jobID")]
    pub job_id: i64,
    pub entry: ExecutionLogEntry,
}

pub async fn add_execution_log_entry(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<AddExecutionLogEntryRequest>,
) -> Result<StatusCode, DispatcherError> {
    dispatcher
        .add_execution_log_entry(
            &request.queue_name,
            &request.executor_name,
            request.job_id,
            request.entry,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkCompleteRequest {
    pub executor_name: String,
    pub queue_name: String,
    #[serde(rename = "jobID")]
    pub job_id: i64,
}

pub async fn mark_complete(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<MarkCompleteRequest>,
) -> Result<StatusCode, DispatcherError> {
    dispatcher
        .mark_complete(&request.queue_name, &request.executor_name, request.job_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkErroredRequest {
    pub executor_name: String,
    pub queue_name: String,
    #[serde(rename = "jobID")]
    pub job_id: i64,
    pub error_message: String,
}

pub async fn mark_errored(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<MarkErroredRequest>,
) -> Result<StatusCode, DispatcherError> {
    dispatcher
        .mark_errored(
            &request.queue_name,
            &request.executor_name,
            request.job_id,
            &request.error_message,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkFailedRequest {
    pub executor_name: String,
    pub queue_name: String,
    #[serde(rename = "jobID")]
    pub job_id: i64,
    pub error_message: String,
}

pub async fn mark_failed(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(request): Json<MarkFailedRequest>,
) -> Result<StatusCode, DispatcherError> {
    dispatcher
        .mark_failed(
            &request.queue_name,
            &request.executor_name,
            request.job_id,
            &request.error_message,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
