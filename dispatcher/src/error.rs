use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dispatcher_common::{StoreError, TransformError};
use serde::Serialize;
use thiserror::Error;

/// Errors produced by the dispatcher's public contract (§4.1). These are the only
/// errors handlers ever need to translate into an HTTP response.
#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("unknown queue")]
    UnknownQueue,
    #[error("unknown job")]
    UnknownJob,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for DispatcherError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            DispatcherError::UnknownQueue => (StatusCode::NOT_FOUND, self.to_string()),
            DispatcherError::UnknownJob => (StatusCode::NOT_FOUND, self.to_string()),
            DispatcherError::Store(error) => {
                tracing::error!(%error, "store error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            DispatcherError::Transform(error) => {
                tracing::warn!(%error, "transform error, record marked failed");
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}
