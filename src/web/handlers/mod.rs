use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::error;

use crate::error::TaskError;
use crate::utils::http::ApiResponse;
use crate::AppContext;

pub mod tasks;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/tasks", tasks::tasks_router(ctx.service.clone()))
}

#[derive(Debug, Serialize)]
struct HealthInfo {
    status: &'static str,
    version: &'static str,
    git_hash: &'static str,
}

async fn health() -> Json<ApiResponse<HealthInfo>> {
    Json(ApiResponse::success(HealthInfo {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        git_hash: env!("GIT_HASH"),
    }))
}

/// [`TaskError`] rendered as an `ApiResponse` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub TaskError);

impl From<TaskError> for ApiError {
    fn from(error: TaskError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            TaskError::Validation(_) | TaskError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            TaskError::NotFound(_) => StatusCode::NOT_FOUND,
            TaskError::InvalidState { .. } | TaskError::Conflict(_) => StatusCode::CONFLICT,
            TaskError::Storage(_)
            | TaskError::Serialization(_)
            | TaskError::Io(_)
            | TaskError::Dispatch(_)
            | TaskError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(ApiResponse::<()>::error(self.0.to_string()))).into_response()
    }
}
