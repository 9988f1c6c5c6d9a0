//! Prediction log endpoints

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    Json,
};
use serde::Deserialize;

use crate::api::state::SharedState;
use crate::error::{ApiError, ApiResult};
use crate::types::{Feedback, PredictionLog};

#[derive(Debug, Deserialize)]
pub struct LogFilter {
    pub ml_app: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub feedback: Feedback,
}

/// GET /api/logs/?ml_app=<id>
pub async fn list_logs(
    State(state): State<SharedState>,
    query: Result<Query<LogFilter>, QueryRejection>,
) -> ApiResult<Json<Vec<PredictionLog>>> {
    let Query(filter) = query?;
    let service = state.service.clone();
    let logs = tokio::task::spawn_blocking(move || service.list_logs(filter.ml_app)).await??;
    Ok(Json(logs))
}

/// GET /api/logs/:id/
pub async fn get_log(
    State(state): State<SharedState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<PredictionLog>> {
    let Path(id) = path?;
    let service = state.service.clone();
    let log = tokio::task::spawn_blocking(move || service.get_log(id)).await??;
    Ok(Json(log))
}

/// POST /api/logs/:id/feedback/
pub async fn submit_feedback(
    State(state): State<SharedState>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<FeedbackRequest>, JsonRejection>,
) -> ApiResult<Json<PredictionLog>> {
    let Path(id) = path?;
    let Json(request) = payload.map_err(|e| {
        ApiError::bad_request(format!(
            "Expected {{\"feedback\": \"correct\" | \"incorrect\"}}: {}",
            e.body_text()
        ))
    })?;
    let service = state.service.clone();
    let log =
        tokio::task::spawn_blocking(move || service.submit_feedback(id, request.feedback)).await??;
    Ok(Json(log))
}
