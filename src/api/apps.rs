//! App config endpoints: listing, prediction, diagnostics and benchmarks

use axum::{
    extract::{rejection::PathRejection, Multipart, Path, State},
    Json,
};
use serde::Deserialize;
use tracing::debug;

use crate::api::state::SharedState;
use crate::error::{ApiError, ApiResult};
use crate::service::{
    BatchPredictResponse, BenchmarkResponse, DeviceInfoResponse, PredictResponse, UploadedImage,
};
use crate::types::MlApp;

#[derive(Debug, Deserialize)]
pub struct BenchmarkRequest {
    pub iterations: Option<i64>,
}

/// GET /api/ml-apps/
pub async fn list_apps(State(state): State<SharedState>) -> ApiResult<Json<Vec<MlApp>>> {
    let service = state.service.clone();
    let apps = tokio::task::spawn_blocking(move || service.list_apps()).await??;
    Ok(Json(apps))
}

/// GET /api/ml-apps/:id/
pub async fn get_app(
    State(state): State<SharedState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<MlApp>> {
    let Path(id) = path?;
    let service = state.service.clone();
    let app = tokio::task::spawn_blocking(move || service.get_app(id)).await??;
    Ok(Json(app))
}

/// POST /api/ml-apps/:id/predict/ with a multipart `image` field
pub async fn predict(
    State(state): State<SharedState>,
    path: Result<Path<i64>, PathRejection>,
    multipart: Option<Multipart>,
) -> ApiResult<Json<PredictResponse>> {
    let Path(id) = path?;
    let image = read_images(multipart, "image").await?.into_iter().next();
    let service = state.service.clone();
    let response = tokio::task::spawn_blocking(move || service.predict(id, image)).await??;
    Ok(Json(response))
}

/// POST /api/ml-apps/:id/predict_batch/ with repeated multipart `images` fields
pub async fn predict_batch(
    State(state): State<SharedState>,
    path: Result<Path<i64>, PathRejection>,
    multipart: Option<Multipart>,
) -> ApiResult<Json<BatchPredictResponse>> {
    let Path(id) = path?;
    let images = read_images(multipart, "images").await?;
    let service = state.service.clone();
    let response = tokio::task::spawn_blocking(move || service.predict_batch(id, images)).await??;
    Ok(Json(response))
}

/// GET or POST /api/ml-apps/:id/device_info/
pub async fn device_info(
    State(state): State<SharedState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<DeviceInfoResponse>> {
    let Path(id) = path?;
    let service = state.service.clone();
    let info = tokio::task::spawn_blocking(move || service.device_info(id)).await??;
    Ok(Json(info))
}

/// POST /api/ml-apps/:id/benchmark/
///
/// A missing or malformed body runs the default iteration count.
pub async fn benchmark(
    State(state): State<SharedState>,
    path: Result<Path<i64>, PathRejection>,
    body: Option<Json<BenchmarkRequest>>,
) -> ApiResult<Json<BenchmarkResponse>> {
    let Path(id) = path?;
    let iterations = body.and_then(|Json(req)| req.iterations);
    let service = state.service.clone();
    let report = tokio::task::spawn_blocking(move || service.benchmark(id, iterations)).await??;
    Ok(Json(report))
}

/// Collect every file field called `name`; other fields are ignored
async fn read_images(multipart: Option<Multipart>, name: &str) -> ApiResult<Vec<UploadedImage>> {
    let Some(mut multipart) = multipart else {
        return Ok(Vec::new());
    };

    let mut images = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some(name) {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read '{name}': {e}")))?;
        debug!(field = name, filename = %filename, size = bytes.len(), "Received upload");
        images.push(UploadedImage {
            filename,
            content_type,
            bytes: bytes.to_vec(),
        });
    }
    Ok(images)
}
