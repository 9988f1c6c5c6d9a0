//! HTTP API

pub mod apps;
pub mod health;
pub mod logs;
pub mod state;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::{AppState, SharedState};

/// Build the service router
pub fn router(state: SharedState, max_upload_bytes: usize) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))

        // App configs
        .route("/api/ml-apps/", get(apps::list_apps))
        .route("/api/ml-apps/:id/", get(apps::get_app))
        .route("/api/ml-apps/:id/predict/", post(apps::predict))
        .route("/api/ml-apps/:id/predict_batch/", post(apps::predict_batch))
        .route(
            "/api/ml-apps/:id/device_info/",
            get(apps::device_info).post(apps::device_info),
        )
        .route("/api/ml-apps/:id/benchmark/", post(apps::benchmark))

        // Prediction logs
        .route("/api/logs/", get(logs::list_logs))
        .route("/api/logs/:id/", get(logs::get_log))
        .route("/api/logs/:id/feedback/", post(logs::submit_feedback))

        .with_state(state)

        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
