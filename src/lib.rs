//! ML App Inference Service Library
//!
//! REST service exposing a pretrained image classifier through named app
//! configs, with device-aware batched inference, prediction logging and
//! benchmarking on top of ONNX Runtime.

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod service;
pub mod storage;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::ApiError;
pub use models::{ClassifierRegistry, ImageClassifier};
pub use service::PredictionService;
pub use store::Store;
pub use types::{MlApp, Prediction, PredictionLog};
