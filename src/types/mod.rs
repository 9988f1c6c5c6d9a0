//! Type definitions for the inference service

pub mod app;
pub mod prediction;

pub use app::{AppType, DevicePreference, MlApp, NewMlApp};
pub use prediction::{
    BatchOutcome, Feedback, ImageUpload, InputMetadata, NewImageUpload, NewPredictionLog,
    Prediction, PredictionLog, PredictionOutput,
};
