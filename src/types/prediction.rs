//! Prediction results and persisted prediction logs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Output of one successful classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    /// Label with the highest probability
    pub predicted_class: String,

    /// Probability of the predicted label (0.0 - 1.0)
    pub confidence: f32,

    /// Probability for every label
    pub class_probabilities: BTreeMap<String, f32>,

    /// Wall time spent on this image in seconds
    pub processing_time: f64,

    /// Device identifier the inference ran on
    pub device: String,
}

/// Per-image outcome of a batch prediction
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BatchOutcome {
    Ok(Prediction),
    Failed { error: String, device: String },
}

impl BatchOutcome {
    pub fn prediction(&self) -> Option<&Prediction> {
        match self {
            BatchOutcome::Ok(prediction) => Some(prediction),
            BatchOutcome::Failed { .. } => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, BatchOutcome::Ok(_))
    }

    /// Processing time attributed to this item (zero for failures)
    pub fn processing_time(&self) -> f64 {
        self.prediction().map(|p| p.processing_time).unwrap_or(0.0)
    }

    /// Output record persisted in the prediction log
    pub fn to_output(&self) -> PredictionOutput {
        match self {
            BatchOutcome::Ok(prediction) => PredictionOutput::from(prediction),
            BatchOutcome::Failed { error, device } => PredictionOutput {
                predicted_class: "error".to_string(),
                confidence: 0.0,
                class_probabilities: BTreeMap::new(),
                device: device.clone(),
                error: Some(error.clone()),
            },
        }
    }
}

/// User verdict on a logged prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Correct,
    Incorrect,
}

impl Feedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feedback::Correct => "correct",
            Feedback::Incorrect => "incorrect",
        }
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feedback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "correct" => Ok(Feedback::Correct),
            "incorrect" => Ok(Feedback::Incorrect),
            other => Err(format!("Unknown feedback '{other}'")),
        }
    }
}

/// Metadata describing the uploaded input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMetadata {
    pub filename: String,
    /// Upload size in bytes
    pub size: u64,
    /// Detected image format, e.g. "jpeg"
    pub format: String,
}

/// Output stored with a prediction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionOutput {
    pub predicted_class: String,
    pub confidence: f32,
    pub class_probabilities: BTreeMap<String, f32>,
    pub device: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Prediction> for PredictionOutput {
    fn from(prediction: &Prediction) -> Self {
        Self {
            predicted_class: prediction.predicted_class.clone(),
            confidence: prediction.confidence,
            class_probabilities: prediction.class_probabilities.clone(),
            device: prediction.device.clone(),
            error: None,
        }
    }
}

/// Input for recording a prediction log
#[derive(Debug, Clone)]
pub struct NewPredictionLog {
    pub ml_app_id: i64,
    pub input: InputMetadata,
    pub output: PredictionOutput,
    /// Seconds
    pub processing_time: f64,
}

impl NewPredictionLog {
    pub fn validate(&self) -> anyhow::Result<()> {
        let confidence = self.output.confidence;
        if !(0.0..=1.0).contains(&confidence) {
            anyhow::bail!("confidence {confidence} outside [0, 1]");
        }
        if self.processing_time.is_nan() || self.processing_time < 0.0 {
            anyhow::bail!("processing_time {} is negative", self.processing_time);
        }
        Ok(())
    }
}

/// Input for recording the image that accompanied a prediction
#[derive(Debug, Clone)]
pub struct NewImageUpload {
    /// Path relative to the upload root
    pub file_path: String,
    pub width: u32,
    pub height: u32,
    /// Bytes
    pub file_size: u64,
}

/// Stored image attached to a prediction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUpload {
    pub id: i64,
    pub prediction_log_id: i64,
    pub file_path: String,
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
}

/// A persisted prediction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionLog {
    pub id: i64,
    pub ml_app: i64,
    pub ml_app_name: String,
    pub input_data: InputMetadata,
    pub output_data: PredictionOutput,
    pub confidence: f32,
    pub processing_time: f64,
    pub feedback: Option<Feedback>,
    pub image: Option<ImageUpload>,
    pub created_at: DateTime<Utc>,
}
