//! Registered ML app configurations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Kind of inference task an app performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    ImageClassification,
    ObjectDetection,
    TextClassification,
    SentimentAnalysis,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::ImageClassification => "image_classification",
            AppType::ObjectDetection => "object_detection",
            AppType::TextClassification => "text_classification",
            AppType::SentimentAnalysis => "sentiment_analysis",
        }
    }

    /// Whether the service can run predictions for this app type
    pub fn is_supported(&self) -> bool {
        matches!(self, AppType::ImageClassification)
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image_classification" => Ok(AppType::ImageClassification),
            "object_detection" => Ok(AppType::ObjectDetection),
            "text_classification" => Ok(AppType::TextClassification),
            "sentiment_analysis" => Ok(AppType::SentimentAnalysis),
            other => Err(format!("Unknown app type '{other}'")),
        }
    }
}

/// Device an app would like its inference to run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Best available: CUDA, then Apple accelerator, then CPU
    #[default]
    Auto,
    Cuda,
    Cpu,
    Mps,
}

impl DevicePreference {
    pub const ALL: [DevicePreference; 4] = [
        DevicePreference::Auto,
        DevicePreference::Cuda,
        DevicePreference::Cpu,
        DevicePreference::Mps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DevicePreference::Auto => "auto",
            DevicePreference::Cuda => "cuda",
            DevicePreference::Cpu => "cpu",
            DevicePreference::Mps => "mps",
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(DevicePreference::Auto),
            "cuda" => Ok(DevicePreference::Cuda),
            "cpu" => Ok(DevicePreference::Cpu),
            "mps" => Ok(DevicePreference::Mps),
            other => Err(format!("Unknown device type '{other}'")),
        }
    }
}

/// A registered ML app as stored in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlApp {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub app_type: AppType,
    pub device_type: DevicePreference,
    /// Class labels in model output order
    pub classes: Vec<String>,
    pub batch_size: usize,
    pub use_mixed_precision: bool,
    /// Free-form optimization hints (quantization, tensorrt, onnx, ...)
    pub model_optimization: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an app (fixtures, seeding tool)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMlApp {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub app_type: AppType,
    #[serde(default)]
    pub device_type: DevicePreference,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub use_mixed_precision: bool,
    #[serde(default = "default_optimization")]
    pub model_optimization: serde_json::Value,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_batch_size() -> usize {
    1
}

fn default_optimization() -> serde_json::Value {
    serde_json::json!({})
}

fn default_active() -> bool {
    true
}

impl NewMlApp {
    /// Create an active image-classification app
    pub fn image_classification(name: &str, classes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            app_type: AppType::ImageClassification,
            device_type: DevicePreference::Auto,
            classes: classes.iter().map(|c| c.to_string()).collect(),
            batch_size: 1,
            use_mixed_precision: false,
            model_optimization: default_optimization(),
            is_active: true,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_device(mut self, device_type: DevicePreference) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_mixed_precision(mut self, enabled: bool) -> Self {
        self.use_mixed_precision = enabled;
        self
    }

    pub fn with_optimization(mut self, hints: serde_json::Value) -> Self {
        self.model_optimization = hints;
        self
    }

    /// Check the invariants every stored app must satisfy
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("name must not be empty");
        }
        if self.batch_size < 1 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.app_type == AppType::ImageClassification && self.classes.is_empty() {
            anyhow::bail!("image_classification apps need at least one class");
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = self.classes.iter().find(|c| !seen.insert(c.as_str())) {
            anyhow::bail!("class '{duplicate}' is listed more than once");
        }
        if !self.model_optimization.is_object() {
            anyhow::bail!("model_optimization must be a JSON object");
        }
        Ok(())
    }

    /// The three demo apps shipped with the service
    pub fn demo_set() -> Vec<NewMlApp> {
        vec![
            NewMlApp::image_classification("CUDA Image Classifier", &["cat", "dog"])
                .with_description("GPU-accelerated image classification (cat vs dog)")
                .with_device(DevicePreference::Auto)
                .with_batch_size(4)
                .with_mixed_precision(true)
                .with_optimization(serde_json::json!({
                    "quantization": false,
                    "tensorrt": false,
                    "onnx": false
                })),
            NewMlApp::image_classification("CPU Image Classifier", &["cat", "dog"])
                .with_description("CPU-only image classification (lightweight)")
                .with_device(DevicePreference::Cpu)
                .with_batch_size(1)
                .with_optimization(serde_json::json!({
                    "quantization": true,
                    "tensorrt": false,
                    "onnx": true
                })),
            NewMlApp::image_classification(
                "Mixed Precision Benchmark",
                &["cat", "dog", "bird", "fish"],
            )
            .with_description("Benchmark app running with mixed precision")
            .with_device(DevicePreference::Auto)
            .with_batch_size(8)
            .with_mixed_precision(true)
            .with_optimization(serde_json::json!({
                "quantization": false,
                "tensorrt": true,
                "onnx": false
            })),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_type_round_trip_names() {
        for app_type in [
            AppType::ImageClassification,
            AppType::ObjectDetection,
            AppType::TextClassification,
            AppType::SentimentAnalysis,
        ] {
            assert_eq!(app_type.as_str().parse::<AppType>().unwrap(), app_type);
        }
        assert!("speech".parse::<AppType>().is_err());
    }

    #[test]
    fn test_only_image_classification_supported() {
        assert!(AppType::ImageClassification.is_supported());
        assert!(!AppType::TextClassification.is_supported());
    }

    #[test]
    fn test_validate_rejects_empty_classes() {
        let app = NewMlApp::image_classification("empty", &[]);
        assert!(app.validate().is_err());

        let mut text = NewMlApp::image_classification("text", &[]);
        text.app_type = AppType::TextClassification;
        assert!(text.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_classes() {
        let app = NewMlApp::image_classification("dupes", &["cat", "dog", "cat"]);
        let err = app.validate().unwrap_err();
        assert!(err.to_string().contains("'cat'"));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let app = NewMlApp::image_classification("zero", &["a"]).with_batch_size(0);
        assert!(app.validate().is_err());
    }

    #[test]
    fn test_demo_set_is_valid() {
        let apps = NewMlApp::demo_set();
        assert_eq!(apps.len(), 3);
        assert!(apps.iter().all(|a| a.validate().is_ok()));
        assert_eq!(apps[1].device_type, DevicePreference::Cpu);
    }

    #[test]
    fn test_device_preference_serde() {
        let json = serde_json::to_string(&DevicePreference::Mps).unwrap();
        assert_eq!(json, "\"mps\"");
        let parsed: DevicePreference = serde_json::from_str("\"cuda\"").unwrap();
        assert_eq!(parsed, DevicePreference::Cuda);
    }
}
