//! Configuration management for the inference service

use crate::types::app::NewMlApp;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Prefix for environment overrides, e.g. `MLAPP__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "MLAPP";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub model: ModelConfig,
    pub inference: InferenceConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    /// App configs seeded into an empty database at startup
    pub fixtures: Vec<NewMlApp>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum accepted request body size (multipart uploads included)
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

/// SQLite database configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file, or `:memory:` for a throwaway database
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/ml_apps.sqlite3".to_string(),
        }
    }
}

/// Uploaded file storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the date-partitioned upload tree
    pub upload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("media/uploads"),
        }
    }
}

/// Classifier model configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// ONNX model with float32 weights
    pub model_path: PathBuf,
    /// Optional float16 variant (exported with float32 inputs/outputs),
    /// used on devices that support reduced precision
    pub fp16_model_path: Option<PathBuf>,
    /// Class labels produced by the model, in output order
    pub labels: Vec<String>,
    /// Square input resolution expected by the model
    pub image_size: u32,
    /// Number of intra-op threads for ONNX Runtime
    pub intra_threads: usize,
    /// Inferences run before benchmark timing starts
    pub warmup_iterations: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/mobilenet_v2.onnx"),
            fp16_model_path: None,
            labels: vec!["cat".to_string(), "dog".to_string()],
            image_size: 224,
            intra_threads: 1,
            warmup_iterations: 10,
        }
    }
}

/// Request-level inference limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Maximum number of images accepted by a single batch request
    pub max_batch_images: usize,
    /// Lower bound for benchmark iterations
    pub benchmark_min: usize,
    /// Upper bound for benchmark iterations
    pub benchmark_max: usize,
    /// Iterations used when the request does not specify any
    pub benchmark_default: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_batch_images: 10,
            benchmark_min: 10,
            benchmark_max: 200,
            benchmark_default: 100,
        }
    }
}

impl InferenceConfig {
    /// Clamp a requested benchmark iteration count into the allowed range
    pub fn clamp_iterations(&self, requested: Option<i64>) -> usize {
        let requested = requested.unwrap_or(self.benchmark_default as i64);
        requested.clamp(self.benchmark_min as i64, self.benchmark_max as i64) as usize
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Service metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Seconds between periodic metrics summaries (0 disables the reporter)
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 300,
        }
    }
}

impl AppConfig {
    /// Load configuration from a specific path, then apply `MLAPP__*` overrides.
    ///
    /// A missing file is not an error; every section falls back to its defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.model.labels.is_empty() {
            anyhow::bail!("model.labels must not be empty");
        }
        if self.model.image_size == 0 {
            anyhow::bail!("model.image_size must be positive");
        }
        if self.inference.max_batch_images == 0 {
            anyhow::bail!("inference.max_batch_images must be at least 1");
        }
        if self.inference.benchmark_min > self.inference.benchmark_max {
            anyhow::bail!(
                "inference.benchmark_min ({}) exceeds benchmark_max ({})",
                self.inference.benchmark_min,
                self.inference.benchmark_max
            );
        }
        for fixture in &self.fixtures {
            fixture
                .validate()
                .with_context(|| format!("Invalid fixture '{}'", fixture.name))?;
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            model: ModelConfig::default(),
            inference: InferenceConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            fixtures: NewMlApp::demo_set(),
        }
    }
}
