//! ONNX model loader

use crate::config::ModelConfig;
use crate::models::classifier::{ImageClassifier, InferenceBackend};
use crate::models::device::Device;
use anyhow::{Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// ONNX Runtime session wrapped as an inference backend
pub struct OnnxBackend {
    /// Sessions need exclusive access to run
    session: Mutex<Session>,
    /// Input name for the model
    input_name: String,
    /// Output name for the logits
    output_name: String,
    reduced_precision: bool,
}

impl InferenceBackend for OnnxBackend {
    fn forward(&self, input: &[f32], batch: usize, image_size: u32) -> Result<Vec<Vec<f32>>> {
        let side = image_size as i64;
        let shape = vec![batch as i64, 3, side, side];
        let input_tensor = Tensor::from_array((shape, input.to_vec()))
            .context("Failed to create input tensor")?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let outputs = session.run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        let output = outputs
            .get(self.output_name.as_str())
            .with_context(|| format!("Model produced no '{}' output", self.output_name))?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .context("Model output is not a float tensor")?;

        let rows = split_rows(shape, data, batch)?;
        debug!(batch, classes = rows.first().map(Vec::len), "Forward pass complete");
        Ok(rows)
    }

    fn reduced_precision(&self) -> bool {
        self.reduced_precision
    }
}

/// Split a `[batch, classes]` (or `[classes]` for batch 1) output into rows
fn split_rows(shape: &[i64], data: &[f32], batch: usize) -> Result<Vec<Vec<f32>>> {
    let classes = match shape {
        [b, c] if *b as usize == batch => *c as usize,
        [c] if batch == 1 => *c as usize,
        other => anyhow::bail!("Unexpected output shape {:?} for batch of {}", other, batch),
    };
    if classes == 0 || data.len() != batch * classes {
        anyhow::bail!(
            "Output holds {} values, expected {} x {}",
            data.len(),
            batch,
            classes
        );
    }
    Ok(data.chunks(classes).map(<[f32]>::to_vec).collect())
}

/// Loader for classifier models
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    intra_threads: usize,
}

impl ModelLoader {
    pub fn new(intra_threads: usize) -> Self {
        Self {
            intra_threads: intra_threads.max(1),
        }
    }

    /// Load a single ONNX model onto `device`
    pub fn load_backend<P: AsRef<Path>>(
        &self,
        path: P,
        device: Device,
        reduced_precision: bool,
    ) -> Result<OnnxBackend> {
        let path = path.as_ref();

        info!(
            path = %path.display(),
            device = %device,
            reduced_precision,
            threads = self.intra_threads,
            "Loading ONNX model"
        );

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.intra_threads)?
            .with_execution_providers(device.execution_providers())?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {:?}", path))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "input".to_string());

        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name.contains("logits") || o.name.contains("output"))
            .or_else(|| session.outputs.first())
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "output".to_string());

        info!(
            input = %input_name,
            output = %output_name,
            "Model loaded successfully"
        );

        Ok(OnnxBackend {
            session: Mutex::new(session),
            input_name,
            output_name,
            reduced_precision,
        })
    }

    /// Build a classifier for `device`.
    ///
    /// The float16 variant is used when `mixed_precision` is requested, the
    /// device supports it and a variant is configured. A model that fails to
    /// load yields an unloaded classifier so the service can still start.
    pub fn load_classifier(
        &self,
        config: &ModelConfig,
        device: Device,
        mixed_precision: bool,
    ) -> ImageClassifier {
        let fp16_path = config
            .fp16_model_path
            .as_ref()
            .filter(|_| mixed_precision && device.supports_reduced_precision());

        let loaded = match fp16_path {
            Some(path) => self.load_backend(path, device, true).or_else(|e| {
                warn!(error = %e, "Reduced precision model failed to load, using float32 model");
                self.load_backend(&config.model_path, device, false)
            }),
            None => self.load_backend(&config.model_path, device, false),
        };

        match loaded {
            Ok(backend) => {
                ImageClassifier::new(Box::new(backend), device, config.labels.clone(), config.image_size)
                    .with_warmup(config.warmup_iterations)
            }
            Err(e) => {
                warn!(
                    device = %device,
                    error = %e,
                    "Classifier model unavailable, predictions will fail"
                );
                ImageClassifier::unloaded(format!("{e:#}"), device, config.labels.clone(), config.image_size)
                    .with_warmup(config.warmup_iterations)
            }
        }
    }
}

impl Default for ModelLoader {
    fn default() -> Self {
        Self { intra_threads: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_rows_batched() {
        let rows = split_rows(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2).unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_split_rows_flat_single() {
        let rows = split_rows(&[2], &[0.3, 0.7], 1).unwrap();
        assert_eq!(rows, vec![vec![0.3, 0.7]]);
    }

    #[test]
    fn test_split_rows_rejects_wrong_batch() {
        assert!(split_rows(&[3, 2], &[0.0; 6], 2).is_err());
        assert!(split_rows(&[2, 2], &[0.0; 3], 2).is_err());
    }

    #[test]
    fn test_missing_model_yields_unloaded_classifier() {
        let config = ModelConfig {
            model_path: "does/not/exist.onnx".into(),
            ..ModelConfig::default()
        };
        let classifier = ModelLoader::default().load_classifier(&config, Device::Cpu, false);
        assert!(!classifier.is_loaded());
        assert_eq!(classifier.labels(), config.labels.as_slice());
    }
}
