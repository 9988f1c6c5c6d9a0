//! Image classifier: preprocessing, forward pass and result unpacking

use crate::models::device::{Device, DeviceInfo};
use crate::models::preprocess::Preprocessor;
use crate::types::prediction::{BatchOutcome, Prediction};
use image::{DynamicImage, Rgb, RgbImage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Classifier failures that callers need to tell apart
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Model not loaded: {0}")]
    NotLoaded(String),

    #[error("Model produces {outputs} outputs but {labels} class labels are configured")]
    LabelMismatch { outputs: usize, labels: usize },

    #[error("Model returned {got} rows for a batch of {expected}")]
    BatchMismatch { expected: usize, got: usize },

    #[error("Inference failed: {0}")]
    Inference(#[from] anyhow::Error),
}

/// A forward pass over preprocessed images.
///
/// `input` holds `batch` images as one contiguous `[batch, 3, size, size]`
/// buffer; the result holds one logits row per image.
pub trait InferenceBackend: Send + Sync {
    fn forward(&self, input: &[f32], batch: usize, image_size: u32) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Whether this backend runs the reduced-precision model
    fn reduced_precision(&self) -> bool {
        false
    }
}

/// Timing summary of a benchmark run
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    /// Seconds spent on the timed iterations
    pub total_time: f64,
    /// Seconds per inference
    pub average_time_per_inference: f64,
    pub throughput_fps: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub device: String,
    pub iterations: usize,
    pub warmup_iterations: usize,
}

/// Image classifier bound to one device and one loaded model
pub struct ImageClassifier {
    backend: Result<Box<dyn InferenceBackend>, String>,
    device: Device,
    preprocessor: Preprocessor,
    /// Labels of the loaded model, used when a caller has no class list of its own
    labels: Vec<String>,
    warmup_iterations: usize,
}

impl ImageClassifier {
    /// Create a classifier around a loaded backend
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        device: Device,
        labels: Vec<String>,
        image_size: u32,
    ) -> Self {
        Self {
            backend: Ok(backend),
            device,
            preprocessor: Preprocessor::new(image_size),
            labels,
            warmup_iterations: 10,
        }
    }

    /// Create a classifier whose model failed to load; every inference call errors
    pub fn unloaded(reason: impl Into<String>, device: Device, labels: Vec<String>, image_size: u32) -> Self {
        Self {
            backend: Err(reason.into()),
            device,
            preprocessor: Preprocessor::new(image_size),
            labels,
            warmup_iterations: 10,
        }
    }

    pub fn with_warmup(mut self, iterations: usize) -> Self {
        self.warmup_iterations = iterations;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_loaded(&self) -> bool {
        self.backend.is_ok()
    }

    fn backend(&self) -> Result<&dyn InferenceBackend, ClassifierError> {
        self.backend
            .as_ref()
            .map(|b| &**b)
            .map_err(|reason| ClassifierError::NotLoaded(reason.clone()))
    }

    /// Run the backend and turn logits into probabilities
    fn infer(&self, input: &[f32], batch: usize) -> Result<Vec<Vec<f32>>, ClassifierError> {
        let backend = self.backend()?;
        let logits = backend.forward(input, batch, self.preprocessor.image_size())?;
        if logits.len() != batch {
            return Err(ClassifierError::BatchMismatch {
                expected: batch,
                got: logits.len(),
            });
        }
        Ok(logits.iter().map(|row| softmax(row)).collect())
    }

    /// Classify a single image against `labels`
    pub fn predict(&self, image: &DynamicImage, labels: &[String]) -> Result<Prediction, ClassifierError> {
        let start = Instant::now();

        let tensor = self.preprocessor.tensor(image);
        let probabilities = self.infer(&tensor, 1)?.remove(0);

        let mut prediction = self.unpack(&probabilities, labels)?;
        prediction.processing_time = start.elapsed().as_secs_f64();

        debug!(
            predicted_class = %prediction.predicted_class,
            confidence = prediction.confidence,
            processing_time_ms = prediction.processing_time * 1000.0,
            device = %self.device,
            "Prediction complete"
        );

        Ok(prediction)
    }

    /// Classify images in chunks of at most `batch_size`.
    ///
    /// Per-item time is the chunk's wall time divided by the chunk size, an
    /// approximation kept compatible with previously logged data. A chunk that
    /// fails is retried image by image; an image that still fails becomes a
    /// `BatchOutcome::Failed` and the rest of the batch continues.
    pub fn predict_batch(
        &self,
        images: &[DynamicImage],
        batch_size: usize,
        labels: &[String],
    ) -> Vec<BatchOutcome> {
        let batch_size = batch_size.max(1);
        let mut outcomes = Vec::with_capacity(images.len());

        for chunk in images.chunks(batch_size) {
            match self.predict_chunk(chunk, labels) {
                Ok(predictions) => outcomes.extend(predictions.into_iter().map(BatchOutcome::Ok)),
                Err(e) => {
                    error!(
                        chunk_size = chunk.len(),
                        error = %e,
                        "Batch prediction failed, falling back to individual predictions"
                    );
                    for image in chunk {
                        let outcome = match self.predict(image, labels) {
                            Ok(prediction) => BatchOutcome::Ok(prediction),
                            Err(e) => {
                                warn!(error = %e, "Individual prediction failed");
                                BatchOutcome::Failed {
                                    error: e.to_string(),
                                    device: self.device.to_string(),
                                }
                            }
                        };
                        outcomes.push(outcome);
                    }
                }
            }
        }

        outcomes
    }

    fn predict_chunk(
        &self,
        chunk: &[DynamicImage],
        labels: &[String],
    ) -> Result<Vec<Prediction>, ClassifierError> {
        let start = Instant::now();

        let refs: Vec<&DynamicImage> = chunk.iter().collect();
        let input = self.preprocessor.batch_tensor(&refs);
        let probabilities = self.infer(&input, chunk.len())?;

        let per_item = start.elapsed().as_secs_f64() / chunk.len() as f64;

        probabilities
            .iter()
            .map(|probs| {
                let mut prediction = self.unpack(probs, labels)?;
                prediction.processing_time = per_item;
                Ok(prediction)
            })
            .collect()
    }

    /// Map one probability row onto labels.
    ///
    /// `labels` must match the model output width; otherwise the model's own
    /// labels are used when they fit.
    fn unpack(&self, probabilities: &[f32], labels: &[String]) -> Result<Prediction, ClassifierError> {
        let labels = if labels.len() == probabilities.len() {
            labels
        } else if self.labels.len() == probabilities.len() {
            warn!(
                requested = labels.len(),
                outputs = probabilities.len(),
                "Class list does not match model outputs, using model labels"
            );
            self.labels.as_slice()
        } else {
            return Err(ClassifierError::LabelMismatch {
                outputs: probabilities.len(),
                labels: labels.len(),
            });
        };
        if labels.is_empty() {
            return Err(ClassifierError::LabelMismatch {
                outputs: 0,
                labels: 0,
            });
        }

        let (best, &confidence) = probabilities
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .ok_or(ClassifierError::LabelMismatch {
                outputs: 0,
                labels: labels.len(),
            })?;

        let class_probabilities: BTreeMap<String, f32> = labels
            .iter()
            .cloned()
            .zip(probabilities.iter().copied())
            .collect();

        Ok(Prediction {
            predicted_class: labels[best].clone(),
            confidence: confidence.clamp(0.0, 1.0),
            class_probabilities,
            processing_time: 0.0,
            device: self.device.to_string(),
        })
    }

    /// Time `iterations` inferences on a fixed 224x224 red image after a warm-up
    pub fn benchmark(&self, iterations: usize) -> Result<BenchmarkReport, ClassifierError> {
        let iterations = iterations.max(1);
        let dummy = DynamicImage::ImageRgb8(RgbImage::from_pixel(224, 224, Rgb([255, 0, 0])));

        for _ in 0..self.warmup_iterations {
            self.infer(&self.preprocessor.tensor(&dummy), 1)?;
        }

        let mut timings = Vec::with_capacity(iterations);
        let start = Instant::now();
        for _ in 0..iterations {
            let iteration = Instant::now();
            self.infer(&self.preprocessor.tensor(&dummy), 1)?;
            timings.push(iteration.elapsed());
        }
        let total_time = start.elapsed().as_secs_f64();

        let (p50_ms, p95_ms, p99_ms) = percentiles_ms(&mut timings);

        Ok(BenchmarkReport {
            total_time,
            average_time_per_inference: total_time / iterations as f64,
            throughput_fps: if total_time > 0.0 {
                iterations as f64 / total_time
            } else {
                0.0
            },
            p50_ms,
            p95_ms,
            p99_ms,
            device: self.device.to_string(),
            iterations,
            warmup_iterations: self.warmup_iterations,
        })
    }

    /// Device diagnostics plus model state
    pub fn device_info(&self) -> DeviceInfo {
        let mut info = self.device.info();
        info.model_loaded = self.is_loaded();
        info.reduced_precision = self
            .backend
            .as_ref()
            .map(|b| b.reduced_precision())
            .unwrap_or(false);
        info
    }
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / logits.len().max(1) as f32; logits.len()]
    }
}

fn percentiles_ms(timings: &mut [Duration]) -> (f64, f64, f64) {
    if timings.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    timings.sort();
    let at = |p: f64| {
        let idx = ((timings.len() - 1) as f64 * p).round() as usize;
        timings[idx.min(timings.len() - 1)].as_secs_f64() * 1000.0
    };
    (at(0.50), at(0.95), at(0.99))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scores each image by its mean channel value, so bright images favour class 1
    struct MeanBackend {
        calls: Arc<AtomicUsize>,
        fail_batches_over: Option<usize>,
    }

    impl InferenceBackend for MeanBackend {
        fn forward(&self, input: &[f32], batch: usize, _image_size: u32) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_batches_over {
                if batch > limit {
                    anyhow::bail!("batch of {batch} exceeds device memory");
                }
            }
            let per_image = input.len() / batch;
            Ok(input
                .chunks(per_image)
                .map(|img| {
                    let mean = img.iter().sum::<f32>() / img.len() as f32;
                    vec![-mean, mean]
                })
                .collect())
        }
    }

    fn classifier(fail_batches_over: Option<usize>) -> (ImageClassifier, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = MeanBackend {
            calls: calls.clone(),
            fail_batches_over,
        };
        let classifier =
            ImageClassifier::new(Box::new(backend), Device::Cpu, labels(), 8).with_warmup(2);
        (classifier, calls)
    }

    fn labels() -> Vec<String> {
        vec!["dark".to_string(), "bright".to_string()]
    }

    fn solid(value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([value, value, value])))
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);

        let large = softmax(&[1000.0, 1000.0]);
        assert!((large[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_predict_label_from_class_list() {
        let (classifier, _) = classifier(None);
        let prediction = classifier.predict(&solid(255), &labels()).unwrap();
        assert_eq!(prediction.predicted_class, "bright");
        assert!((0.0..=1.0).contains(&prediction.confidence));
        assert_eq!(prediction.class_probabilities.len(), 2);
        assert_eq!(prediction.device, "cpu");

        let prediction = classifier.predict(&solid(0), &labels()).unwrap();
        assert_eq!(prediction.predicted_class, "dark");
    }

    #[test]
    fn test_predict_falls_back_to_model_labels() {
        let (classifier, _) = classifier(None);
        let four: Vec<String> = ["cat", "dog", "bird", "fish"].iter().map(|s| s.to_string()).collect();
        let prediction = classifier.predict(&solid(255), &four).unwrap();
        assert_eq!(prediction.predicted_class, "bright");
    }

    #[test]
    fn test_predict_label_mismatch() {
        let backend = MeanBackend {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_batches_over: None,
        };
        let classifier = ImageClassifier::new(Box::new(backend), Device::Cpu, vec!["only".to_string()], 8);
        let three = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let err = classifier.predict(&solid(10), &three).unwrap_err();
        assert!(matches!(err, ClassifierError::LabelMismatch { outputs: 2, labels: 3 }));
    }

    #[test]
    fn test_unloaded_classifier_errors() {
        let classifier = ImageClassifier::unloaded("missing file", Device::Cpu, labels(), 8);
        let err = classifier.predict(&solid(10), &labels()).unwrap_err();
        assert!(matches!(err, ClassifierError::NotLoaded(_)));
        assert!(err.to_string().contains("Model not loaded"));
        assert!(classifier.benchmark(10).is_err());
        assert!(!classifier.device_info().model_loaded);
    }

    #[test]
    fn test_batch_preserves_count_and_order() {
        let (classifier, calls) = classifier(None);
        let images: Vec<DynamicImage> = [0u8, 255, 0, 255, 255].iter().map(|&v| solid(v)).collect();

        let outcomes = classifier.predict_batch(&images, 2, &labels());

        assert_eq!(outcomes.len(), 5);
        let classes: Vec<&str> = outcomes
            .iter()
            .map(|o| o.prediction().unwrap().predicted_class.as_str())
            .collect();
        assert_eq!(classes, vec!["dark", "bright", "dark", "bright", "bright"]);
        // chunks of 2, 2, 1
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_batch_time_is_split_across_chunk() {
        let (classifier, _) = classifier(None);
        let images = vec![solid(1), solid(2), solid(3)];
        let outcomes = classifier.predict_batch(&images, 3, &labels());
        let times: Vec<f64> = outcomes.iter().map(|o| o.processing_time()).collect();
        assert!(times.iter().all(|&t| t == times[0]));
    }

    #[test]
    fn test_batch_falls_back_to_individual_calls() {
        let (classifier, calls) = classifier(Some(1));
        let images = vec![solid(0), solid(255), solid(0)];

        let outcomes = classifier.predict_batch(&images, 3, &labels());

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.is_ok()));
        // one failed chunk, then three single calls
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_batch_item_failure_becomes_placeholder() {
        let classifier = ImageClassifier::unloaded("no model", Device::Cpu, labels(), 8);
        let outcomes = classifier.predict_batch(&[solid(0), solid(1)], 4, &labels());
        assert_eq!(outcomes.len(), 2);
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Failed { error, device } => {
                    assert!(error.contains("no model"));
                    assert_eq!(device, "cpu");
                }
                BatchOutcome::Ok(_) => panic!("expected failure"),
            }
        }
    }

    #[test]
    fn test_benchmark_counts_warmup_and_iterations() {
        let (classifier, calls) = classifier(None);
        let report = classifier.benchmark(10).unwrap();
        assert_eq!(report.iterations, 10);
        assert_eq!(report.warmup_iterations, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 12);
        assert!(report.total_time >= 0.0);
        assert!(report.p50_ms <= report.p99_ms);
    }

    #[test]
    fn test_device_info_reports_model_state() {
        let (classifier, _) = classifier(None);
        let info = classifier.device_info();
        assert!(info.model_loaded);
        assert!(!info.reduced_precision);
        assert_eq!(info.device_type, "cpu");
    }
}
