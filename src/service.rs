//! Prediction service: app lookup, inference, persistence and metrics.
//!
//! Every method here blocks (ONNX Runtime, SQLite, file writes), so the HTTP
//! handlers call into it from `spawn_blocking`.

use crate::config::InferenceConfig;
use crate::error::{ApiError, ApiResult};
use crate::metrics::ServiceMetrics;
use crate::models::preprocess::{decode, detect_format, extension_for};
use crate::models::{BenchmarkReport, ClassifierRegistry, DeviceInfo};
use crate::storage::UploadStorage;
use crate::store::{FeedbackUpdate, Store};
use crate::types::{
    Feedback, InputMetadata, MlApp, NewImageUpload, NewPredictionLog, PredictionLog,
    PredictionOutput,
};
use anyhow::Context;
use chrono::Utc;
use image::DynamicImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An image received in a multipart request
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Metadata about the stored input image
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    /// Bytes
    pub size: u64,
    pub format: String,
    /// Path below the upload root
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictResponse {
    pub log_id: i64,
    pub ml_app: i64,
    pub predicted_class: String,
    pub confidence: f32,
    pub class_probabilities: BTreeMap<String, f32>,
    /// Seconds
    pub processing_time: f64,
    pub device: String,
    pub image_info: ImageInfo,
}

/// One entry of a batch response; `error` is set for failed items
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub log_id: i64,
    pub filename: String,
    #[serde(flatten)]
    pub output: PredictionOutput,
    pub processing_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPredictResponse {
    pub ml_app: i64,
    pub results: Vec<BatchItem>,
    pub total_images: usize,
    pub failed_images: usize,
    pub total_processing_time: f64,
    pub average_processing_time: f64,
    pub device: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkResponse {
    pub ml_app: i64,
    #[serde(flatten)]
    pub report: BenchmarkReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfoResponse {
    pub ml_app: i64,
    /// Device the app asked for
    pub requested_device: String,
    #[serde(flatten)]
    pub info: DeviceInfo,
}

/// A decoded upload ready for inference
struct DecodedImage {
    upload: UploadedImage,
    image: DynamicImage,
    format: String,
}

/// Core request operations shared by all handlers
pub struct PredictionService {
    store: Arc<Store>,
    registry: Arc<ClassifierRegistry>,
    storage: UploadStorage,
    metrics: Arc<ServiceMetrics>,
    limits: InferenceConfig,
}

impl PredictionService {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ClassifierRegistry>,
        storage: UploadStorage,
        metrics: Arc<ServiceMetrics>,
        limits: InferenceConfig,
    ) -> Self {
        Self {
            store,
            registry,
            storage,
            metrics,
            limits,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn metrics(&self) -> &ServiceMetrics {
        &self.metrics
    }

    /// Devices with a loaded classifier
    pub fn devices(&self) -> Vec<String> {
        self.registry.devices()
    }

    pub fn list_apps(&self) -> ApiResult<Vec<MlApp>> {
        Ok(self.store.list_active_apps()?)
    }

    pub fn get_app(&self, id: i64) -> ApiResult<MlApp> {
        self.store
            .get_active_app(id)?
            .ok_or_else(|| ApiError::not_found(format!("ML app {id} not found")))
    }

    /// Active app that can serve predictions
    fn predicting_app(&self, id: i64) -> ApiResult<MlApp> {
        let app = self.get_app(id)?;
        if !app.app_type.is_supported() {
            return Err(ApiError::bad_request(format!(
                "App type '{}' is not yet supported",
                app.app_type
            )));
        }
        Ok(app)
    }

    /// Classify a single uploaded image and log the result
    pub fn predict(&self, app_id: i64, image: Option<UploadedImage>) -> ApiResult<PredictResponse> {
        let app = self.predicting_app(app_id)?;
        let upload = image.ok_or_else(|| ApiError::bad_request("No image provided"))?;
        let decoded = decode_upload(upload)?;

        let classifier = self.registry.for_app(&app);
        let prediction = classifier.predict(&decoded.image, &app.classes)?;

        let output = PredictionOutput::from(&prediction);
        let (log_id, image_info) = self
            .persist(&app, vec![(&decoded, output, prediction.processing_time)])?
            .into_iter()
            .next()
            .context("Prediction was not persisted")?;

        self.metrics.record_prediction(
            &prediction.predicted_class,
            prediction.confidence,
            prediction.processing_time,
        );

        info!(
            app_id = app.id,
            log_id,
            predicted_class = %prediction.predicted_class,
            confidence = prediction.confidence,
            processing_time_ms = prediction.processing_time * 1000.0,
            device = %prediction.device,
            "Prediction served"
        );

        Ok(PredictResponse {
            log_id,
            ml_app: app.id,
            predicted_class: prediction.predicted_class,
            confidence: prediction.confidence,
            class_probabilities: prediction.class_probabilities,
            processing_time: prediction.processing_time,
            device: prediction.device,
            image_info,
        })
    }

    /// Classify up to `max_batch_images` images in the app's batch size.
    ///
    /// Items that fail inference are still logged, with confidence 0 and the
    /// error in their output. The batch is persisted all-or-nothing.
    pub fn predict_batch(
        &self,
        app_id: i64,
        images: Vec<UploadedImage>,
    ) -> ApiResult<BatchPredictResponse> {
        let app = self.predicting_app(app_id)?;
        if images.is_empty() {
            return Err(ApiError::bad_request("No images provided"));
        }
        if images.len() > self.limits.max_batch_images {
            return Err(ApiError::bad_request(format!(
                "Maximum {} images allowed per batch",
                self.limits.max_batch_images
            )));
        }

        let decoded = images
            .into_iter()
            .map(decode_upload)
            .collect::<ApiResult<Vec<_>>>()?;
        let inputs: Vec<DynamicImage> = decoded.iter().map(|d| d.image.clone()).collect();

        let classifier = self.registry.for_app(&app);
        let outcomes = classifier.predict_batch(&inputs, app.batch_size, &app.classes);

        let mut failed = 0;
        let mut records = Vec::with_capacity(outcomes.len());
        for (item, outcome) in decoded.iter().zip(&outcomes) {
            if outcome.prediction().is_none() {
                failed += 1;
            }
            records.push((item, outcome.to_output(), outcome.processing_time()));
        }
        let persisted = self.persist(&app, records.clone())?;

        let mut results = Vec::with_capacity(records.len());
        for ((item, output, processing_time), (log_id, _)) in records.into_iter().zip(persisted) {
            results.push(BatchItem {
                log_id,
                filename: item.upload.filename.clone(),
                output,
                processing_time,
            });
        }
        for p in outcomes.iter().filter_map(|o| o.prediction()) {
            self.metrics
                .record_prediction(&p.predicted_class, p.confidence, p.processing_time);
        }
        self.metrics.record_batch(failed);

        let total_processing_time: f64 = results.iter().map(|r| r.processing_time).sum();
        let total_images = results.len();

        info!(
            app_id = app.id,
            total_images,
            failed,
            batch_size = app.batch_size,
            processing_time_ms = total_processing_time * 1000.0,
            device = %classifier.device(),
            "Batch prediction served"
        );

        Ok(BatchPredictResponse {
            ml_app: app.id,
            results,
            total_images,
            failed_images: failed,
            total_processing_time,
            average_processing_time: total_processing_time / total_images as f64,
            device: classifier.device().to_string(),
        })
    }

    pub fn device_info(&self, app_id: i64) -> ApiResult<DeviceInfoResponse> {
        let app = self.get_app(app_id)?;
        let info = self.registry.for_app(&app).device_info();
        Ok(DeviceInfoResponse {
            ml_app: app.id,
            requested_device: app.device_type.to_string(),
            info,
        })
    }

    /// Benchmark the app's classifier; `iterations` is clamped to the configured range
    pub fn benchmark(&self, app_id: i64, iterations: Option<i64>) -> ApiResult<BenchmarkResponse> {
        let app = self.get_app(app_id)?;
        let iterations = self.limits.clamp_iterations(iterations);
        let classifier = self.registry.for_app(&app);

        info!(app_id = app.id, iterations, device = %classifier.device(), "Benchmark started");
        let report = classifier.benchmark(iterations)?;
        self.metrics.record_benchmark();
        info!(
            app_id = app.id,
            throughput_fps = report.throughput_fps,
            p50_ms = report.p50_ms,
            p99_ms = report.p99_ms,
            "Benchmark complete"
        );

        Ok(BenchmarkResponse {
            ml_app: app.id,
            report,
        })
    }

    pub fn list_logs(&self, ml_app: Option<i64>) -> ApiResult<Vec<PredictionLog>> {
        Ok(self.store.list_logs(ml_app)?)
    }

    pub fn get_log(&self, id: i64) -> ApiResult<PredictionLog> {
        self.store
            .get_log(id)?
            .ok_or_else(|| ApiError::not_found(format!("Prediction log {id} not found")))
    }

    /// Record user feedback; a log accepts feedback once
    pub fn submit_feedback(&self, log_id: i64, feedback: Feedback) -> ApiResult<PredictionLog> {
        match self.store.set_feedback(log_id, feedback)? {
            FeedbackUpdate::Updated => {
                debug!(log_id, feedback = %feedback, "Feedback recorded");
                self.get_log(log_id)
            }
            FeedbackUpdate::AlreadySet(existing) => Err(ApiError::Conflict(format!(
                "Feedback already recorded as '{existing}'"
            ))),
            FeedbackUpdate::NotFound => Err(ApiError::not_found(format!(
                "Prediction log {log_id} not found"
            ))),
        }
    }

    /// Store the files, then write every log with its upload record in one
    /// transaction. Stored files are removed again if any write fails.
    fn persist(
        &self,
        app: &MlApp,
        items: Vec<(&DecodedImage, PredictionOutput, f64)>,
    ) -> ApiResult<Vec<(i64, ImageInfo)>> {
        let now = Utc::now();
        let mut stored = Vec::with_capacity(items.len());
        for (item, _, _) in &items {
            let bytes = &item.upload.bytes;
            match self.storage.save(bytes, extension_for(bytes), now) {
                Ok(file) => stored.push(file),
                Err(e) => {
                    self.storage.discard(&stored);
                    return Err(e.context("Failed to store uploaded image").into());
                }
            }
        }

        let mut records = Vec::with_capacity(items.len());
        let mut infos = Vec::with_capacity(items.len());
        for ((item, output, processing_time), file) in items.into_iter().zip(&stored) {
            let bytes = &item.upload.bytes;
            let (width, height) = (item.image.width(), item.image.height());
            let log = NewPredictionLog {
                ml_app_id: app.id,
                input: InputMetadata {
                    filename: item.upload.filename.clone(),
                    size: bytes.len() as u64,
                    format: item.format.clone(),
                },
                output,
                processing_time,
            };
            let upload = NewImageUpload {
                file_path: file.relative_path.clone(),
                width,
                height,
                file_size: bytes.len() as u64,
            };
            records.push((log, upload));
            infos.push(ImageInfo {
                filename: item.upload.filename.clone(),
                width,
                height,
                size: bytes.len() as u64,
                format: item.format.clone(),
                file_path: file.relative_path.clone(),
            });
        }

        let entries: Vec<_> = records.iter().map(|(log, upload)| (log, Some(upload))).collect();
        match self.store.record_predictions(&entries) {
            Ok(ids) => Ok(ids.into_iter().zip(infos).collect()),
            Err(e) => {
                self.storage.discard(&stored);
                Err(e.into())
            }
        }
    }
}

fn decode_upload(upload: UploadedImage) -> ApiResult<DecodedImage> {
    let image = decode(&upload.bytes).map_err(|e| {
        warn!(filename = %upload.filename, error = %e, "Rejected undecodable upload");
        ApiError::bad_request(format!("Invalid image '{}': {e:#}", upload.filename))
    })?;
    let format = detect_format(&upload.bytes)
        .map(str::to_string)
        .or_else(|| {
            upload
                .content_type
                .as_deref()
                .and_then(|ct| ct.strip_prefix("image/"))
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string());
    Ok(DecodedImage {
        upload,
        image,
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Device, ImageClassifier, InferenceBackend};
    use crate::types::{AppType, NewMlApp};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Always favours the first label
    struct FirstLabel;

    impl InferenceBackend for FirstLabel {
        fn forward(&self, _input: &[f32], batch: usize, _size: u32) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(vec![vec![2.0, 0.0]; batch])
        }
    }

    /// Fails every forward pass
    struct Broken;

    impl InferenceBackend for Broken {
        fn forward(&self, _input: &[f32], batch: usize, _size: u32) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("device lost with {batch} images queued")
        }
    }

    fn service(dir: &std::path::Path) -> (PredictionService, MlApp, MlApp) {
        let store = Store::open_in_memory().unwrap();
        store.migrate().unwrap();
        service_with(dir, store, Box::new(FirstLabel))
    }

    fn service_with(
        dir: &std::path::Path,
        store: Store,
        backend: Box<dyn InferenceBackend>,
    ) -> (PredictionService, MlApp, MlApp) {
        let pets = store
            .insert_app(&NewMlApp::image_classification("Pets", &["cat", "dog"]).with_batch_size(3))
            .unwrap();
        let mut text = NewMlApp::image_classification("Text", &["pos", "neg"]);
        text.app_type = AppType::TextClassification;
        let text = store.insert_app(&text).unwrap();

        let classifier = ImageClassifier::new(
            backend,
            Device::Cpu,
            vec!["cat".to_string(), "dog".to_string()],
            16,
        )
        .with_warmup(1);

        let service = PredictionService::new(
            Arc::new(store),
            Arc::new(ClassifierRegistry::single(classifier)),
            UploadStorage::new(dir),
            Arc::new(ServiceMetrics::new()),
            InferenceConfig::default(),
        );
        (service, pets, text)
    }

    fn png(name: &str) -> UploadedImage {
        let image = image::DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 24, Rgb([9, 9, 9])));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        UploadedImage {
            filename: name.to_string(),
            content_type: Some("image/png".to_string()),
            bytes,
        }
    }

    #[test]
    fn test_predict_logs_once() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pets, _) = service(dir.path());

        let response = service.predict(pets.id, Some(png("a.png"))).unwrap();

        assert_eq!(response.predicted_class, "cat");
        assert_eq!(response.image_info.width, 32);
        assert_eq!(response.image_info.format, "png");
        assert_eq!(service.store().count_logs().unwrap(), 1);
        assert_eq!(service.store().count_uploads().unwrap(), 1);
        assert!(dir.path().join(&response.image_info.file_path).exists());
    }

    #[test]
    fn test_predict_validation_order() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pets, text) = service(dir.path());

        let err = service.predict(text.id, Some(png("a.png"))).unwrap_err();
        assert_eq!(err.to_string(), "App type 'text_classification' is not yet supported");

        let err = service.predict(pets.id, None).unwrap_err();
        assert_eq!(err.to_string(), "No image provided");

        assert!(matches!(
            service.predict(999, Some(png("a.png"))),
            Err(ApiError::NotFound(_))
        ));

        let garbage = UploadedImage {
            filename: "x.jpg".to_string(),
            content_type: None,
            bytes: b"nope".to_vec(),
        };
        assert!(matches!(
            service.predict(pets.id, Some(garbage)),
            Err(ApiError::BadRequest(_))
        ));
        assert_eq!(service.store().count_logs().unwrap(), 0);
    }

    #[test]
    fn test_batch_limits() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pets, _) = service(dir.path());

        let eleven: Vec<_> = (0..11).map(|i| png(&format!("{i}.png"))).collect();
        let err = service.predict_batch(pets.id, eleven).unwrap_err();
        assert_eq!(err.to_string(), "Maximum 10 images allowed per batch");

        let ten: Vec<_> = (0..10).map(|i| png(&format!("{i}.png"))).collect();
        let response = service.predict_batch(pets.id, ten).unwrap();
        assert_eq!(response.total_images, 10);
        assert_eq!(response.failed_images, 0);
        assert_eq!(response.results[3].filename, "3.png");
        assert_eq!(service.store().count_logs().unwrap(), 10);
        assert_eq!(service.metrics().failed_items.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn test_feedback_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pets, _) = service(dir.path());
        let log_id = service.predict(pets.id, Some(png("a.png"))).unwrap().log_id;

        let log = service.submit_feedback(log_id, Feedback::Incorrect).unwrap();
        assert_eq!(log.feedback, Some(Feedback::Incorrect));
        assert!(matches!(
            service.submit_feedback(log_id, Feedback::Correct),
            Err(ApiError::Conflict(_))
        ));
    }

    #[test]
    fn test_benchmark_clamps_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let (service, pets, _) = service(dir.path());
        assert_eq!(service.benchmark(pets.id, Some(5)).unwrap().report.iterations, 10);
        assert_eq!(service.benchmark(pets.id, Some(500)).unwrap().report.iterations, 200);
    }

    #[test]
    fn test_failed_batch_items_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        store.migrate().unwrap();
        let (service, pets, _) = service_with(dir.path(), store, Box::new(Broken));

        let images: Vec<_> = (0..3).map(|i| png(&format!("{i}.png"))).collect();
        let response = service.predict_batch(pets.id, images).unwrap();

        assert_eq!(response.total_images, 3);
        assert_eq!(response.failed_images, 3);
        assert_eq!(service.store().count_logs().unwrap(), 3);
        assert_eq!(service.metrics().failed_items.load(std::sync::atomic::Ordering::Relaxed), 3);

        for item in &response.results {
            assert_eq!(item.output.confidence, 0.0);
            assert!(item.output.error.is_some());
            let log = service.get_log(item.log_id).unwrap();
            assert_eq!(log.confidence, 0.0);
            assert!(log.output_data.error.unwrap().contains("device lost"));
        }
    }

    fn stored_files(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .map(|path| if path.is_dir() { stored_files(&path) } else { 1 })
            .sum()
    }

    #[test]
    fn test_failed_write_leaves_no_files() {
        let db_dir = tempfile::tempdir().unwrap();
        let uploads = tempfile::tempdir().unwrap();
        let db_path = db_dir.path().join("app.db");
        let store = Store::open(&db_path).unwrap();
        store.migrate().unwrap();
        let (service, pets, _) = service_with(uploads.path(), store, Box::new(FirstLabel));

        rusqlite::Connection::open(&db_path)
            .unwrap()
            .execute_batch("DROP TABLE image_uploads;")
            .unwrap();

        let images: Vec<_> = (0..3).map(|i| png(&format!("{i}.png"))).collect();
        let err = service.predict_batch(pets.id, images).unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));
        assert!(matches!(
            service.predict(pets.id, Some(png("a.png"))),
            Err(ApiError::Internal(_))
        ));

        assert_eq!(service.store().count_logs().unwrap(), 0);
        assert_eq!(stored_files(uploads.path()), 0);
    }
}
