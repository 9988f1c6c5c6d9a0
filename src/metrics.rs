//! Prediction metrics and statistics tracking for the inference service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for served predictions
pub struct ServiceMetrics {
    /// Total images classified successfully
    pub predictions: AtomicU64,
    /// Total batch requests served
    pub batch_requests: AtomicU64,
    /// Batch items that produced an error outcome
    pub failed_items: AtomicU64,
    /// Benchmarks run
    pub benchmarks: AtomicU64,
    /// Predictions by class label
    predictions_by_class: RwLock<HashMap<String, u64>>,
    /// Processing times (in microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Confidence distribution buckets
    confidence_buckets: RwLock<[u64; 10]>,
    /// Start time for rate calculation
    start_time: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            predictions: AtomicU64::new(0),
            batch_requests: AtomicU64::new(0),
            failed_items: AtomicU64::new(0),
            benchmarks: AtomicU64::new(0),
            predictions_by_class: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            confidence_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    /// Record one successful classification
    pub fn record_prediction(&self, predicted_class: &str, confidence: f32, processing_time: f64) {
        self.predictions.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut times) = self.processing_times.write() {
            times.push((processing_time.max(0.0) * 1_000_000.0).round() as u64);
            // Keep only last 10000 for memory efficiency
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }

        let bucket = ((confidence.clamp(0.0, 1.0) * 10.0) as usize).min(9);
        if let Ok(mut buckets) = self.confidence_buckets.write() {
            buckets[bucket] += 1;
        }

        if let Ok(mut by_class) = self.predictions_by_class.write() {
            *by_class.entry(predicted_class.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_batch(&self, failed: usize) {
        self.batch_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_items.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn record_benchmark(&self) {
        self.benchmarks.fetch_add(1, Ordering::Relaxed);
    }

    /// Get processing time statistics
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let sorted = match self.processing_times.read() {
            Ok(times) if !times.is_empty() => {
                let mut sorted = times.clone();
                sorted.sort_unstable();
                sorted
            }
            _ => return ProcessingStats::default(),
        };

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();
        let at = |p: f64| sorted[((count as f64 * p) as usize).min(count - 1)];

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: sorted[count / 2],
            p95_us: at(0.95),
            p99_us: at(0.99),
            max_us: sorted[count - 1],
        }
    }

    /// Predictions per second since startup
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.predictions.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_confidence_distribution(&self) -> [u64; 10] {
        self.confidence_buckets
            .read()
            .map(|buckets| *buckets)
            .unwrap_or_default()
    }

    pub fn get_predictions_by_class(&self) -> HashMap<String, u64> {
        self.predictions_by_class
            .read()
            .map(|by_class| by_class.clone())
            .unwrap_or_default()
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let predictions = self.predictions.load(Ordering::Relaxed);
        let batches = self.batch_requests.load(Ordering::Relaxed);
        let failed = self.failed_items.load(Ordering::Relaxed);
        let benchmarks = self.benchmarks.load(Ordering::Relaxed);

        let processing = self.get_processing_stats();
        let throughput = self.get_throughput();
        let by_class = self.get_predictions_by_class();
        let distribution = self.get_confidence_distribution();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║             ML APP INFERENCE SERVICE - METRICS SUMMARY       ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Predictions:     {:>8}  │  Throughput: {:>8.2} img/s     ║",
            predictions, throughput
        );
        info!(
            "║ Batch Requests:  {:>8}  │  Failed Items: {:>8}         ║",
            batches, failed
        );
        info!("║ Benchmarks:      {:>8}                                     ║", benchmarks);
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Processing Time (μs): mean={:>6} p50={:>6} p95={:>6} p99={:>6} max={:>6} ║",
            processing.mean_us,
            processing.p50_us,
            processing.p95_us,
            processing.p99_us,
            processing.max_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Predictions by Class:                                        ║");
        let mut classes: Vec<_> = by_class.iter().collect();
        classes.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (class, count) in classes {
            let pct = if predictions > 0 {
                (*count as f64 / predictions as f64) * 100.0
            } else {
                0.0
            };
            info!("║   {:12}: {:>6} ({:>5.1}%)", class, count, pct);
        }
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Confidence Distribution:                                     ║");
        let total: u64 = distribution.iter().sum();
        for (i, &count) in distribution.iter().enumerate() {
            let pct = if total > 0 { (count as f64 / total as f64) * 100.0 } else { 0.0 };
            let bar: String = "█".repeat(((pct / 2.0) as usize).min(20));
            info!(
                "║   {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Processing time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Logs a metrics summary on a fixed interval
pub struct MetricsReporter {
    metrics: Arc<ServiceMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<ServiceMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // the first tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = ServiceMetrics::new();

        metrics.record_prediction("cat", 0.95, 0.010);
        metrics.record_prediction("dog", 0.55, 0.020);
        metrics.record_prediction("cat", 1.0, 0.030);
        metrics.record_batch(1);

        assert_eq!(metrics.predictions.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.batch_requests.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.failed_items.load(Ordering::Relaxed), 1);

        let by_class = metrics.get_predictions_by_class();
        assert_eq!(by_class["cat"], 2);
        assert_eq!(by_class["dog"], 1);

        let distribution = metrics.get_confidence_distribution();
        assert_eq!(distribution[9], 2);
        assert_eq!(distribution[5], 1);
    }

    #[test]
    fn test_processing_stats() {
        let metrics = ServiceMetrics::new();
        assert_eq!(metrics.get_processing_stats().count, 0);

        for ms in 1..=100 {
            metrics.record_prediction("cat", 0.5, ms as f64 / 1000.0);
        }

        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.max_us, 100_000);
        assert!(stats.p50_us <= stats.p95_us && stats.p95_us <= stats.p99_us);
        assert!(stats.p99_us <= stats.max_us);
    }
}
