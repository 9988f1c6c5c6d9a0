//! Shared state handed to every request handler

use crate::service::PredictionService;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub service: Arc<PredictionService>,
    started_at: Instant,
}

impl AppState {
    pub fn new(service: PredictionService) -> Self {
        Self {
            service: Arc::new(service),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

pub type SharedState = Arc<AppState>;
