//! Classifiers shared by request handlers, built once at startup

use crate::config::ModelConfig;
use crate::models::classifier::ImageClassifier;
use crate::models::device::{Availability, Device};
use crate::models::loader::ModelLoader;
use crate::types::app::{DevicePreference, MlApp};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Identifies one loaded classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassifierKey {
    pub device: Device,
    pub reduced_precision: bool,
}

/// Classifiers keyed by device and precision
pub struct ClassifierRegistry {
    /// Device each preference resolved to at startup
    resolved: HashMap<DevicePreference, Device>,
    classifiers: HashMap<ClassifierKey, Arc<ImageClassifier>>,
    /// Serves apps whose own classifier is missing
    default: Arc<ImageClassifier>,
    /// Whether a float16 model is configured at all
    fp16_configured: bool,
}

impl ClassifierRegistry {
    /// Load one classifier per distinct device/precision among `apps`, plus the
    /// default `auto` classifier.
    pub fn build(config: &ModelConfig, apps: &[MlApp], available: Availability) -> Self {
        let loader = ModelLoader::new(config.intra_threads);
        let resolved = resolve_all(available);
        let fp16_configured = config.fp16_model_path.is_some();

        let default_device = resolved
            .get(&DevicePreference::Auto)
            .copied()
            .unwrap_or(Device::Cpu);
        let default_key = ClassifierKey {
            device: default_device,
            reduced_precision: false,
        };
        let default = Arc::new(loader.load_classifier(config, default_device, false));

        let mut registry = Self {
            resolved,
            classifiers: HashMap::from([(default_key, default.clone())]),
            default,
            fp16_configured,
        };

        let wanted: Vec<ClassifierKey> = apps
            .iter()
            .filter(|app| app.is_active && app.app_type.is_supported())
            .map(|app| registry.key_for(app.device_type, app.use_mixed_precision))
            .collect();

        for key in wanted {
            if registry.classifiers.contains_key(&key) {
                continue;
            }
            let classifier = loader.load_classifier(config, key.device, key.reduced_precision);
            registry.classifiers.insert(key, Arc::new(classifier));
        }

        info!(
            classifiers = registry.classifiers.len(),
            devices = ?registry.devices(),
            "Classifier registry ready"
        );

        registry
    }

    /// A registry that serves every app with `classifier`
    pub fn single(classifier: ImageClassifier) -> Self {
        let device = classifier.device();
        let key = ClassifierKey {
            device,
            reduced_precision: false,
        };
        let default = Arc::new(classifier);
        Self {
            resolved: DevicePreference::ALL.iter().map(|&p| (p, device)).collect(),
            classifiers: HashMap::from([(key, default.clone())]),
            default,
            fp16_configured: false,
        }
    }

    fn key_for(&self, preference: DevicePreference, mixed_precision: bool) -> ClassifierKey {
        let device = self
            .resolved
            .get(&preference)
            .copied()
            .unwrap_or(Device::Cpu);
        ClassifierKey {
            device,
            reduced_precision: mixed_precision
                && self.fp16_configured
                && device.supports_reduced_precision(),
        }
    }

    /// Classifier serving `app`, falling back to the default one
    pub fn for_app(&self, app: &MlApp) -> Arc<ImageClassifier> {
        let key = self.key_for(app.device_type, app.use_mixed_precision);
        match self.classifiers.get(&key) {
            Some(classifier) => classifier.clone(),
            None => {
                warn!(
                    app_id = app.id,
                    device = %key.device,
                    "No classifier loaded for app device, using default"
                );
                self.default_classifier()
            }
        }
    }

    pub fn default_classifier(&self) -> Arc<ImageClassifier> {
        self.default.clone()
    }

    /// Devices with a loaded classifier
    pub fn devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .classifiers
            .keys()
            .map(|key| {
                if key.reduced_precision {
                    format!("{}-fp16", key.device)
                } else {
                    key.device.to_string()
                }
            })
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }
}

fn resolve_all(available: Availability) -> HashMap<DevicePreference, Device> {
    DevicePreference::ALL
        .iter()
        .map(|&p| (p, Device::select(p, available)))
        .collect()
}
