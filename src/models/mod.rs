//! Image classification components

pub mod classifier;
pub mod device;
pub mod loader;
pub mod preprocess;
pub mod registry;

pub use classifier::{BenchmarkReport, ClassifierError, ImageClassifier, InferenceBackend};
pub use device::{Availability, Device, DeviceInfo};
pub use loader::ModelLoader;
pub use preprocess::Preprocessor;
pub use registry::ClassifierRegistry;
