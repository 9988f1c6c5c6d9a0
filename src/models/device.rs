//! Compute device selection and diagnostics
//!
//! Devices map onto ONNX Runtime execution providers. Every accelerated
//! device keeps the CPU provider registered behind it so unsupported
//! operators still run.

use crate::types::app::DevicePreference;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider,
    ExecutionProviderDispatch,
};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// Execution target a classifier is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// General-purpose processor
    Cpu,
    /// NVIDIA GPU through the CUDA provider
    Cuda,
    /// Apple Neural Engine / GPU through the CoreML provider
    CoreMl,
}

/// Which accelerated providers the linked ONNX Runtime can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Availability {
    pub cuda: bool,
    pub coreml: bool,
}

impl Availability {
    /// Probe the ONNX Runtime build for usable providers
    pub fn detect() -> Self {
        let cuda = CUDAExecutionProvider::default().is_available().unwrap_or(false);
        let coreml = CoreMLExecutionProvider::default()
            .is_available()
            .unwrap_or(false);
        info!(cuda, coreml, "Execution provider availability detected");
        Self { cuda, coreml }
    }

    /// Availability with only the CPU provider
    pub fn cpu_only() -> Self {
        Self::default()
    }
}

impl Device {
    /// Resolve an app's device preference against what is available.
    ///
    /// `auto` picks CUDA, then CoreML, then CPU. An explicit accelerator that
    /// is not available falls back to the CPU.
    pub fn select(preference: DevicePreference, available: Availability) -> Self {
        match preference {
            DevicePreference::Auto => {
                if available.cuda {
                    Device::Cuda
                } else if available.coreml {
                    Device::CoreMl
                } else {
                    Device::Cpu
                }
            }
            DevicePreference::Cuda if available.cuda => Device::Cuda,
            DevicePreference::Mps if available.coreml => Device::CoreMl,
            DevicePreference::Cpu => Device::Cpu,
            requested => {
                warn!(
                    requested = %requested,
                    "Requested device not available, falling back to CPU"
                );
                Device::Cpu
            }
        }
    }

    /// Whether a float16 model variant may be used on this device
    pub fn supports_reduced_precision(&self) -> bool {
        matches!(self, Device::Cuda)
    }

    /// Identifier reported in prediction results
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::CoreMl => "mps",
        }
    }

    /// Execution providers to register, in priority order
    pub fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        match self {
            Device::Cpu => vec![CPUExecutionProvider::default().build()],
            Device::Cuda => vec![
                CUDAExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ],
            Device::CoreMl => vec![
                CoreMLExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ],
        }
    }

    /// Live diagnostics for this device
    pub fn info(&self) -> DeviceInfo {
        let mut info = DeviceInfo {
            device_type: self.as_str().to_string(),
            device_name: self.as_str().to_string(),
            ..DeviceInfo::default()
        };

        match self {
            Device::Cpu => {}
            Device::Cuda => {
                info.cuda_available = Some(true);
                match query_gpus() {
                    Some(gpus) if !gpus.is_empty() => {
                        let gpu = &gpus[0];
                        info.cuda_device_count = Some(gpus.len());
                        info.cuda_device_name = Some(gpu.name.clone());
                        info.cuda_memory_total = Some(format_gb(gpu.memory_total_mb));
                        info.cuda_memory_allocated = Some(format_gb(gpu.memory_used_mb));
                        info.cuda_memory_cached = gpu.memory_reserved_mb.map(format_gb);
                    }
                    _ => warn!("nvidia-smi unavailable, GPU memory not reported"),
                }
            }
            Device::CoreMl => {
                info.mps_available = Some(true);
            }
        }

        info
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device diagnostics returned by the device-info endpoint
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceInfo {
    pub device_type: String,
    pub device_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_device_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_memory_total: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_memory_allocated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_memory_cached: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mps_available: Option<bool>,
    /// Whether the float16 model variant is in use
    pub reduced_precision: bool,
    pub model_loaded: bool,
}

/// One row of `nvidia-smi` output
#[derive(Debug, Clone, PartialEq)]
struct GpuRow {
    name: String,
    memory_total_mb: f64,
    memory_used_mb: f64,
    memory_reserved_mb: Option<f64>,
}

fn query_gpus() -> Option<Vec<GpuRow>> {
    let output = std::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let mut gpus = parse_gpu_rows(&String::from_utf8_lossy(&output.stdout));

    // memory.reserved is missing on older drivers, so it is queried on its own
    if let Ok(reserved) = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=memory.reserved", "--format=csv,noheader,nounits"])
        .output()
    {
        if reserved.status.success() {
            let stdout = String::from_utf8_lossy(&reserved.stdout);
            for (gpu, line) in gpus.iter_mut().zip(stdout.lines()) {
                gpu.memory_reserved_mb = line.trim().parse().ok();
            }
        }
    }

    Some(gpus)
}

fn parse_gpu_rows(stdout: &str) -> Vec<GpuRow> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 3 {
                return None;
            }
            Some(GpuRow {
                name: parts[0].to_string(),
                memory_total_mb: parts[1].parse().ok()?,
                memory_used_mb: parts[2].parse().ok()?,
                memory_reserved_mb: None,
            })
        })
        .collect()
}

fn format_gb(mb: f64) -> String {
    format!("{:.1}GB", mb / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: Availability = Availability {
        cuda: true,
        coreml: true,
    };

    #[test]
    fn test_auto_prefers_cuda() {
        assert_eq!(Device::select(DevicePreference::Auto, ALL), Device::Cuda);
        let apple = Availability {
            cuda: false,
            coreml: true,
        };
        assert_eq!(Device::select(DevicePreference::Auto, apple), Device::CoreMl);
        assert_eq!(
            Device::select(DevicePreference::Auto, Availability::cpu_only()),
            Device::Cpu
        );
    }

    #[test]
    fn test_explicit_preferences() {
        assert_eq!(Device::select(DevicePreference::Cpu, ALL), Device::Cpu);
        assert_eq!(Device::select(DevicePreference::Mps, ALL), Device::CoreMl);
        assert_eq!(
            Device::select(DevicePreference::Cuda, Availability::cpu_only()),
            Device::Cpu
        );
    }

    #[test]
    fn test_reduced_precision_only_on_cuda() {
        assert!(Device::Cuda.supports_reduced_precision());
        assert!(!Device::Cpu.supports_reduced_precision());
        assert!(!Device::CoreMl.supports_reduced_precision());
    }

    #[test]
    fn test_cpu_info_has_no_gpu_fields() {
        let info = Device::Cpu.info();
        assert!(info.cuda_memory_total.is_none());

        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("cuda_memory_total").is_none());
        assert!(json.get("cuda_memory_allocated").is_none());
        assert!(json.get("cuda_memory_cached").is_none());
        assert_eq!(json["device_type"], "cpu");
    }

    #[test]
    fn test_parse_gpu_rows() {
        let rows = parse_gpu_rows("NVIDIA GeForce RTX 3080, 10240, 1536\nbroken line\n");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "NVIDIA GeForce RTX 3080");
        assert_eq!(rows[0].memory_total_mb, 10240.0);
        assert_eq!(format_gb(rows[0].memory_total_mb), "10.0GB");
        assert_eq!(format_gb(rows[0].memory_used_mb), "1.5GB");
    }
}
