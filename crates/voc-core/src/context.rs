//! Execution-context selection.
//!
//! Device choice is resolved once, before any stage runs, and the
//! resulting context is passed explicitly into graph materialization and
//! execution calls. Nothing here is process-global.

use serde::{Deserialize, Serialize};

/// Compute device for graph execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Device {
    /// CPU backend
    Cpu,
    /// GPU backend with a device index
    Gpu(usize),
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Gpu(id) => write!(f, "GPU:{}", id),
        }
    }
}

/// Execution context owned by a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Selected compute device
    pub device: Device,
}

impl ExecutionContext {
    /// Resolves the context from an optional GPU index.
    ///
    /// A requested GPU that is not present falls back to CPU with a
    /// warning rather than failing the run.
    pub fn resolve(gpu: Option<usize>) -> Self {
        let device = match gpu {
            Some(id) if gpu_available() => Device::Gpu(id),
            Some(id) => {
                tracing::warn!("GPU {id} requested but not available, falling back to CPU");
                Device::Cpu
            }
            None => Device::Cpu,
        };
        tracing::info!("execution context initialized on {device}");
        Self { device }
    }
}

/// Probes for an NVIDIA GPU.
fn gpu_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
            || std::env::var("CUDA_VISIBLE_DEVICES").is_ok()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
