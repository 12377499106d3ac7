//! GPU detection and device pinning
//!
//! Detects available GPUs via nvidia-smi and maps the device ids of a worker
//! placement to a `CUDA_VISIBLE_DEVICES` value. Configured ids are virtual
//! indices into the detected list, which matters in containers that only
//! get a subset of the host's GPUs.

use anyhow::Result;
use std::process::Command;
use std::sync::OnceLock;

/// Cached GPU information detected at startup
static GPU_INFO: OnceLock<GpuInfo> = OnceLock::new();

/// Information about available GPUs
#[derive(Debug, Clone, Default)]
pub struct GpuInfo {
    /// GPU indices visible to this process, as reported by nvidia-smi
    pub indices: Vec<u32>,
}

impl GpuInfo {
    pub fn count(&self) -> usize {
        self.indices.len()
    }

    /// Physical index behind a configured (virtual) device id
    pub fn get_cuda_device(&self, gpu_id: u32) -> Option<u32> {
        self.indices.get(gpu_id as usize).copied()
    }

    /// `CUDA_VISIBLE_DEVICES` value for a worker pinned to `devices`.
    ///
    /// Returns `None` for an empty device set. Without detected GPUs the ids
    /// are passed through unchanged.
    pub fn visible_devices(&self, devices: &[u32]) -> Result<Option<String>> {
        if devices.is_empty() {
            return Ok(None);
        }

        let physical = if self.indices.is_empty() {
            devices.to_vec()
        } else {
            devices
                .iter()
                .map(|&id| {
                    self.get_cuda_device(id).ok_or_else(|| {
                        anyhow::anyhow!(
                            "Invalid device id {} (available: 0-{})",
                            id,
                            self.count() - 1
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        Ok(Some(
            physical
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
        ))
    }
}

/// Detect available GPUs using nvidia-smi
pub fn detect_gpus() -> GpuInfo {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let indices: Vec<u32> = stdout
                .lines()
                .filter_map(|line| line.trim().parse::<u32>().ok())
                .collect();

            tracing::info!(
                gpu_count = indices.len(),
                indices = ?indices,
                "Detected available GPUs"
            );

            GpuInfo { indices }
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                stderr = %stderr,
                "nvidia-smi failed, device ids will be passed through unchecked"
            );
            GpuInfo::default()
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to run nvidia-smi, device ids will be passed through unchecked"
            );
            GpuInfo::default()
        }
    }
}

/// Get cached GPU info, or detect if not initialized
pub fn get_or_init() -> &'static GpuInfo {
    GPU_INFO.get_or_init(detect_gpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_gpus() -> GpuInfo {
        GpuInfo {
            indices: vec![2, 5],
        }
    }

    #[test]
    fn test_gpu_info_validation() {
        let info = two_gpus();

        assert_eq!(info.count(), 2);
        assert_eq!(info.get_cuda_device(0), Some(2));
        assert_eq!(info.get_cuda_device(1), Some(5));
        assert_eq!(info.get_cuda_device(2), None);
    }

    #[test]
    fn test_visible_devices_maps_virtual_ids() {
        let info = two_gpus();

        assert_eq!(info.visible_devices(&[0]).unwrap(), Some("2".to_string()));
        assert_eq!(
            info.visible_devices(&[1, 0]).unwrap(),
            Some("5,2".to_string())
        );
        assert_eq!(info.visible_devices(&[]).unwrap(), None);
    }

    #[test]
    fn test_visible_devices_rejects_unknown_id() {
        let err = two_gpus().visible_devices(&[3]).unwrap_err();
        assert!(err.to_string().contains("Invalid device id 3"));
    }

    #[test]
    fn test_no_gpus_passes_ids_through() {
        let info = GpuInfo::default();

        assert_eq!(info.count(), 0);
        assert_eq!(
            info.visible_devices(&[0, 1]).unwrap(),
            Some("0,1".to_string())
        );
    }
}
