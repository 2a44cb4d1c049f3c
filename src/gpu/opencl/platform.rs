// src/gpu/opencl/platform.rs - OpenCL Platform Detection and Device Probing
// Tree location: ./src/gpu/opencl/platform.rs

//! OpenCL platform detection and device capability probing
//!
//! # Version History
//! - 0.1.0: Platform listing with vendor detection
//! - 0.1.1: Platform selection by GPU count with an id override
//! - 0.1.2: Capability probe feeding the tuning derivation
//!
//! # Platform Selection
//! - `platform_id` set: that platform, an error if it does not exist
//! - otherwise: the platform reporting the most GPU devices, first one on a tie

use std::fmt;

use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::{Device, DeviceType, Platform};
use serde::Serialize;

use crate::gpu::error::InitError;
use crate::gpu::tuning::{ClVersion, DeviceProbe};

/// GPU vendor identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpuVendor {
    /// NVIDIA GPUs
    Nvidia,
    /// AMD GPUs
    Amd,
    /// Intel GPUs
    Intel,
    /// Unknown or other vendors
    Unknown,
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Detect the vendor from a platform name
pub fn detect_vendor(platform_name: &str) -> GpuVendor {
    let name = platform_name.to_lowercase();
    if name.contains("nvidia") || name.contains("cuda") {
        GpuVendor::Nvidia
    } else if name.contains("amd") || name.contains("advanced micro devices") || name.contains("ati") {
        GpuVendor::Amd
    } else if name.contains("intel") {
        GpuVendor::Intel
    } else {
        GpuVendor::Unknown
    }
}

/// One platform as reported to the operator
#[derive(Debug, Clone, Serialize)]
pub struct PlatformSummary {
    /// Index in the platform list
    pub index: usize,
    /// Platform name
    pub name: String,
    /// Vendor guessed from the name
    pub vendor: GpuVendor,
    /// Platform version string
    pub version: String,
    /// GPU device names
    pub gpus: Vec<String>,
}

/// Pick a platform index from per-platform GPU counts
pub fn pick_platform(gpu_counts: &[usize], platform_id: Option<usize>) -> Result<usize, InitError> {
    if gpu_counts.is_empty() {
        return Err(InitError::Enumeration("No OpenCL platforms found".to_string()));
    }

    let index = match platform_id {
        Some(id) if id >= gpu_counts.len() => {
            return Err(InitError::Enumeration(format!(
                "Specified platform {} does not exist ({} platform(s) found)",
                id,
                gpu_counts.len()
            )));
        }
        Some(id) => id,
        None => {
            let mut best = 0;
            for (i, &count) in gpu_counts.iter().enumerate() {
                if count > gpu_counts[best] {
                    best = i;
                }
            }
            best
        }
    };

    if gpu_counts[index] == 0 {
        return Err(InitError::Enumeration(format!("Platform {} has no GPU devices", index)));
    }
    Ok(index)
}

/// Platform listing and capability queries
pub struct PlatformDetector {
    platforms: Vec<Platform>,
}

impl PlatformDetector {
    /// List every OpenCL platform
    pub fn new() -> Result<Self, InitError> {
        let platforms = Platform::list();
        if platforms.is_empty() {
            return Err(InitError::Enumeration(
                "No OpenCL platforms found. Please install GPU drivers.".to_string(),
            ));
        }
        tracing::debug!("🔍 Found {} OpenCL platform(s)", platforms.len());
        Ok(Self { platforms })
    }

    fn gpus(platform: &Platform) -> Result<Vec<Device>, InitError> {
        Device::list(platform, Some(DeviceType::GPU))
            .map_err(|e| InitError::Enumeration(format!("Failed to list devices: {}", e)))
    }

    /// Every platform with its GPU devices
    pub fn list_all(&self) -> Vec<PlatformSummary> {
        self.platforms
            .iter()
            .enumerate()
            .map(|(index, platform)| {
                let name = platform.name().unwrap_or_default();
                let gpus = match Self::gpus(platform) {
                    Ok(devices) => devices.iter().map(|d| d.name().unwrap_or_default()).collect(),
                    Err(e) => {
                        tracing::warn!("⚠️  Platform {} detection failed: {}", index, e);
                        Vec::new()
                    }
                };
                PlatformSummary {
                    index,
                    vendor: detect_vendor(&name),
                    name,
                    version: platform.version().unwrap_or_default(),
                    gpus,
                }
            })
            .collect()
    }

    /// Selected platform and its GPU devices
    pub fn select(&self, platform_id: Option<usize>) -> Result<(Platform, Vec<Device>), InitError> {
        let mut devices = Vec::with_capacity(self.platforms.len());
        for (i, platform) in self.platforms.iter().enumerate() {
            match Self::gpus(platform) {
                Ok(list) => devices.push(list),
                Err(e) => {
                    tracing::warn!("⚠️  Platform {} detection failed: {}", i, e);
                    devices.push(Vec::new());
                }
            }
        }

        let counts: Vec<usize> = devices.iter().map(Vec::len).collect();
        let index = pick_platform(&counts, platform_id)?;
        let platform = self.platforms[index];
        tracing::info!(
            "✅ Platform {}: {} ({} GPU devices)",
            index,
            platform.name().unwrap_or_default(),
            counts[index]
        );
        Ok((platform, devices.swap_remove(index)))
    }

    /// Query the capabilities the tuning derivation needs
    pub fn probe(device: &Device) -> Result<DeviceProbe, InitError> {
        let name = match query(device, DeviceInfo::Name)? {
            DeviceInfoResult::Name(s) => s,
            other => return Err(unexpected("name", other)),
        };
        let extensions = match query(device, DeviceInfo::Extensions)? {
            DeviceInfoResult::Extensions(s) => s,
            other => return Err(unexpected("extensions", other)),
        };
        let version = match query(device, DeviceInfo::Version)? {
            DeviceInfoResult::Version(v) => ClVersion::parse(&format!("OpenCL {}", v)).unwrap_or_default(),
            other => return Err(unexpected("version", other)),
        };
        let preferred_vector_width = match query(device, DeviceInfo::PreferredVectorWidthInt)? {
            DeviceInfoResult::PreferredVectorWidthInt(v) => v,
            other => return Err(unexpected("preferred vector width", other)),
        };
        let max_work_group_size = match query(device, DeviceInfo::MaxWorkGroupSize)? {
            DeviceInfoResult::MaxWorkGroupSize(v) => v.min(u32::MAX as usize) as u32,
            other => return Err(unexpected("max work group size", other)),
        };
        let compute_units = match query(device, DeviceInfo::MaxComputeUnits)? {
            DeviceInfoResult::MaxComputeUnits(v) => v,
            other => return Err(unexpected("compute units", other)),
        };
        let max_alloc = match query(device, DeviceInfo::MaxMemAllocSize)? {
            DeviceInfoResult::MaxMemAllocSize(v) => v,
            other => return Err(unexpected("max alloc", other)),
        };

        tracing::debug!(
            "  📱 {}: {} CUs, max work group {}, max alloc {}MB",
            name,
            compute_units,
            max_work_group_size,
            max_alloc / (1024 * 1024)
        );

        Ok(DeviceProbe {
            name,
            extensions,
            version,
            preferred_vector_width,
            max_work_group_size,
            compute_units,
            max_alloc,
        })
    }
}

fn query(device: &Device, info: DeviceInfo) -> Result<DeviceInfoResult, InitError> {
    let label = format!("{:?}", info);
    device
        .info(info)
        .map_err(|e| InitError::Device(format!("Failed to query device {}: {}", label, e)))
}

fn unexpected(what: &str, got: DeviceInfoResult) -> InitError {
    InitError::Device(format!("Unexpected device {} info: {:?}", what, got))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_detection() {
        assert_eq!(detect_vendor("NVIDIA CUDA"), GpuVendor::Nvidia);
        assert_eq!(detect_vendor("AMD Accelerated Parallel Processing"), GpuVendor::Amd);
        assert_eq!(detect_vendor("Intel(R) OpenCL"), GpuVendor::Intel);
        assert_eq!(detect_vendor("Clover"), GpuVendor::Unknown);
    }

    #[test]
    fn test_most_gpus_wins() {
        assert_eq!(pick_platform(&[1, 3, 2], None).unwrap(), 1);
        // first platform on a tie
        assert_eq!(pick_platform(&[2, 2], None).unwrap(), 0);
    }

    #[test]
    fn test_override() {
        assert_eq!(pick_platform(&[4, 1], Some(1)).unwrap(), 1);
        assert!(matches!(pick_platform(&[4, 1], Some(2)), Err(InitError::Enumeration(_))));
    }

    #[test]
    fn test_no_gpus() {
        assert!(pick_platform(&[], None).is_err());
        assert!(pick_platform(&[0, 0], None).is_err());
        assert!(pick_platform(&[3, 0], Some(1)).is_err());
    }

    #[test]
    fn test_probe_real_device() {
        // Skip when no OpenCL runtime is installed
        let Ok(detector) = PlatformDetector::new() else {
            return;
        };
        let Ok((_, devices)) = detector.select(None) else {
            return;
        };
        let probe = PlatformDetector::probe(&devices[0]).unwrap();
        assert!(!probe.name.is_empty());
        assert!(probe.max_work_group_size > 0);
    }
}
