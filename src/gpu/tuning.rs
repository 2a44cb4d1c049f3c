// src/gpu/tuning.rs - Device capability probe and derived tuning
// Tree location: ./src/gpu/tuning.rs

//! Per-device tuning derived from configuration plus queried capabilities
//!
//! # Version History
//! - 0.1.0: Work size, lookup gap and thread concurrency derivation
//! - 0.1.1: Scratch pad and hash buffer sizing with allocation checks
//!
//! The probe is filled by the native backend; everything here is plain
//! arithmetic so it can be tested without a GPU.

use serde::{Deserialize, Serialize};

use super::device::{DeviceDescriptor, RuntimeSummary};
use super::error::InitError;
use super::quirks::{self, QuirkId};
use super::variant::KernelVariant;

/// Work-group size used when none is configured or the device can't take it
pub const DEFAULT_WORK_SIZE: u32 = 256;
/// Lookup gap used when none is configured
pub const DEFAULT_LOOKUP_GAP: u32 = 2;
/// Shaders per compute unit
pub const SHADERS_PER_CU: u32 = 64;
/// Bytes per thread in the chained hash buffer
pub const HASH_BYTES_PER_THREAD: u64 = 64;
/// Input buffer size in bytes
pub const INPUT_BUFFER_BYTES: usize = 128;
/// Extension that provides `amd_bitalign`
pub const BITALIGN_EXTENSION: &str = "cl_amd_media_ops";

/// OpenCL version parsed from `CL_DEVICE_VERSION` ("OpenCL 1.2 AMD-APP ...")
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ClVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
}

impl ClVersion {
    /// Parse the version out of a device version string
    pub fn parse(version: &str) -> Option<Self> {
        let rest = version.trim().strip_prefix("OpenCL")?.trim_start();
        let number = rest.split_whitespace().next()?;
        let (major, minor) = number.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

/// Capabilities queried from one device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProbe {
    /// Device name
    pub name: String,
    /// Space separated extension list
    pub extensions: String,
    /// Device OpenCL version
    pub version: ClVersion,
    /// Preferred int vector width
    pub preferred_vector_width: u32,
    /// Maximum work-group size
    pub max_work_group_size: u32,
    /// Compute units
    pub compute_units: u32,
    /// Maximum single allocation in bytes
    pub max_alloc: u64,
}

impl DeviceProbe {
    /// `amd_bitalign` available
    pub fn has_bit_align(&self) -> bool {
        self.extensions.split_whitespace().any(|e| e == BITALIGN_EXTENSION)
    }

    /// OpenCL 1.1 or newer
    pub fn opencl11plus(&self) -> bool {
        self.version >= ClVersion { major: 1, minor: 1 }
    }

    /// OpenCL 1.2 or newer
    pub fn opencl12plus(&self) -> bool {
        self.version >= ClVersion { major: 1, minor: 2 }
    }

    /// Compute units times 64
    pub fn compute_shaders(&self) -> u32 {
        self.compute_units.saturating_mul(SHADERS_PER_CU)
    }

    /// Preferred vector width after the usual clamps; informational only
    pub fn clamped_vector_width(&self) -> u32 {
        if self.name.contains("Tahiti") {
            1
        } else {
            self.preferred_vector_width.clamp(1, 2)
        }
    }
}

/// Final per-device tuning handed to the loader and the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTuning {
    /// Device name, used in the cache fingerprint
    pub device_name: String,
    /// Kernel pipeline
    pub variant: KernelVariant,
    /// Vector width in use; always 1, the kernels are scalar and the
    /// configured `vectors` value is kept on the descriptor only
    pub vector_width: u32,
    /// Work-group size in use
    pub work_size: u32,
    /// Scrypt lookup gap
    pub lookup_gap: u32,
    /// Scrypt thread concurrency
    pub thread_concurrency: u32,
    /// Compute shaders
    pub compute_shaders: u32,
    /// Global nonce offset supported
    pub goffset: bool,
    /// `amd_bitalign` available
    pub has_bit_align: bool,
    /// OpenCL 1.1 or newer
    pub has_opencl11plus: bool,
    /// Hardware quirk to apply after compile
    pub quirk: Option<QuirkId>,
    /// Maximum single allocation in bytes
    pub max_alloc: u64,
}

/// Auto thread concurrency from the allocation limit and shader count
pub fn auto_thread_concurrency(max_alloc: u64, shaders: u32) -> u32 {
    let sixtyfours = (max_alloc / 131_072 / 64).saturating_sub(1);
    let mut tc = (sixtyfours * 64).min(u32::MAX as u64) as u32;
    if shaders > 0 && tc > shaders {
        tc -= tc % shaders;
        tc = tc.min(shaders.saturating_mul(5));
    }
    tc
}

/// Combine configured values with the probed capabilities
pub fn derive_tuning(desc: &DeviceDescriptor, probe: &DeviceProbe) -> DeviceTuning {
    let spec = desc.kernel.spec();

    let configured_ws = spec.forced_work_size.unwrap_or(desc.work_size);
    let work_size = if configured_ws > 0 && configured_ws <= probe.max_work_group_size {
        configured_ws
    } else {
        DEFAULT_WORK_SIZE
    };

    let lookup_gap = match (spec.forced_lookup_gap, desc.lookup_gap) {
        (Some(forced), _) => forced,
        (None, 0) => {
            tracing::debug!("GPU {}: selecting lookup gap of {}", desc.id, DEFAULT_LOOKUP_GAP);
            DEFAULT_LOOKUP_GAP
        }
        (None, lg) => lg,
    };

    let thread_concurrency = if desc.thread_concurrency == 0 {
        let tc = auto_thread_concurrency(probe.max_alloc, desc.shaders);
        tracing::debug!("GPU {}: selecting thread concurrency of {}", desc.id, tc);
        tc
    } else {
        desc.thread_concurrency
    };

    tracing::debug!(
        "GPU {}: preferred vector width {} (clamped {}), kernels run scalar",
        desc.id,
        probe.preferred_vector_width,
        probe.clamped_vector_width()
    );

    let has_bit_align = probe.has_bit_align();
    let quirk = quirks::select_quirk(probe);

    DeviceTuning {
        device_name: probe.name.clone(),
        variant: desc.kernel,
        vector_width: 1,
        work_size,
        lookup_gap,
        thread_concurrency,
        compute_shaders: probe.compute_shaders(),
        goffset: true,
        has_bit_align,
        has_opencl11plus: probe.opencl11plus(),
        quirk,
        max_alloc: probe.max_alloc,
    }
}

impl DeviceTuning {
    /// Scrypt scratch pad: `128 * ceil(1024 / lg) * tc` bytes
    pub fn pad_buffer_size(&self) -> u64 {
        let lg = self.lookup_gap.max(1) as u64;
        let ipt = 1024u64.div_ceil(lg);
        128 * ipt * self.thread_concurrency as u64
    }

    /// Values published on the descriptor once the runtime is up
    pub fn summary(&self) -> RuntimeSummary {
        RuntimeSummary {
            compute_shaders: self.compute_shaders,
            work_size: self.work_size,
            vector_width: self.vector_width,
            max_alloc: self.max_alloc,
        }
    }
}

/// Chained hash buffer size for a batch of `threads`
pub fn hash_buffer_size(threads: u64) -> u64 {
    HASH_BYTES_PER_THREAD.saturating_mul(threads)
}

/// Reject hash buffers that are empty or over the allocation limit
pub fn check_hash_buffer(threads: u64, max_alloc: u64) -> Result<u64, InitError> {
    let size = hash_buffer_size(threads);
    if size == 0 || size > max_alloc {
        tracing::warn!("⚠️  Maximum buffer memory device supports says {}", max_alloc);
        tracing::warn!("⚠️  Your settings come to {}", size);
        return Err(InitError::Allocation {
            buffer: "hash_buffer",
            requested: size,
            max_alloc,
            hint: InitError::HASH_HINT,
        });
    }
    Ok(size)
}
