// src/gpu/opencl/mod.rs - OpenCL Module Organization and Public API
// Tree location: ./src/gpu/opencl/mod.rs

//! OpenCL backend
//!
//! Implements the native seams of the GPU backend with `ocl`.
//!
//! # Version History
//! - 0.1.0: Platform detection and device probing
//! - 0.1.1: Program backend for the kernel loader
//! - 0.1.2: Device runtime and factory for the miner
//!
//! # Module Organization
//! - `platform`: platform selection and capability probe
//! - `program`: source build, binary load and extraction
//! - `context`: per-thread queue, buffers and kernels
//!
//! # Usage Example
//! ```no_run
//! use std::sync::Arc;
//! use oclscan::gpu::{LogHealth, LogSink, Miner, OpenClFactory};
//! use oclscan::Settings;
//!
//! # fn main() -> oclscan::Result<()> {
//! let settings = Settings::default();
//! let factory = Arc::new(OpenClFactory::new(&settings));
//! let descriptors = settings.descriptors_for(&factory.device_names()?)?;
//! let miner = Miner::start(
//!     factory,
//!     descriptors,
//!     settings.miner_options(),
//!     Arc::new(LogSink),
//!     Arc::new(LogHealth),
//! )?;
//! miner.shutdown()
//! # }
//! ```

/// Device runtime and factory
pub mod context;
/// Platform selection and probing
pub mod platform;
/// Program backend for the kernel loader
pub mod program;

pub use context::{OclDevice, OpenClFactory};
pub use platform::{detect_vendor, pick_platform, GpuVendor, PlatformDetector, PlatformSummary};
pub use program::OclProgramBackend;
