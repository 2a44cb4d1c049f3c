// src/gpu/mod.rs - GPU Module Organization and Public API
// Tree location: ./src/gpu/mod.rs

//! GPU compute backend
//!
//! Everything between "here is a device and a work item" and "here are the
//! candidate nonces": kernel build and cache, workload sizing, the scan-hash
//! loop, device restarts and the operator command path.
//!
//! # Module Organization
//! - `device`, `variant`, `tuning`: what a device is and how it is configured
//! - `quirks`, `cache`, `loader`: turning kernel source into a program
//! - `runtime`, `sizing`, `dispatch`: one scan-hash iteration
//! - `registry`, `supervisor`, `control`, `worker`, `miner`: threads and state
//! - `opencl`: the `ocl` implementation of the native seams (feature `opencl`)

/// Device descriptor, intensity modes, health
pub mod device;

/// Error types
pub mod error;

/// Kernel variant table
pub mod variant;

/// Derived per-device tuning
pub mod tuning;

/// Hardware quirks (BFI_INT opcode patch)
pub mod quirks;

/// Compile fingerprint and binary cache
pub mod cache;

/// Build/load pipeline
pub mod loader;

/// Native runtime seam and work items
pub mod runtime;

/// Workload sizing controller
pub mod sizing;

/// Scan-hash dispatch loop
pub mod dispatch;

/// Result and health hooks
pub mod hooks;

/// Device registry
pub mod registry;

/// Reinit supervisor
pub mod supervisor;

/// Operator command path
pub mod control;

/// Per-thread mining loop
pub mod worker;

/// Backend wiring
pub mod miner;

/// OpenCL backend
#[cfg(feature = "opencl")]
pub mod opencl;

#[cfg(test)]
pub(crate) mod testing;

pub use control::{ControlError, ControlHandle, IntensityRequest, OperatorCommand};
pub use device::{DeviceDescriptor, DeviceHealth, HashRate, Intensity, IntensityError, RuntimeSummary};
pub use dispatch::ScanHasher;
pub use error::{DispatchError, InitError};
pub use hooks::{Candidates, ChannelSink, HealthObserver, LogHealth, LogSink, ResultSink};
pub use loader::{KernelLoader, ProgramBackend, ProgramOrigin};
pub use miner::{Miner, MinerOptions};
pub use registry::DeviceRegistry;
pub use runtime::{ComputeDevice, WorkItem};
pub use supervisor::{DeviceFactory, ReinitHandle};
pub use tuning::{DeviceProbe, DeviceTuning};
pub use variant::{HashFamily, KernelVariant};

#[cfg(feature = "opencl")]
pub use opencl::{OpenClFactory, PlatformDetector};
