// src/lib.rs - Main library file for the oclscan OpenCL scan-hash backend
// Tree location: ./src/lib.rs

//! oclscan - OpenCL scan-hash backend for GPU proof-of-work mining
//!
//! Enumerates OpenCL GPU devices, builds or loads cached kernel binaries per
//! device and tuning fingerprint, and drives the scan-hash dispatch loop with
//! adaptive intensity. A single supervisor thread restarts sick devices one
//! at a time.
//!
//! # Version History
//! - 0.1.0: Device registry, sizing controller, binary cache, reinit supervisor
//!
//! The native compute API sits behind [`gpu::ComputeDevice`] and
//! [`gpu::ProgramBackend`]; the `opencl` feature supplies the `ocl`-backed
//! implementation.

#![warn(missing_docs)]
// Note: OpenCL kernel enqueue and non-blocking reads are unsafe in ocl
#![allow(unsafe_code)]

/// Configuration module for per-device settings
pub mod config;
/// GPU device management, kernel loading and dispatch
pub mod gpu;

// Re-export main types for convenience
pub use config::{Settings, SettingsError};
pub use gpu::{
    DeviceHealth, DeviceRegistry, DispatchError, InitError, Intensity, KernelVariant, Miner,
    ScanHasher, WorkItem,
};

use thiserror::Error;

/// Main error type for oclscan
#[derive(Error, Debug)]
pub enum OclScanError {
    /// Settings parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(#[from] SettingsError),

    /// Device initialisation errors (enumeration, build, allocation)
    #[error("Init error: {0}")]
    Init(#[from] InitError),

    /// Per-iteration dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// OpenCL runtime errors
    #[error("OpenCL error: {0}")]
    OpenCL(String),

    /// Malformed work item
    #[error("Invalid work: {0}")]
    Work(String),

    /// Worker thread management errors
    #[error("Thread error: {0}")]
    Thread(String),

    /// IO operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hex decode errors for headers and targets
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

// Implement conversion from OCL errors
#[cfg(feature = "opencl")]
impl From<ocl::Error> for OclScanError {
    fn from(err: ocl::Error) -> Self {
        OclScanError::OpenCL(format!("OpenCL operation failed: {}", err))
    }
}

/// Result type alias for oclscan operations
pub type Result<T> = std::result::Result<T, OclScanError>;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Application name from Cargo.toml
pub const NAME: &str = env!("CARGO_PKG_NAME");
/// Application description from Cargo.toml
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Initialize logging
///
/// `default_filter` is used when `RUST_LOG` is not set.
pub fn init(default_filter: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| OclScanError::Thread(format!("Failed to install log subscriber: {}", e)))?;

    tracing::info!("{} v{} - {}", NAME, VERSION, DESCRIPTION);

    Ok(())
}
