// src/gpu/error.rs - Device initialisation and dispatch errors
// Tree location: ./src/gpu/error.rs

//! Error types for the GPU backend
//!
//! [`InitError`] aborts initialisation of one device (the caller marks it
//! NOSTART and disables it). [`DispatchError`] is fatal for the current scan
//! pass only: the device goes SICK and a reinit is requested.

use thiserror::Error;

/// Failures while bringing a device up
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InitError {
    /// Platform or device enumeration failed
    #[error("Enumeration failed: {0}")]
    Enumeration(String),

    /// Kernel compile or link failed; carries the build log
    #[error("Kernel build failed for {kernel}:\n{log}")]
    Build {
        /// Kernel binary name being built
        kernel: String,
        /// Compiler build log
        log: String,
    },

    /// A device buffer could not be allocated
    #[error("Failed to allocate {buffer} buffer of {requested} bytes (max alloc {max_alloc}): {hint}")]
    Allocation {
        /// Buffer name (output, input, padbuffer8, hash_buffer)
        buffer: &'static str,
        /// Requested size in bytes
        requested: u64,
        /// Device maximum single allocation in bytes
        max_alloc: u64,
        /// Actionable guidance for the operator
        hint: &'static str,
    },

    /// Opcode patch could not be applied to the compiled image
    #[error("Binary patch failed: {0}")]
    Patch(String),

    /// Any other device level failure (queue or context creation, binary load)
    #[error("Device error: {0}")]
    Device(String),
}

impl InitError {
    /// Guidance attached to a scratch pad allocation failure
    pub const PAD_HINT: &'static str =
        "decrease thread concurrency or intensity, or increase lookup gap";
    /// Guidance attached to a hash buffer allocation failure
    pub const HASH_HINT: &'static str = "decrease intensity/xintensity/rawintensity";
    /// Guidance attached to small fixed buffers
    pub const GENERIC_HINT: &'static str = "check device memory and driver state";
}

/// Failures during one scan-hash iteration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Kernel argument setup or enqueue failed
    #[error("Error enqueueing {stage}: {message}")]
    Queue {
        /// Kernel stage name
        stage: String,
        /// Native error text
        message: String,
    },

    /// Result buffer read or clear failed
    #[error("Result buffer transfer failed: {0}")]
    ReadBack(String),

    /// Header upload or scratch buffer reallocation failed
    #[error("Upload failed: {0}")]
    Upload(String),
}
