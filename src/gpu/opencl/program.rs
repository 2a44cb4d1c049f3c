// src/gpu/opencl/program.rs - Program build and binary extraction over ocl
// Tree location: ./src/gpu/opencl/program.rs

//! [`ProgramBackend`] for one OpenCL device
//!
//! # Version History
//! - 0.1.0: Source build with compiler options, binary load
//! - 0.1.1: Binary extraction for the cache and quirk patching

use ocl::enums::{ProgramInfo, ProgramInfoResult};
use ocl::{Context, Device, Program};

use crate::gpu::error::InitError;
use crate::gpu::loader::ProgramBackend;

/// Builds programs for one device in one context
#[derive(Debug, Clone)]
pub struct OclProgramBackend {
    context: Context,
    device: Device,
    kernel: String,
}

impl OclProgramBackend {
    /// Backend for `device`; `kernel` names the variant in build errors
    pub fn new(context: Context, device: Device, kernel: impl Into<String>) -> Self {
        Self {
            context,
            device,
            kernel: kernel.into(),
        }
    }

    fn build_error(&self, e: ocl::Error) -> InitError {
        // ocl folds the device build log into the error text
        InitError::Build {
            kernel: self.kernel.clone(),
            log: e.to_string(),
        }
    }
}

impl ProgramBackend for OclProgramBackend {
    type Program = Program;

    fn load_binary(&self, binary: &[u8]) -> Result<Program, InitError> {
        let binaries = [binary];
        Program::builder()
            .devices(self.device)
            .binaries(&binaries)
            .build(&self.context)
            .map_err(|e| self.build_error(e))
    }

    fn compile_source(&self, source: &str, options: &str) -> Result<Program, InitError> {
        Program::builder()
            .devices(self.device)
            .src(source)
            .cmplr_opt(options)
            .build(&self.context)
            .map_err(|e| self.build_error(e))
    }

    fn extract_binary(&self, program: &Program) -> Result<Vec<u8>, InitError> {
        match program.info(ProgramInfo::Binaries) {
            Ok(ProgramInfoResult::Binaries(mut binaries)) => {
                if binaries.len() > 1 {
                    tracing::debug!("Program holds {} binaries, keeping the first", binaries.len());
                }
                if binaries.is_empty() {
                    return Err(InitError::Device("Program returned no binaries".to_string()));
                }
                Ok(binaries.swap_remove(0))
            }
            Ok(other) => Err(InitError::Device(format!("Unexpected program info: {:?}", other))),
            Err(e) => Err(InitError::Device(format!("Failed to read program binaries: {}", e))),
        }
    }
}
