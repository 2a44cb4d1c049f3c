// src/gpu/loader.rs - Kernel build / load pipeline
// Tree location: ./src/gpu/loader.rs

//! Turns a [`DeviceTuning`] into a built program
//!
//! # Version History
//! - 0.1.0: Cache hit / source build / persist
//! - 0.1.1: Hardware quirk patch with reload, plain rebuild on patch failure
//!
//! # Flow
//! 1. Cache hit: load the binary and build it; a bad binary falls through
//! 2. Miss: compile the `.cl` source with generated options
//! 3. Extract the binary; apply the device quirk and reload if one applies
//! 4. Persist the binary (failure is logged only)

use std::fs;
use std::path::{Path, PathBuf};

use super::cache::{BinaryCache, CacheKey, CompileOptions};
use super::error::InitError;
use super::tuning::DeviceTuning;

/// Native program operations the loader needs
pub trait ProgramBackend {
    /// Built program handle
    type Program;

    /// Create a program from a binary and build it
    fn load_binary(&self, binary: &[u8]) -> Result<Self::Program, InitError>;

    /// Compile source with compiler options; a failure carries the build log
    fn compile_source(&self, source: &str, options: &str) -> Result<Self::Program, InitError>;

    /// Read the compiled binary back out of a program
    fn extract_binary(&self, program: &Self::Program) -> Result<Vec<u8>, InitError>;
}

/// Where a loaded program came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramOrigin {
    /// Binary cache hit
    Cache,
    /// Fresh source build
    Source,
    /// Source build with a quirk patch applied
    Patched,
}

/// A built program plus how it was obtained
#[derive(Debug)]
pub struct LoadedProgram<P> {
    /// Built program
    pub program: P,
    /// Origin
    pub origin: ProgramOrigin,
    /// Cache fingerprint
    pub key: CacheKey,
}

/// Kernel loader with a binary cache
#[derive(Debug, Clone)]
pub struct KernelLoader {
    kernel_path: PathBuf,
    cache: BinaryCache,
    extract_binaries: bool,
}

impl KernelLoader {
    /// Loader reading `<kernel_path>/<source>.cl` and caching in `cache_dir`
    pub fn new(kernel_path: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            kernel_path: kernel_path.into(),
            cache: BinaryCache::new(cache_dir),
            // OSX breaks reading binaries back with more than one GPU
            extract_binaries: !cfg!(target_os = "macos"),
        }
    }

    /// Skip binary extraction, patching and persistence
    pub fn without_extraction(mut self) -> Self {
        self.extract_binaries = false;
        self
    }

    /// Kernel source directory
    pub fn kernel_path(&self) -> &Path {
        &self.kernel_path
    }

    /// Binary cache
    pub fn cache(&self) -> &BinaryCache {
        &self.cache
    }

    fn read_source(&self, tuning: &DeviceTuning) -> Result<String, InitError> {
        let path = self.kernel_path.join(format!("{}.cl", tuning.variant.spec().source));
        fs::read_to_string(&path).map_err(|e| {
            InitError::Device(format!("Unable to open kernel source {}: {}", path.display(), e))
        })
    }

    /// Build or load the program for a tuned device
    pub fn load<B: ProgramBackend>(
        &self,
        backend: &B,
        tuning: &DeviceTuning,
    ) -> Result<LoadedProgram<B::Program>, InitError> {
        let spec = tuning.variant.spec();
        if spec.experimental {
            tracing::warn!("⚠️  Kernel {} is experimental.", spec.name);
        }

        let key = CacheKey::for_tuning(tuning);
        if let Some(binary) = self.cache.load(&key) {
            match backend.load_binary(&binary) {
                Ok(program) => {
                    tracing::debug!("Loaded binary image {}", key);
                    self.log_initialising(tuning);
                    return Ok(LoadedProgram { program, origin: ProgramOrigin::Cache, key });
                }
                Err(e) => {
                    tracing::warn!("⚠️  Cached binary {} rejected ({}), generating from source", key, e);
                }
            }
        }

        let source = self.read_source(tuning)?;
        let plain = CompileOptions::for_tuning(tuning, &self.kernel_path);
        let quirk = tuning
            .quirk
            .map(|q| q.quirk())
            .filter(|_| self.extract_binaries);

        let options = match quirk {
            Some(q) => {
                tracing::debug!("{} patch requiring device found, patched source with {}", q.name(), q.compiler_define());
                plain.clone().with_quirk(q.compiler_define())
            }
            None => plain.clone(),
        };
        tracing::debug!("Setting worksize to {}", tuning.work_size);
        tracing::debug!("CompilerOptions: {}", options);

        let program = self.compile(backend, tuning, &source, &options)?;
        if !self.extract_binaries {
            self.log_initialising(tuning);
            return Ok(LoadedProgram { program, origin: ProgramOrigin::Source, key });
        }

        let mut binary = self.extract(backend, tuning, &program)?;
        let (program, origin) = match quirk {
            None => (program, ProgramOrigin::Source),
            Some(q) => match q.patch(&mut binary) {
                Ok(_) => {
                    drop(program);
                    (backend.load_binary(&binary)?, ProgramOrigin::Patched)
                }
                Err(e) => {
                    tracing::warn!("⚠️  {} patch failed ({}), rebuilding without it", q.name(), e);
                    tracing::debug!("CompilerOptions: {}", plain);
                    let rebuilt = self.compile(backend, tuning, &source, &plain)?;
                    binary = self.extract(backend, tuning, &rebuilt)?;
                    (rebuilt, ProgramOrigin::Source)
                }
            },
        };

        match self.cache.store(&key, &binary) {
            Ok(path) => tracing::debug!("Saved binary {}", path.display()),
            // We just build it again next time
            Err(e) => tracing::warn!("⚠️  Unable to create file {}: {}", key, e),
        }

        self.log_initialising(tuning);
        Ok(LoadedProgram { program, origin, key })
    }

    fn compile<B: ProgramBackend>(
        &self,
        backend: &B,
        tuning: &DeviceTuning,
        source: &str,
        options: &CompileOptions,
    ) -> Result<B::Program, InitError> {
        backend.compile_source(source, &options.to_string()).map_err(|e| {
            if let InitError::Build { log, .. } = &e {
                tracing::error!("❌ Building program {} failed:\n{}", tuning.variant, log);
            }
            e
        })
    }

    fn extract<B: ProgramBackend>(
        &self,
        backend: &B,
        tuning: &DeviceTuning,
        program: &B::Program,
    ) -> Result<Vec<u8>, InitError> {
        let binary = backend.extract_binary(program)?;
        if binary.is_empty() {
            return Err(InitError::Build {
                kernel: tuning.variant.name().to_string(),
                log: "OpenCL compiler generated a zero sized binary".to_string(),
            });
        }
        tracing::debug!("Binary size for {} is {}", tuning.device_name, binary.len());
        Ok(binary)
    }

    fn log_initialising(&self, tuning: &DeviceTuning) {
        tracing::info!(
            "🔧 Initialising kernel {}.cl with{} bitalign, {} vectors and worksize {}",
            tuning.variant.spec().source,
            if tuning.has_bit_align { "" } else { "out" },
            tuning.vector_width,
            tuning.work_size
        );
    }
}
