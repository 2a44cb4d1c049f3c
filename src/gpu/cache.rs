// src/gpu/cache.rs - Kernel binary cache and compiler options
// Tree location: ./src/gpu/cache.rs

//! On-disk cache of compiled kernel binaries
//!
//! A binary is only valid for the exact options it was built with, so the
//! file name encodes every option that changes the generated code:
//! `<kernel><device>[g]lg<LG>tc<TC>w<WS>l<sizeof long>.bin`.
//!
//! # Version History
//! - 0.1.0: Fingerprinted cache files and compiler option string
//! - 0.1.1: Device names sanitized for the file system

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::tuning::DeviceTuning;

/// Pointer width baked into cache names (`sizeof(long)` of the host)
pub const HOST_LONG_BYTES: usize = std::mem::size_of::<std::os::raw::c_long>();

/// Everything that makes a compiled binary unique
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Variant binary name
    pub kernel: String,
    /// Device name as reported
    pub device: String,
    /// Global offset enabled
    pub goffset: bool,
    /// Lookup gap
    pub lookup_gap: u32,
    /// Thread concurrency
    pub thread_concurrency: u32,
    /// Work-group size
    pub work_size: u32,
    /// Host `long` width in bytes
    pub long_bytes: usize,
}

impl CacheKey {
    /// Fingerprint for a tuned device
    pub fn for_tuning(tuning: &DeviceTuning) -> Self {
        Self {
            kernel: tuning.variant.name().to_string(),
            device: tuning.device_name.clone(),
            goffset: tuning.goffset,
            lookup_gap: tuning.lookup_gap,
            thread_concurrency: tuning.thread_concurrency,
            work_size: tuning.work_size,
            long_bytes: HOST_LONG_BYTES,
        }
    }

    /// Cache file name
    pub fn file_name(&self) -> String {
        format!(
            "{}{}{}lg{}tc{}w{}l{}.bin",
            self.kernel,
            sanitize(&self.device),
            if self.goffset { "g" } else { "" },
            self.lookup_gap,
            self.thread_concurrency,
            self.work_size,
            self.long_bytes
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.file_name())
    }
}

fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

/// Compiler option string for a source build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Include path for kernel sources
    pub kernel_path: PathBuf,
    /// Lookup gap
    pub lookup_gap: u32,
    /// Thread concurrency
    pub thread_concurrency: u32,
    /// Work-group size
    pub work_size: u32,
    /// Variant specific define
    pub extra_define: Option<&'static str>,
    /// `-D BITALIGN`
    pub bitalign: bool,
    /// Quirk define such as `BFI_INT`
    pub quirk_define: Option<&'static str>,
    /// `-D GOFFSET`
    pub goffset: bool,
    /// `-D OCL1` for pre-1.1 stacks
    pub ocl1: bool,
}

impl CompileOptions {
    /// Options for a tuned device; the quirk define is added by the loader
    pub fn for_tuning(tuning: &DeviceTuning, kernel_path: &Path) -> Self {
        Self {
            kernel_path: kernel_path.to_path_buf(),
            lookup_gap: tuning.lookup_gap,
            thread_concurrency: tuning.thread_concurrency,
            work_size: tuning.work_size,
            extra_define: tuning.variant.spec().extra_define,
            bitalign: tuning.has_bit_align,
            quirk_define: None,
            goffset: tuning.goffset,
            ocl1: !tuning.has_opencl11plus,
        }
    }

    /// Same options with a quirk define
    pub fn with_quirk(mut self, define: &'static str) -> Self {
        self.quirk_define = Some(define);
        self
    }
}

impl fmt::Display for CompileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-I \"{}\" -I \".\" -D LOOKUP_GAP={} -D CONCURRENT_THREADS={} -D WORKSIZE={}",
            self.kernel_path.display(),
            self.lookup_gap,
            self.thread_concurrency,
            self.work_size
        )?;
        if let Some(define) = self.extra_define {
            write!(f, " -D {}", define)?;
        }
        if self.bitalign {
            write!(f, " -D BITALIGN")?;
        }
        if let Some(define) = self.quirk_define {
            write!(f, " -D {}", define)?;
        }
        if self.goffset {
            write!(f, " -D GOFFSET")?;
        }
        if self.ocl1 {
            write!(f, " -D OCL1")?;
        }
        Ok(())
    }
}

/// Directory of cached binaries
#[derive(Debug, Clone)]
pub struct BinaryCache {
    dir: PathBuf,
}

impl BinaryCache {
    /// Cache rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path for a key
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Cached binary, if present and non-empty
    pub fn load(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => {
                tracing::debug!("Empty binary {}, generating from source", path.display());
                None
            }
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No binary found, generating from source");
                None
            }
            Err(e) => {
                tracing::debug!("Unable to read binary {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Persist a binary
    pub fn store(&self, key: &CacheKey, binary: &[u8]) -> io::Result<PathBuf> {
        let path = self.path_for(key);
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, binary)?;
        Ok(path)
    }
}
