// src/config/settings.rs - Global options and per-device parameter lists
// Tree location: ./src/config/settings.rs

//! Backend settings
//!
//! Per-device parameters are comma-separated lists, one entry per device in
//! enumeration order. A single entry applies to every device; devices past
//! the end of a longer list keep their defaults.
//!
//! # Version History
//! - 0.1.0: Kernel, vector, work size, lookup gap and thread concurrency lists
//! - 0.1.1: Intensity modes, vendor passthrough, JSON settings file

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gpu::device::{DeviceDescriptor, Intensity, IntensityError};
use crate::gpu::miner::MinerOptions;
use crate::gpu::sizing::DEFAULT_DYNAMIC_INTERVAL_MS;
use crate::gpu::variant::KernelVariant;

/// Most worker threads per device
pub const MAX_GPU_THREADS: usize = 10;

/// Settings parsing and validation failures
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The list had no entries
    #[error("Invalid parameters for {param}")]
    Empty {
        /// Parameter name
        param: &'static str,
    },

    /// An entry failed validation
    #[error("Invalid value '{value}' passed to {param} for GPU {device}")]
    InvalidValue {
        /// Parameter name
        param: &'static str,
        /// Position in the list
        device: usize,
        /// Offending token
        value: String,
    },

    /// An intensity entry of 0
    #[error("{param} disabled for GPU {device}")]
    Disabled {
        /// Parameter name
        param: &'static str,
        /// Position in the list
        device: usize,
    },

    /// Settings file could not be read
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Settings file is not valid JSON
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Main configuration settings for the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Platform index override; None picks the platform with the most GPUs
    pub platform_id: Option<usize>,
    /// Directory holding the `.cl` kernel sources
    pub kernel_path: PathBuf,
    /// Directory for compiled binaries
    pub cache_dir: PathBuf,
    /// Dynamic intensity target per scan call, in milliseconds
    pub dynamic_interval_ms: u64,
    /// Kernel variant per device
    pub kernel: Option<String>,
    /// Worker threads per device (1..=10)
    pub gpu_threads: Option<String>,
    /// Vector width per device (1, 2 or 4)
    pub vectors: Option<String>,
    /// Work-group size per device (1..=9999)
    pub worksize: Option<String>,
    /// Shader count per device
    pub shaders: Option<String>,
    /// Scrypt lookup gap per device
    pub lookup_gap: Option<String>,
    /// Scrypt thread concurrency per device
    pub thread_concurrency: Option<String>,
    /// Intensity per device, `d` for dynamic
    pub intensity: Option<String>,
    /// Shader based intensity per device
    pub xintensity: Option<String>,
    /// Raw intensity per device
    pub rawintensity: Option<String>,
    /// Engine clock per device (passthrough)
    pub gpu_engine: Option<String>,
    /// Memory clock per device (passthrough)
    pub gpu_memclock: Option<String>,
    /// Fan speed per device (passthrough)
    pub gpu_fan: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            platform_id: None,
            kernel_path: PathBuf::from("kernel"),
            cache_dir: PathBuf::from("."),
            dynamic_interval_ms: DEFAULT_DYNAMIC_INTERVAL_MS,
            kernel: None,
            gpu_threads: None,
            vectors: None,
            worksize: None,
            shaders: None,
            lookup_gap: None,
            thread_concurrency: None,
            intensity: None,
            xintensity: None,
            rawintensity: None,
            gpu_engine: None,
            gpu_memclock: None,
            gpu_fan: None,
        }
    }
}

/// Split and validate a comma-separated list
///
/// Entries are trimmed; `parse` gets the entry and its position and returns
/// a [`SettingsError`] for the offending token.
pub fn parse_list<T>(
    param: &'static str,
    raw: &str,
    mut parse: impl FnMut(&str, usize) -> Result<T, SettingsError>,
) -> Result<Vec<T>, SettingsError> {
    let values = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(device, token)| parse(token, device))
        .collect::<Result<Vec<_>, _>>()?;
    if values.is_empty() {
        return Err(SettingsError::Empty { param });
    }
    Ok(values)
}

fn invalid(param: &'static str, device: usize, value: &str) -> SettingsError {
    SettingsError::InvalidValue {
        param,
        device,
        value: value.to_string(),
    }
}

fn number<T: std::str::FromStr>(param: &'static str, token: &str, device: usize) -> Result<T, SettingsError> {
    token.parse().map_err(|_| invalid(param, device, token))
}

fn ranged(param: &'static str, token: &str, device: usize, lo: u32, hi: u32) -> Result<u32, SettingsError> {
    let v: u32 = number(param, token, device)?;
    if v < lo || v > hi {
        return Err(invalid(param, device, token));
    }
    Ok(v)
}

fn intensity_error(param: &'static str, device: usize, token: &str, e: IntensityError) -> SettingsError {
    match e {
        IntensityError::Disabled => SettingsError::Disabled { param, device },
        IntensityError::OutOfRange { .. } => invalid(param, device, token),
    }
}

/// Write `values` onto `devices`, broadcasting a single entry
fn assign<T: Clone>(devices: &mut [DeviceDescriptor], values: Vec<T>, mut set: impl FnMut(&mut DeviceDescriptor, T)) {
    if values.len() > devices.len() {
        tracing::debug!("{} list entries for {} devices, extra ignored", values.len(), devices.len());
    }
    if let [single] = values.as_slice() {
        for d in devices.iter_mut() {
            set(d, single.clone());
        }
    } else {
        for (d, v) in devices.iter_mut().zip(values) {
            set(d, v);
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = serde_json::from_str(&text)?;
        tracing::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Dynamic intensity target per scan call
    pub fn dynamic_interval(&self) -> Duration {
        Duration::from_millis(self.dynamic_interval_ms.max(1))
    }

    /// Loop timing for [`crate::gpu::Miner`]
    pub fn miner_options(&self) -> MinerOptions {
        MinerOptions {
            dynamic_interval: self.dynamic_interval(),
            ..MinerOptions::default()
        }
    }

    /// Descriptors for `count` devices named by position
    pub fn descriptors(&self, count: usize) -> Result<Vec<DeviceDescriptor>, SettingsError> {
        let names: Vec<String> = (0..count).map(|i| format!("GPU {}", i)).collect();
        self.descriptors_for(&names)
    }

    /// Descriptors for enumerated device names
    pub fn descriptors_for(&self, names: &[String]) -> Result<Vec<DeviceDescriptor>, SettingsError> {
        let mut devices: Vec<DeviceDescriptor> = names
            .iter()
            .enumerate()
            .map(|(id, name)| DeviceDescriptor::new(id, name.clone()))
            .collect();
        self.apply(&mut devices)?;
        Ok(devices)
    }

    /// Apply every configured list to `devices`
    ///
    /// Intensity lists apply in the order intensity, xintensity,
    /// rawintensity; the last one configured for a device wins.
    pub fn apply(&self, devices: &mut [DeviceDescriptor]) -> Result<(), SettingsError> {
        if let Some(raw) = &self.kernel {
            let values = parse_list("kernel", raw, |t, i| {
                t.parse::<KernelVariant>().map_err(|_| invalid("kernel", i, t))
            })?;
            assign(devices, values, |d, v| d.kernel = v);
        }
        if let Some(raw) = &self.gpu_threads {
            let values = parse_list("gpu-threads", raw, |t, i| {
                ranged("gpu-threads", t, i, 1, MAX_GPU_THREADS as u32)
            })?;
            assign(devices, values, |d, v| d.threads = v as usize);
        }
        if let Some(raw) = &self.vectors {
            let values = parse_list("vectors", raw, |t, i| match number::<u32>("vectors", t, i)? {
                v @ (1 | 2 | 4) => Ok(v),
                _ => Err(invalid("vectors", i, t)),
            })?;
            assign(devices, values, |d, v| d.vector_width = v);
        }
        if let Some(raw) = &self.worksize {
            let values = parse_list("worksize", raw, |t, i| ranged("worksize", t, i, 1, 9999))?;
            assign(devices, values, |d, v| d.work_size = v);
        }
        if let Some(raw) = &self.shaders {
            let values = parse_list("shaders", raw, |t, i| number::<u32>("shaders", t, i))?;
            assign(devices, values, |d, v| d.shaders = v);
        }
        if let Some(raw) = &self.lookup_gap {
            let values = parse_list("lookup-gap", raw, |t, i| number::<u32>("lookup-gap", t, i))?;
            assign(devices, values, |d, v| d.lookup_gap = v);
        }
        if let Some(raw) = &self.thread_concurrency {
            let values = parse_list("thread-concurrency", raw, |t, i| {
                number::<u32>("thread-concurrency", t, i)
            })?;
            assign(devices, values, |d, v| d.thread_concurrency = v);
        }
        self.apply_intensity(devices)?;
        self.apply_vendor(devices)?;
        Ok(())
    }

    fn apply_intensity(&self, devices: &mut [DeviceDescriptor]) -> Result<(), SettingsError> {
        if let Some(raw) = &self.intensity {
            let values = parse_list("intensity", raw, |t, i| {
                if t.starts_with(['d', 'D']) {
                    return Ok(None);
                }
                let v: i32 = number("intensity", t, i)?;
                Intensity::fixed(v)
                    .map(Some)
                    .map_err(|e| intensity_error("intensity", i, t, e))
            })?;
            assign(devices, values, |d, v| match v {
                Some(mode) => d.set_mode(mode),
                None => d.set_dynamic(),
            });
        }
        if let Some(raw) = &self.xintensity {
            let values = parse_list("xintensity", raw, |t, i| {
                let v: u32 = number("xintensity", t, i)?;
                Intensity::shader(v).map_err(|e| intensity_error("xintensity", i, t, e))
            })?;
            assign(devices, values, |d, v| d.set_mode(v));
        }
        if let Some(raw) = &self.rawintensity {
            let values = parse_list("rawintensity", raw, |t, i| {
                let v: u32 = number("rawintensity", t, i)?;
                Intensity::raw(v).map_err(|e| intensity_error("rawintensity", i, t, e))
            })?;
            assign(devices, values, |d, v| d.set_mode(v));
        }
        Ok(())
    }

    fn apply_vendor(&self, devices: &mut [DeviceDescriptor]) -> Result<(), SettingsError> {
        let text = |t: &str, _| Ok::<_, SettingsError>(t.to_string());
        if let Some(raw) = &self.gpu_engine {
            assign(devices, parse_list("gpu-engine", raw, text)?, |d, v| d.vendor.engine = Some(v));
        }
        if let Some(raw) = &self.gpu_memclock {
            assign(devices, parse_list("gpu-memclock", raw, text)?, |d, v| d.vendor.memclock = Some(v));
        }
        if let Some(raw) = &self.gpu_fan {
            assign(devices, parse_list("gpu-fan", raw, text)?, |d, v| d.vendor.fan = Some(v));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_single_value_broadcasts() {
        let settings = Settings {
            worksize: Some("128".to_string()),
            kernel: Some("X11Mod".to_string()),
            ..Default::default()
        };
        let devices = settings.descriptors(3).unwrap();
        assert!(devices.iter().all(|d| d.work_size == 128));
        assert!(devices.iter().all(|d| d.kernel == KernelVariant::X11Mod));
    }

    #[test]
    fn test_short_list_leaves_defaults() {
        let settings = Settings {
            lookup_gap: Some("2, 3".to_string()),
            thread_concurrency: Some("8192,16384,24576,32768".to_string()),
            ..Default::default()
        };
        let devices = settings.descriptors(3).unwrap();
        assert_eq!(devices[0].lookup_gap, 2);
        assert_eq!(devices[1].lookup_gap, 3);
        assert_eq!(devices[2].lookup_gap, 0);
        assert_eq!(devices[2].thread_concurrency, 24576);
    }

    #[test]
    fn test_validation_ranges() {
        let bad = |f: fn(&mut Settings)| {
            let mut s = Settings::default();
            f(&mut s);
            s.descriptors(2).unwrap_err()
        };
        assert!(matches!(
            bad(|s| s.vectors = Some("1,3".into())),
            SettingsError::InvalidValue { param: "vectors", device: 1, .. }
        ));
        assert!(matches!(
            bad(|s| s.worksize = Some("10000".into())),
            SettingsError::InvalidValue { param: "worksize", .. }
        ));
        assert!(matches!(
            bad(|s| s.intensity = Some("32".into())),
            SettingsError::InvalidValue { param: "intensity", .. }
        ));
        assert!(matches!(
            bad(|s| s.gpu_threads = Some("11".into())),
            SettingsError::InvalidValue { param: "gpu-threads", .. }
        ));
        assert!(matches!(
            bad(|s| s.kernel = Some("sha256d".into())),
            SettingsError::InvalidValue { param: "kernel", .. }
        ));
        assert!(matches!(bad(|s| s.shaders = Some(" , ".into())), SettingsError::Empty { .. }));
    }

    #[test]
    fn test_zero_intensity_is_disabled() {
        for (param, f) in [
            ("intensity", (|s: &mut Settings| s.intensity = Some("13,0".into())) as fn(&mut Settings)),
            ("xintensity", |s: &mut Settings| s.xintensity = Some("0".into())),
            ("rawintensity", |s: &mut Settings| s.rawintensity = Some("0".into())),
        ] {
            let mut s = Settings::default();
            f(&mut s);
            match s.descriptors(2) {
                Err(SettingsError::Disabled { param: p, .. }) => assert_eq!(p, param),
                other => panic!("expected disabled for {}, got {:?}", param, other.map(|d| d.len())),
            }
        }
    }

    #[test]
    fn test_intensity_modes() {
        let settings = Settings {
            intensity: Some("d,18".to_string()),
            rawintensity: Some("1048576,".to_string()),
            ..Default::default()
        };
        let devices = settings.descriptors(2).unwrap();
        // the single raw entry broadcasts and overrides both
        assert_eq!(devices[0].intensity(), Intensity::Raw(1 << 20));
        assert_eq!(devices[1].intensity(), Intensity::Raw(1 << 20));

        let settings = Settings {
            intensity: Some("D,18".to_string()),
            ..Default::default()
        };
        let devices = settings.descriptors(2).unwrap();
        assert!(devices[0].intensity().is_dynamic());
        assert_eq!(devices[1].intensity(), Intensity::Fixed(18));
    }

    #[test]
    fn test_vendor_passthrough() {
        let settings = Settings {
            gpu_engine: Some("1000-1100".to_string()),
            gpu_fan: Some("50,60".to_string()),
            ..Default::default()
        };
        let devices = settings.descriptors(2).unwrap();
        assert_eq!(devices[1].vendor.engine.as_deref(), Some("1000-1100"));
        assert_eq!(devices[1].vendor.fan.as_deref(), Some("60"));
        assert_eq!(devices[0].vendor.memclock, None);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"platform_id": 1, "intensity": "20", "dynamic_interval_ms": 10}}"#).unwrap();
        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.platform_id, Some(1));
        assert_eq!(settings.dynamic_interval(), Duration::from_millis(10));
        assert_eq!(settings.kernel_path, PathBuf::from("kernel"));

        assert!(matches!(
            Settings::from_file("/nonexistent/oclscan.json"),
            Err(SettingsError::Io { .. })
        ));
    }
}
