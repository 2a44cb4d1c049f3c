// src/gpu/device.rs - Device descriptor, intensity modes and health
// Tree location: ./src/gpu/device.rs

//! Per-device descriptor shared between the worker threads, the operator
//! command path and the reinit supervisor
//!
//! # Version History
//! - 0.1.0: Descriptor with intensity modes and health state machine
//! - 0.1.1: Rolling hash rate with exponential decay
//!
//! # Intensity Modes
//! - **Fixed / Dynamic**: batch is `2^intensity` threads
//! - **Shader** (xintensity): batch is `compute_shaders * xintensity`
//! - **Raw** (rawintensity): batch is the raw thread count
//!
//! The modes are variants of one enum so exactly one of them can be active.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use std::fmt;

use super::variant::KernelVariant;

/// Lowest intensity the sizing controller will use
pub const MIN_INTENSITY: i32 = 4;
/// Highest intensity the sizing controller will use
pub const MAX_INTENSITY: i32 = 31;
/// Intensity applied when none is configured
pub const DEFAULT_INTENSITY: i32 = 13;
/// Lowest shader based intensity
pub const MIN_XINTENSITY: u32 = 1;
/// Highest shader based intensity
pub const MAX_XINTENSITY: u32 = 9999;
/// Lowest raw intensity
pub const MIN_RAWINTENSITY: u32 = 1;
/// Highest raw intensity
pub const MAX_RAWINTENSITY: u32 = 2_147_483_647;

/// Time constant for the rolling hash rate, in seconds
pub const HASH_RATE_DECAY_SECS: f64 = 5.0;

/// Active intensity mode of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "lowercase")]
pub enum Intensity {
    /// Fixed `2^n` batch
    Fixed(i32),
    /// `2^n` batch retuned toward the dynamic interval
    Dynamic(i32),
    /// Shader based intensity (xintensity)
    Shader(u32),
    /// Raw thread count (rawintensity)
    Raw(u32),
}

impl Default for Intensity {
    fn default() -> Self {
        Intensity::Fixed(DEFAULT_INTENSITY)
    }
}

impl Intensity {
    /// Plain intensity, 0 when a shader or raw mode is active
    pub fn intensity(&self) -> i32 {
        match self {
            Intensity::Fixed(v) | Intensity::Dynamic(v) => *v,
            _ => 0,
        }
    }

    /// Shader based intensity, 0 when inactive
    pub fn xintensity(&self) -> u32 {
        match self {
            Intensity::Shader(v) => *v,
            _ => 0,
        }
    }

    /// Raw intensity, 0 when inactive
    pub fn rawintensity(&self) -> u32 {
        match self {
            Intensity::Raw(v) => *v,
            _ => 0,
        }
    }

    /// True when the dynamic tuner owns the value
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Intensity::Dynamic(_))
    }

    /// Mutable access to the `2^n` exponent, if the mode has one
    pub(crate) fn exponent_mut(&mut self) -> Option<&mut i32> {
        match self {
            Intensity::Fixed(v) | Intensity::Dynamic(v) => Some(v),
            _ => None,
        }
    }

    /// Validated fixed intensity
    pub fn fixed(value: i32) -> Result<Self, IntensityError> {
        match value {
            0 => Err(IntensityError::Disabled),
            v if (MIN_INTENSITY..=MAX_INTENSITY).contains(&v) => Ok(Intensity::Fixed(v)),
            v => Err(IntensityError::OutOfRange {
                mode: "intensity",
                value: v as i64,
                min: MIN_INTENSITY as i64,
                max: MAX_INTENSITY as i64,
            }),
        }
    }

    /// Validated shader based intensity
    pub fn shader(value: u32) -> Result<Self, IntensityError> {
        match value {
            0 => Err(IntensityError::Disabled),
            v if (MIN_XINTENSITY..=MAX_XINTENSITY).contains(&v) => Ok(Intensity::Shader(v)),
            v => Err(IntensityError::OutOfRange {
                mode: "xintensity",
                value: v as i64,
                min: MIN_XINTENSITY as i64,
                max: MAX_XINTENSITY as i64,
            }),
        }
    }

    /// Validated raw intensity
    pub fn raw(value: u32) -> Result<Self, IntensityError> {
        match value {
            0 => Err(IntensityError::Disabled),
            v if (MIN_RAWINTENSITY..=MAX_RAWINTENSITY).contains(&v) => Ok(Intensity::Raw(v)),
            v => Err(IntensityError::OutOfRange {
                mode: "rawintensity",
                value: v as i64,
                min: MIN_RAWINTENSITY as i64,
                max: MAX_RAWINTENSITY as i64,
            }),
        }
    }

    /// Dynamic mode starting from the current exponent, or the default
    pub fn dynamic_from(current: &Intensity) -> Self {
        match current {
            Intensity::Fixed(v) | Intensity::Dynamic(v) => Intensity::Dynamic(*v),
            _ => Intensity::Dynamic(DEFAULT_INTENSITY),
        }
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intensity::Fixed(v) => write!(f, "{}", v),
            Intensity::Dynamic(v) => write!(f, "d ({})", v),
            Intensity::Shader(v) => write!(f, "x{}", v),
            Intensity::Raw(v) => write!(f, "r{}", v),
        }
    }
}

/// Rejected intensity values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntensityError {
    /// A literal 0 was given
    #[error("disabled")]
    Disabled,
    /// Value outside the mode's range
    #[error("Invalid value {value} passed to set {mode} ({min} -> {max})")]
    OutOfRange {
        /// Mode name
        mode: &'static str,
        /// Offending value
        value: i64,
        /// Lower bound
        min: i64,
        /// Upper bound
        max: i64,
    },
}

/// Device health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceHealth {
    /// Initialising or restarting
    Init,
    /// Mining normally
    Well,
    /// Dispatch failed; awaiting restart
    Sick,
    /// Declared dead by the watchdog
    Dead,
    /// Initialisation failed
    NoStart,
}

impl DeviceHealth {
    /// Transitions allowed without an explicit restart
    pub fn can_transition(self, to: DeviceHealth) -> bool {
        use DeviceHealth::*;
        matches!(
            (self, to),
            (Init, Well) | (Init, NoStart) | (Well, Sick) | (Well, Dead) | (Sick, Dead)
        )
    }
}

impl fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceHealth::Init => "INIT",
            DeviceHealth::Well => "WELL",
            DeviceHealth::Sick => "SICK",
            DeviceHealth::Dead => "DEAD",
            DeviceHealth::NoStart => "NOSTART",
        };
        write!(f, "{}", s)
    }
}

/// Opaque clock and fan settings passed through to a vendor tool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorSettings {
    /// Engine clock
    pub engine: Option<String>,
    /// Memory clock
    pub memclock: Option<String>,
    /// Fan speed
    pub fan: Option<String>,
}

/// Lifetime and rolling hash counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HashRate {
    /// Hashes dispatched since start
    pub total_hashes: u64,
    /// Exponentially decayed hashes per second
    pub rolling: f64,
    /// Largest batch ever dispatched; used as the nonce stride
    pub max_hashes: u64,
}

impl HashRate {
    /// Account `hashes` dispatched over `secs` seconds
    pub fn record(&mut self, hashes: u64, secs: f64) {
        self.total_hashes = self.total_hashes.saturating_add(hashes);
        decay_time(&mut self.rolling, hashes as f64, secs, HASH_RATE_DECAY_SECS);
    }
}

/// Fold `fadd` units observed over `fsecs` into a rate `f` decaying with `interval`
pub fn decay_time(f: &mut f64, fadd: f64, fsecs: f64, interval: f64) {
    if fsecs <= 0.0 {
        return;
    }
    let fprop = 1.0 - 1.0 / (fsecs / interval).exp();
    *f += fadd / fsecs * fprop;
    *f /= 1.0 + fprop;
}

/// Values the runtime actually settled on, published after init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSummary {
    /// Compute units times 64
    pub compute_shaders: u32,
    /// Work-group size in use
    pub work_size: u32,
    /// Vector width in use
    pub vector_width: u32,
    /// Device maximum single allocation
    pub max_alloc: u64,
}

/// Everything the backend knows about one GPU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Index in the registry
    pub id: usize,
    /// Device name reported by the platform
    pub name: String,
    /// Operator enable flag
    pub enabled: bool,
    /// Current health
    pub health: DeviceHealth,
    /// Selected kernel pipeline
    pub kernel: KernelVariant,
    /// Configured vector width (0 = auto)
    pub vector_width: u32,
    /// Configured work-group size (0 = auto)
    pub work_size: u32,
    /// Configured shader count (0 = unknown)
    pub shaders: u32,
    /// Configured lookup gap (0 = auto)
    pub lookup_gap: u32,
    /// Configured thread concurrency (0 = auto)
    pub thread_concurrency: u32,
    /// Number of worker threads for this device
    pub threads: usize,
    /// Clock and fan passthrough
    pub vendor: VendorSettings,
    /// Hash counters
    pub hash_rate: HashRate,
    /// Last successful initialisation
    pub last_initialised: Option<DateTime<Local>>,
    /// Values settled on by the runtime
    pub runtime: Option<RuntimeSummary>,
    intensity: Intensity,
    intensity_generation: u64,
}

impl DeviceDescriptor {
    /// New descriptor with defaults for every tunable
    pub fn new(id: usize, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            health: DeviceHealth::Init,
            kernel: KernelVariant::default(),
            vector_width: 0,
            work_size: 0,
            shaders: 0,
            lookup_gap: 0,
            thread_concurrency: 0,
            threads: 1,
            vendor: VendorSettings::default(),
            hash_rate: HashRate::default(),
            last_initialised: None,
            runtime: None,
            intensity: Intensity::default(),
            intensity_generation: 0,
        }
    }

    /// Active intensity mode
    pub fn intensity(&self) -> Intensity {
        self.intensity
    }

    /// Bumped on every operator or config change to intensity
    pub fn intensity_generation(&self) -> u64 {
        self.intensity_generation
    }

    /// Replace the intensity mode
    pub fn set_mode(&mut self, mode: Intensity) {
        self.intensity = mode;
        self.intensity_generation += 1;
    }

    /// Fixed intensity; clears xintensity and rawintensity
    pub fn set_intensity(&mut self, value: i32) -> Result<(), IntensityError> {
        self.set_mode(Intensity::fixed(value)?);
        Ok(())
    }

    /// Dynamic intensity starting from the current exponent
    pub fn set_dynamic(&mut self) {
        self.set_mode(Intensity::dynamic_from(&self.intensity));
    }

    /// Shader based intensity; clears intensity and rawintensity
    pub fn set_xintensity(&mut self, value: u32) -> Result<(), IntensityError> {
        self.set_mode(Intensity::shader(value)?);
        Ok(())
    }

    /// Raw intensity; clears intensity and xintensity
    pub fn set_rawintensity(&mut self, value: u32) -> Result<(), IntensityError> {
        self.set_mode(Intensity::raw(value)?);
        Ok(())
    }

    /// Write back a value adjusted by the sizing controller
    ///
    /// Ignored when the operator changed intensity after `generation` was read.
    pub fn sync_intensity(&mut self, value: Intensity, generation: u64) -> bool {
        if self.intensity_generation != generation {
            return false;
        }
        self.intensity = value;
        true
    }

    /// Move to `to` if the state machine allows it
    pub fn transition(&mut self, to: DeviceHealth) -> bool {
        if self.health == to {
            return true;
        }
        if self.health.can_transition(to) {
            self.health = to;
            true
        } else {
            tracing::debug!("Device {} ignoring {} -> {}", self.id, self.health, to);
            false
        }
    }

    /// Explicit restart: any state goes back to INIT
    pub fn begin_restart(&mut self) {
        self.health = DeviceHealth::Init;
    }

    /// True when worker threads beyond the first must stay paused
    pub fn pauses_extra_threads(&self) -> bool {
        self.intensity.is_dynamic()
    }
}
