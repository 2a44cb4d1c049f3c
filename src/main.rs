// src/main.rs - Command line front end for the scan-hash backend
// Tree location: ./src/main.rs

//! oclscan Main Entry Point
//!
//! Device detection, effective configuration, cache file names and a short
//! benchmark on synthetic work.
//!
//! # Version History
//! - 0.1.0: detect, config and cache-key commands
//! - 0.1.1: bench command on device 0

use std::path::PathBuf;

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use oclscan::gpu::cache::{CacheKey, CompileOptions};
use oclscan::gpu::tuning::{derive_tuning, DeviceProbe};
use oclscan::gpu::{DeviceDescriptor, KernelVariant};
use oclscan::{init, OclScanError, Result, Settings, SettingsError};

#[derive(Parser)]
#[command(name = "oclscan")]
#[command(about = "OpenCL scan-hash backend with kernel binary caching and adaptive intensity")]
struct Cli {
    /// Debug logging when RUST_LOG is not set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List OpenCL platforms and GPU devices
    Detect,
    /// Print the effective per-device settings as JSON
    Config {
        #[command(flatten)]
        settings: SettingsArgs,
        /// Devices to describe
        #[arg(long, default_value = "1")]
        devices: usize,
    },
    /// Print the binary cache file name for a device
    CacheKey {
        /// Device name as reported by the platform
        #[arg(long)]
        device: String,
        /// Kernel variant
        #[arg(short, long, default_value = "ckolivas")]
        kernel: String,
        /// Lookup gap (0 = default)
        #[arg(long, default_value = "0")]
        lookup_gap: u32,
        /// Thread concurrency
        #[arg(long, default_value = "0")]
        thread_concurrency: u32,
        /// Work-group size
        #[arg(short, long, default_value = "256")]
        worksize: u32,
        /// Build without global offset support
        #[arg(long)]
        no_goffset: bool,
    },
    /// Run the scan loop on device 0 with synthetic work
    Bench {
        #[command(flatten)]
        settings: SettingsArgs,
        /// Seconds to run
        #[arg(short, long, default_value = "10")]
        seconds: u64,
        /// 80-byte header (hex), zeros when unset
        #[arg(long)]
        header: Option<String>,
        /// 32-byte target (hex), zeros when unset
        #[arg(long)]
        target: Option<String>,
    },
}

/// Settings file plus command line overrides
#[derive(Args)]
struct SettingsArgs {
    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// OpenCL platform index
    #[arg(long)]
    platform: Option<usize>,
    /// Directory holding the .cl sources
    #[arg(long)]
    kernel_path: Option<PathBuf>,
    /// Directory for cached binaries
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Kernel per device, comma separated
    #[arg(short, long)]
    kernel: Option<String>,
    /// Intensity per device ("d" for dynamic)
    #[arg(short = 'I', long)]
    intensity: Option<String>,
    /// Shader-multiplier intensity per device
    #[arg(short = 'X', long)]
    xintensity: Option<String>,
    /// Raw thread count per device
    #[arg(long)]
    rawintensity: Option<String>,
    /// Work-group size per device
    #[arg(short, long)]
    worksize: Option<String>,
    /// Scrypt lookup gap per device
    #[arg(long)]
    lookup_gap: Option<String>,
    /// Scrypt thread concurrency per device
    #[arg(long)]
    thread_concurrency: Option<String>,
    /// Shaders per device
    #[arg(long)]
    shaders: Option<String>,
    /// Vector width per device
    #[arg(short, long)]
    vectors: Option<String>,
    /// Worker threads per device
    #[arg(short = 'g', long)]
    gpu_threads: Option<String>,
}

impl SettingsArgs {
    fn settings(self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };

        if self.platform.is_some() {
            settings.platform_id = self.platform;
        }
        if let Some(path) = self.kernel_path {
            settings.kernel_path = path;
        }
        if let Some(dir) = self.cache_dir {
            settings.cache_dir = dir;
        }

        let overrides = [
            (&mut settings.kernel, self.kernel),
            (&mut settings.intensity, self.intensity),
            (&mut settings.xintensity, self.xintensity),
            (&mut settings.rawintensity, self.rawintensity),
            (&mut settings.worksize, self.worksize),
            (&mut settings.lookup_gap, self.lookup_gap),
            (&mut settings.thread_concurrency, self.thread_concurrency),
            (&mut settings.shaders, self.shaders),
            (&mut settings.vectors, self.vectors),
            (&mut settings.gpu_threads, self.gpu_threads),
        ];
        for (slot, value) in overrides {
            if value.is_some() {
                *slot = value;
            }
        }
        Ok(settings)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init(if cli.verbose { "debug" } else { "info" })?;

    match cli.command {
        Commands::Detect => detect()?,
        Commands::Config { settings, devices } => show_config(settings.settings()?, devices)?,
        Commands::CacheKey { device, kernel, lookup_gap, thread_concurrency, worksize, no_goffset } => {
            let variant: KernelVariant = kernel.parse().map_err(|_| SettingsError::InvalidValue {
                param: "kernel",
                device: 0,
                value: kernel.clone(),
            })?;
            show_cache_key(&device, variant, lookup_gap, thread_concurrency, worksize, !no_goffset);
        }
        Commands::Bench { settings, seconds, header, target } => {
            bench(settings.settings()?, seconds, header, target)?;
        }
    }

    Ok(())
}

fn show_config(settings: Settings, devices: usize) -> Result<()> {
    let descriptors = settings.descriptors(devices)?;
    println!("{}", serde_json::to_string_pretty(&descriptors)?);
    Ok(())
}

fn show_cache_key(
    device: &str,
    kernel: KernelVariant,
    lookup_gap: u32,
    thread_concurrency: u32,
    worksize: u32,
    goffset: bool,
) {
    let mut desc = DeviceDescriptor::new(0, device);
    desc.kernel = kernel;
    desc.lookup_gap = lookup_gap;
    desc.thread_concurrency = thread_concurrency;
    desc.work_size = worksize;

    let probe = DeviceProbe {
        name: device.to_string(),
        max_work_group_size: worksize.max(1),
        ..DeviceProbe::default()
    };
    let mut tuning = derive_tuning(&desc, &probe);
    tuning.goffset = goffset;

    let settings = Settings::default();
    println!("{}", CacheKey::for_tuning(&tuning).file_name());
    println!("{}", CompileOptions::for_tuning(&tuning, &settings.kernel_path));
}

#[cfg(feature = "opencl")]
fn detect() -> Result<()> {
    use oclscan::gpu::PlatformDetector;

    let detector = PlatformDetector::new()?;
    for platform in detector.list_all() {
        println!(
            "Platform {}: {} [{}] {}",
            platform.index, platform.name, platform.vendor, platform.version
        );
        for (i, gpu) in platform.gpus.iter().enumerate() {
            println!("  GPU {}: {}", i, gpu);
        }
    }
    Ok(())
}

#[cfg(not(feature = "opencl"))]
fn detect() -> Result<()> {
    Err(OclScanError::OpenCL("built without the opencl feature".to_string()))
}

fn synthetic_work(header: Option<String>, target: Option<String>) -> Result<oclscan::WorkItem> {
    let header = header.unwrap_or_else(|| "00".repeat(80));
    let target = target.unwrap_or_else(|| "00".repeat(32));
    oclscan::WorkItem::from_hex(0, &header, &target)
}

#[cfg(feature = "opencl")]
fn bench(settings: Settings, seconds: u64, header: Option<String>, target: Option<String>) -> Result<()> {
    use oclscan::gpu::{DeviceFactory, LogSink, OpenClFactory};
    use oclscan::ScanHasher;
    use std::time::{Duration, Instant};

    let mut work = synthetic_work(header, target)?;
    let factory = OpenClFactory::new(&settings);
    let names = factory.device_names()?;
    let descriptors = settings.descriptors_for(&names)?;
    let desc = descriptors
        .first()
        .ok_or_else(|| OclScanError::OpenCL("No GPU devices found".to_string()))?;

    let device = factory.init_device(desc, 0)?;
    let start = Instant::now();
    let mut hasher = ScanHasher::new(desc.id, device, settings.dynamic_interval(), start);
    let mut intensity = desc.intensity();
    let deadline = start + Duration::from_secs(seconds);

    let timestamp = Local::now().format("%H:%M:%S").to_string();
    println!("{} Benchmarking {} ({}) for {}s", timestamp, desc.name, desc.kernel, seconds);

    let mut total = 0u64;
    while Instant::now() < deadline && !work.is_exhausted() {
        total += hasher.scanhash(&mut work, &mut intensity, Instant::now(), &LogSink)?;
    }

    let secs = start.elapsed().as_secs_f64().max(f64::EPSILON);
    let timestamp = Local::now().format("%H:%M:%S").to_string();
    println!(
        "{} {} hashes in {:.1}s: {:.2} MH/s (intensity {}, max batch {})",
        timestamp,
        total,
        secs,
        total as f64 / secs / 1e6,
        intensity,
        hasher.max_hashes()
    );
    Ok(())
}

#[cfg(not(feature = "opencl"))]
fn bench(_settings: Settings, _seconds: u64, header: Option<String>, target: Option<String>) -> Result<()> {
    synthetic_work(header, target)?;
    let timestamp = Local::now().format("%H:%M:%S").to_string();
    println!("{} bench needs the opencl feature", timestamp);
    Err(OclScanError::OpenCL("built without the opencl feature".to_string()))
}
