// src/gpu/opencl/context.rs - OpenCL device runtime and factory
// Tree location: ./src/gpu/opencl/context.rs

//! [`ComputeDevice`] and [`DeviceFactory`] over `ocl`
//!
//! # Version History
//! - 0.1.0: Context, queue, buffers and kernels per device thread
//! - 0.1.1: Out-of-order queue with in-order fallback
//! - 0.1.2: Hash buffer regrowth for chained kernels
//!
//! # Buffers
//! - input: 128 bytes, header at offset 0
//! - output: 16 x u32, slot 15 is the found counter
//! - padbuffer8: scrypt scratch pad
//! - hash_buffer: chained inter-stage hashes, 64 bytes per thread

use ocl::enums::ArgVal;
use ocl::flags::{CommandQueueProperties, MemFlags};
use ocl::prm::Uint4;
use ocl::{Buffer, Context, Device, Kernel, Program, Queue};

use crate::config::Settings;
use crate::gpu::device::DeviceDescriptor;
use crate::gpu::error::{DispatchError, InitError};
use crate::gpu::loader::KernelLoader;
use crate::gpu::runtime::{
    BufferSlot, ComputeDevice, Launch, ResultBuffer, StageArg, HEADER_BYTES, OUTPUT_SLOTS,
};
use crate::gpu::sizing::set_threads_hashes;
use crate::gpu::supervisor::DeviceFactory;
use crate::gpu::tuning::{self, check_hash_buffer, DeviceTuning, INPUT_BUFFER_BYTES};
use crate::gpu::variant::KernelArg;

use super::platform::PlatformDetector;
use super::program::OclProgramBackend;

/// One device thread's queue, program, kernels and buffers
pub struct OclDevice {
    tuning: DeviceTuning,
    queue: Queue,
    _program: Program,
    kernels: Vec<Kernel>,
    stage_names: Vec<&'static str>,
    input: Buffer<u8>,
    output: Buffer<u32>,
    pad: Option<Buffer<u8>>,
    hash: Option<Buffer<u8>>,
    hash_threads: u64,
    // Boxed so the non-blocking read target keeps its address
    host: Box<ResultBuffer>,
}

fn buffer_error(buffer: &'static str, requested: u64, max_alloc: u64, hint: &'static str) -> InitError {
    InitError::Allocation { buffer, requested, max_alloc, hint }
}

fn build_bytes(queue: &Queue, flags: MemFlags, len: u64) -> ocl::Result<Buffer<u8>> {
    Buffer::<u8>::builder()
        .queue(queue.clone())
        .flags(flags)
        .len(len as usize)
        .build()
}

impl OclDevice {
    fn build_kernels(
        program: &Program,
        queue: &Queue,
        tuning: &DeviceTuning,
    ) -> Result<Vec<Kernel>, InitError> {
        let spec = tuning.variant.spec();
        let mut kernels = Vec::with_capacity(spec.stages.len());
        for stage in spec.stages {
            let mut builder = Kernel::builder();
            builder.name(stage.kernel).program(program).queue(queue.clone());
            for arg in stage.args {
                match arg {
                    KernelArg::Input | KernelArg::PadBuffer | KernelArg::HashBuffer => {
                        builder.arg(None::<&Buffer<u8>>);
                    }
                    KernelArg::Output => {
                        builder.arg(None::<&Buffer<u32>>);
                    }
                    KernelArg::MidstateLo | KernelArg::MidstateHi => {
                        builder.arg(Uint4::new(0, 0, 0, 0));
                    }
                    KernelArg::Target32 => {
                        builder.arg(0u32);
                    }
                    KernelArg::Target64 => {
                        builder.arg(0u64);
                    }
                }
            }
            let kernel = builder.build().map_err(|e| {
                InitError::Device(format!("Failed to create {} kernel: {}", stage.kernel, e))
            })?;
            kernels.push(kernel);
        }
        Ok(kernels)
    }

    fn queue_error(&self, stage: usize, e: ocl::Error) -> DispatchError {
        DispatchError::Queue {
            stage: self.stage_names.get(stage).copied().unwrap_or("?").to_string(),
            message: e.to_string(),
        }
    }

    fn buffer(&self, slot: BufferSlot) -> Result<ArgVal<'_>, String> {
        match slot {
            BufferSlot::Input => Ok(ArgVal::mem(&self.input)),
            BufferSlot::Output => Ok(ArgVal::mem(&self.output)),
            BufferSlot::Pad => self
                .pad
                .as_ref()
                .map(|b| ArgVal::mem(b))
                .ok_or_else(|| "no pad buffer".to_string()),
            BufferSlot::Hash => self
                .hash
                .as_ref()
                .map(|b| ArgVal::mem(b))
                .ok_or_else(|| "no hash buffer".to_string()),
        }
    }
}

impl ComputeDevice for OclDevice {
    fn tuning(&self) -> &DeviceTuning {
        &self.tuning
    }

    fn write_header(&mut self, header: &[u8; HEADER_BYTES]) -> Result<(), DispatchError> {
        self.input
            .write(&header[..])
            .enq()
            .map_err(|e| DispatchError::Upload(e.to_string()))
    }

    fn set_arg(&mut self, stage: usize, index: u32, arg: StageArg) -> Result<(), DispatchError> {
        let kernel = self.kernels.get(stage).ok_or_else(|| DispatchError::Queue {
            stage: stage.to_string(),
            message: "no such stage".to_string(),
        })?;
        let result = match arg {
            StageArg::Buffer(slot) => {
                let value = self.buffer(slot).map_err(|message| DispatchError::Queue {
                    stage: self.stage_names[stage].to_string(),
                    message,
                })?;
                unsafe { kernel.set_arg_unchecked(index, value) }
            }
            StageArg::Uint4(words) => {
                let value = Uint4::new(words[0], words[1], words[2], words[3]);
                unsafe { kernel.set_arg_unchecked(index, ArgVal::vector(&value)) }
            }
            StageArg::U32(v) => unsafe { kernel.set_arg_unchecked(index, ArgVal::scalar(&v)) },
            StageArg::U64(v) => unsafe { kernel.set_arg_unchecked(index, ArgVal::scalar(&v)) },
        };
        result.map_err(|e| self.queue_error(stage, e))
    }

    fn enqueue_stage(&mut self, stage: usize, launch: Launch) -> Result<(), DispatchError> {
        let kernel = self.kernels.get(stage).ok_or_else(|| DispatchError::Queue {
            stage: stage.to_string(),
            message: "no such stage".to_string(),
        })?;
        let cmd = kernel
            .cmd()
            .global_work_size(launch.global_threads as usize)
            .local_work_size(launch.local_threads as usize);
        let result = match launch.global_offset {
            Some(offset) => unsafe { cmd.global_work_offset(offset as usize).enq() },
            None => unsafe { cmd.enq() },
        };
        result.map_err(|e| self.queue_error(stage, e))
    }

    fn enqueue_read_results(&mut self) -> Result<(), DispatchError> {
        // The host copy is only read after finish()
        unsafe {
            self.output
                .read(&mut self.host[..])
                .block(false)
                .enq()
                .map_err(|e| DispatchError::ReadBack(e.to_string()))
        }
    }

    fn finish(&mut self) -> Result<(), DispatchError> {
        self.queue.finish().map_err(|e| DispatchError::ReadBack(e.to_string()))
    }

    fn results(&self) -> &ResultBuffer {
        &self.host
    }

    fn clear_results(&mut self) -> Result<(), DispatchError> {
        let blank = [0u32; OUTPUT_SLOTS];
        self.output
            .write(&blank[..])
            .enq()
            .map_err(|e| DispatchError::ReadBack(e.to_string()))?;
        *self.host = blank;
        Ok(())
    }

    fn ensure_hash_buffer(&mut self, threads: u64) -> Result<(), DispatchError> {
        if self.hash.is_some() && threads <= self.hash_threads {
            return Ok(());
        }
        let size = check_hash_buffer(threads, self.tuning.max_alloc)
            .map_err(|e| DispatchError::Upload(e.to_string()))?;
        tracing::debug!("Growing hash buffer to {} bytes for {} threads", size, threads);
        let buffer = build_bytes(&self.queue, MemFlags::empty().read_write(), size)
            .map_err(|e| DispatchError::Upload(e.to_string()))?;
        self.hash = Some(buffer);
        self.hash_threads = threads;
        Ok(())
    }
}

/// Creates [`OclDevice`]s on the selected platform
pub struct OpenClFactory {
    platform_id: Option<usize>,
    loader: KernelLoader,
}

impl OpenClFactory {
    /// Factory for the platform and kernel paths in `settings`
    pub fn new(settings: &Settings) -> Self {
        Self {
            platform_id: settings.platform_id,
            loader: KernelLoader::new(&settings.kernel_path, &settings.cache_dir),
        }
    }

    /// Names of the GPUs on the selected platform, in device order
    pub fn device_names(&self) -> Result<Vec<String>, InitError> {
        let (_, devices) = PlatformDetector::new()?.select(self.platform_id)?;
        Ok(devices.iter().map(|d| d.name().unwrap_or_default()).collect())
    }

    fn open_queue(context: &Context, device: Device, out_of_order: bool) -> Result<Queue, InitError> {
        if out_of_order {
            match Queue::new(context, device, Some(CommandQueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE)) {
                Ok(queue) => return Ok(queue),
                Err(e) => tracing::debug!("Out-of-order queue unavailable ({}), using in-order", e),
            }
        }
        Queue::new(context, device, None)
            .map_err(|e| InitError::Device(format!("Failed to create queue: {}", e)))
    }
}

impl DeviceFactory for OpenClFactory {
    type Device = OclDevice;

    fn device_count(&self) -> Result<usize, InitError> {
        let (_, devices) = PlatformDetector::new()?.select(self.platform_id)?;
        Ok(devices.len())
    }

    fn init_device(&self, desc: &DeviceDescriptor, thread: usize) -> Result<OclDevice, InitError> {
        let (platform, devices) = PlatformDetector::new()?.select(self.platform_id)?;
        let device = *devices.get(desc.id).ok_or_else(|| {
            InitError::Enumeration(format!("GPU {} not reported by the platform", desc.id))
        })?;

        let probe = PlatformDetector::probe(&device)?;
        let tuning = tuning::derive_tuning(desc, &probe);
        tracing::info!("🔧 Init GPU {} thread {}: {}", desc.id, thread, probe.name);

        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()
            .map_err(|e| InitError::Device(format!("Failed to create context: {}", e)))?;
        let family = tuning.variant.spec().family;
        let queue = Self::open_queue(&context, device, family.out_of_order_queue())?;

        let backend = OclProgramBackend::new(context.clone(), device, tuning.variant.name());
        let loaded = self.loader.load(&backend, &tuning)?;
        tracing::debug!("GPU {} program from {:?} ({})", desc.id, loaded.origin, loaded.key);

        let max_alloc = tuning.max_alloc;
        let input = build_bytes(&queue, MemFlags::empty().read_only(), INPUT_BUFFER_BYTES as u64)
            .map_err(|_| buffer_error("input", INPUT_BUFFER_BYTES as u64, max_alloc, InitError::GENERIC_HINT))?;
        let output = Buffer::<u32>::builder()
            .queue(queue.clone())
            .flags(MemFlags::empty().write_only())
            .len(OUTPUT_SLOTS)
            .fill_val(0u32)
            .build()
            .map_err(|_| {
                buffer_error("output", (OUTPUT_SLOTS * 4) as u64, max_alloc, InitError::GENERIC_HINT)
            })?;

        let pad = if family.needs_pad_buffer() {
            let size = tuning.pad_buffer_size();
            tracing::debug!(
                "Creating scrypt buffer sized {} (lookup gap {}, thread concurrency {})",
                size,
                tuning.lookup_gap,
                tuning.thread_concurrency
            );
            if size > max_alloc {
                tracing::warn!("⚠️  Maximum buffer memory device supports says {}", max_alloc);
                tracing::warn!("⚠️  Your scrypt settings come to {}", size);
            }
            let buffer = build_bytes(&queue, MemFlags::empty().read_write(), size)
                .map_err(|_| buffer_error("padbuffer8", size, max_alloc, InitError::PAD_HINT))?;
            Some(buffer)
        } else {
            None
        };

        let mut hash_threads = 0;
        let hash = if family.needs_hash_buffer() {
            let mut intensity = desc.intensity();
            let threads = set_threads_hashes(
                tuning.vector_width,
                tuning.compute_shaders,
                tuning.work_size as u64,
                &mut intensity,
            )
            .global_threads;
            let size = check_hash_buffer(threads, max_alloc)?;
            let buffer = build_bytes(&queue, MemFlags::empty().read_write(), size)
                .map_err(|_| buffer_error("hash_buffer", size, max_alloc, InitError::HASH_HINT))?;
            hash_threads = threads;
            Some(buffer)
        } else {
            None
        };

        let kernels = OclDevice::build_kernels(&loaded.program, &queue, &tuning)?;
        let stage_names = tuning.variant.spec().stages.iter().map(|s| s.kernel).collect();

        tracing::info!("✅ GPU {} thread {} ready", desc.id, thread);
        Ok(OclDevice {
            tuning,
            queue,
            _program: loaded.program,
            kernels,
            stage_names,
            input,
            output,
            pad,
            hash,
            hash_threads,
            host: Box::new([0u32; OUTPUT_SLOTS]),
        })
    }
}
