// src/gpu/testing.rs - Scripted fakes for unit tests
// Tree location: ./src/gpu/testing.rs

//! Test doubles for the native seams: a scripted [`ComputeDevice`], a
//! recording [`ProgramBackend`], a device factory and a recording sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::device::{DeviceDescriptor, DeviceHealth};
use super::error::{DispatchError, InitError};
use super::hooks::{HealthObserver, ResultSink};
use super::loader::ProgramBackend;
use super::runtime::{ComputeDevice, Launch, ResultBuffer, StageArg, WorkItem, HEADER_BYTES};
use super::supervisor::DeviceFactory;
use super::tuning::DeviceTuning;
use super::variant::KernelVariant;

/// Tuning for a mid-range card
pub fn tuning(variant: KernelVariant) -> DeviceTuning {
    DeviceTuning {
        device_name: "Tahiti".to_string(),
        variant,
        vector_width: 1,
        work_size: 256,
        lookup_gap: 2,
        thread_concurrency: 8192,
        compute_shaders: 2048,
        goffset: true,
        has_bit_align: true,
        has_opencl11plus: true,
        quirk: None,
        max_alloc: 1 << 30,
    }
}

/// Work item with a recognisable header
pub fn work(id: u64) -> WorkItem {
    let mut data = [0u8; HEADER_BYTES];
    for (i, b) in data.iter_mut().enumerate() {
        *b = i as u8;
    }
    let mut target = [0u8; 32];
    target[24..32].copy_from_slice(&0x0000_ffff_0000_0000u64.to_le_bytes());
    WorkItem::new(id, data, target)
}

/// Something the fake device was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Header upload
    Header(Vec<u8>),
    /// Argument bind
    Arg(usize, u32, StageArg),
    /// Kernel enqueue
    Enqueue(usize, Launch),
    /// Result read enqueued
    Read,
    /// Queue finish
    Finish,
    /// Result buffer cleared
    Clear,
    /// Hash buffer sized
    HashBuffer(u64),
}

/// Shared state behind a [`FakeDevice`]
#[derive(Debug, Default)]
pub struct FakeState {
    /// Everything asked of the device
    pub events: Vec<Event>,
    /// Enqueue calls so far
    pub enqueues: usize,
    /// Fail the n-th enqueue call (1-based)
    pub fail_enqueue_at: Option<usize>,
    /// Buffers returned by successive reads
    pub scripted_results: VecDeque<ResultBuffer>,
}

impl FakeState {
    /// Kernel enqueues recorded
    pub fn enqueue_events(&self) -> usize {
        self.events.iter().filter(|e| matches!(e, Event::Enqueue(..))).count()
    }

    /// Stage 0 launches in enqueue order
    pub fn launches(&self) -> Vec<Launch> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Enqueue(0, launch) => Some(*launch),
                _ => None,
            })
            .collect()
    }
}

/// Scripted device
#[derive(Debug)]
pub struct FakeDevice {
    tuning: DeviceTuning,
    host: ResultBuffer,
    /// Shared log and script
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    /// Fake for `tuning`
    pub fn new(tuning: DeviceTuning) -> Self {
        Self {
            tuning,
            host: [0; 16],
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    /// Fake sharing an existing state
    pub fn with_state(tuning: DeviceTuning, state: Arc<Mutex<FakeState>>) -> Self {
        Self { tuning, host: [0; 16], state }
    }

    fn log(&self, event: Event) {
        self.state.lock().unwrap().events.push(event);
    }
}

impl ComputeDevice for FakeDevice {
    fn tuning(&self) -> &DeviceTuning {
        &self.tuning
    }

    fn write_header(&mut self, header: &[u8; HEADER_BYTES]) -> Result<(), DispatchError> {
        self.log(Event::Header(header.to_vec()));
        Ok(())
    }

    fn set_arg(&mut self, stage: usize, index: u32, arg: StageArg) -> Result<(), DispatchError> {
        self.log(Event::Arg(stage, index, arg));
        Ok(())
    }

    fn enqueue_stage(&mut self, stage: usize, launch: Launch) -> Result<(), DispatchError> {
        let mut state = self.state.lock().unwrap();
        state.enqueues += 1;
        if state.fail_enqueue_at == Some(state.enqueues) {
            return Err(DispatchError::Queue {
                stage: self.tuning.variant.spec().stages[stage].kernel.to_string(),
                message: "CL_OUT_OF_RESOURCES".to_string(),
            });
        }
        state.events.push(Event::Enqueue(stage, launch));
        Ok(())
    }

    fn enqueue_read_results(&mut self) -> Result<(), DispatchError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::Read);
        self.host = state.scripted_results.pop_front().unwrap_or([0; 16]);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), DispatchError> {
        self.log(Event::Finish);
        Ok(())
    }

    fn results(&self) -> &ResultBuffer {
        &self.host
    }

    fn clear_results(&mut self) -> Result<(), DispatchError> {
        self.host = [0; 16];
        self.log(Event::Clear);
        Ok(())
    }

    fn ensure_hash_buffer(&mut self, threads: u64) -> Result<(), DispatchError> {
        self.log(Event::HashBuffer(threads));
        Ok(())
    }
}

/// Program handle produced by [`FakeBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeProgram {
    /// Binary it was loaded from, or None for a source build
    pub binary: Option<Vec<u8>>,
}

/// Recording program backend
#[derive(Debug, Default)]
pub struct FakeBackend {
    binary: Vec<u8>,
    fail_compile: Option<String>,
    fail_load: bool,
    compiles: Mutex<Vec<String>>,
    loads: Mutex<Vec<Vec<u8>>>,
}

impl FakeBackend {
    /// Backend whose compiler emits `binary`
    pub fn new(binary: Vec<u8>) -> Self {
        Self { binary, ..Default::default() }
    }

    /// Every source build fails with `log`
    pub fn failing_compile(mut self, log: &str) -> Self {
        self.fail_compile = Some(log.to_string());
        self
    }

    /// Every binary load fails
    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Source builds so far
    pub fn compile_count(&self) -> usize {
        self.compiles.lock().unwrap().len()
    }

    /// Options passed to each source build
    pub fn compile_options(&self) -> Vec<String> {
        self.compiles.lock().unwrap().clone()
    }

    /// Binaries loaded successfully
    pub fn loaded_binaries(&self) -> Vec<Vec<u8>> {
        self.loads.lock().unwrap().clone()
    }
}

impl ProgramBackend for FakeBackend {
    type Program = FakeProgram;

    fn load_binary(&self, binary: &[u8]) -> Result<FakeProgram, InitError> {
        if self.fail_load {
            return Err(InitError::Device("CL_INVALID_BINARY".to_string()));
        }
        self.loads.lock().unwrap().push(binary.to_vec());
        Ok(FakeProgram { binary: Some(binary.to_vec()) })
    }

    fn compile_source(&self, _source: &str, options: &str) -> Result<FakeProgram, InitError> {
        self.compiles.lock().unwrap().push(options.to_string());
        if let Some(log) = &self.fail_compile {
            return Err(InitError::Build { kernel: "fake".to_string(), log: log.clone() });
        }
        Ok(FakeProgram { binary: None })
    }

    fn extract_binary(&self, _program: &FakeProgram) -> Result<Vec<u8>, InitError> {
        Ok(self.binary.clone())
    }
}

/// Image the BFI_INT patch can find its way through, with one patchable word
pub fn bfi_image() -> Vec<u8> {
    let mut image = vec![0u8; 1200];
    image[0..4].copy_from_slice(b"\x7fELF");
    image[200..204].copy_from_slice(b"\x7fELF");
    image[300..305].copy_from_slice(b".text");
    image[310..315].copy_from_slice(b".text");
    image[595..599].copy_from_slice(&700u32.to_le_bytes());
    image[599..603].copy_from_slice(&8u32.to_le_bytes());
    image[900..908].copy_from_slice(&(13u64 << 45).to_le_bytes());
    image
}

/// Factory handing out fakes; init fails for ids in `failing`
#[derive(Debug, Default)]
pub struct FakeFactory {
    /// Devices the platform reports
    pub count: AtomicUsize,
    /// Device ids whose init fails
    pub failing: Mutex<Vec<usize>>,
    /// Init calls so far, by device id
    pub inits: Mutex<Vec<usize>>,
    /// State shared with every device created for a given id
    pub states: Mutex<Vec<Arc<Mutex<FakeState>>>>,
}

impl FakeFactory {
    /// Factory reporting `count` devices
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            states: Mutex::new((0..count).map(|_| Arc::default()).collect()),
            ..Default::default()
        }
    }

    /// State shared by devices for `id`
    pub fn state(&self, id: usize) -> Arc<Mutex<FakeState>> {
        self.states.lock().unwrap()[id].clone()
    }

    /// Init calls for `id`
    pub fn init_count(&self, id: usize) -> usize {
        self.inits.lock().unwrap().iter().filter(|i| **i == id).count()
    }
}

impl DeviceFactory for FakeFactory {
    type Device = FakeDevice;

    fn device_count(&self) -> Result<usize, InitError> {
        Ok(self.count.load(Ordering::SeqCst))
    }

    fn init_device(&self, desc: &DeviceDescriptor, _thread: usize) -> Result<FakeDevice, InitError> {
        self.inits.lock().unwrap().push(desc.id);
        if self.failing.lock().unwrap().contains(&desc.id) {
            return Err(InitError::Build { kernel: desc.kernel.to_string(), log: "boom".to_string() });
        }
        Ok(FakeDevice::with_state(tuning(desc.kernel), self.state(desc.id)))
    }
}

/// Sink counting postprocess calls
#[derive(Debug, Default)]
pub struct RecordingSink {
    /// (device, work id, results) per call
    pub calls: Mutex<Vec<(usize, u64, ResultBuffer)>>,
}

impl ResultSink for RecordingSink {
    fn postprocess(&self, device_id: usize, work: &WorkItem, results: &ResultBuffer) {
        self.calls.lock().unwrap().push((device_id, work.id, *results));
    }
}

/// Observer recording health changes
#[derive(Debug, Default)]
pub struct RecordingHealth {
    /// (device, health) per call
    pub changes: Mutex<Vec<(usize, DeviceHealth)>>,
}

impl HealthObserver for RecordingHealth {
    fn device_health(&self, device_id: usize, health: DeviceHealth) {
        self.changes.lock().unwrap().push((device_id, health));
    }
}
