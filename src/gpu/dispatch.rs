// src/gpu/dispatch.rs - Scan-hash dispatch loop
// Tree location: ./src/gpu/dispatch.rs

//! One scan-hash iteration per call
//!
//! # Version History
//! - 0.1.0: Single kernel dispatch with async result read
//! - 0.1.1: Chained stages, global offset, dynamic retune
//!
//! # Iteration
//! 1. Dynamic retune (dynamic mode only)
//! 2. Size the batch, track the largest batch ever dispatched, clip it to
//!    the nonces left in the work item
//! 3. Upload header, bind per-stage arguments
//! 4. Enqueue the stage chain at the current nonce
//! 5. Non-blocking read of the result buffer
//! 6. Advance the nonce by the largest batch (results are one call behind),
//!    never past the end of the work item
//! 7. Finish; on a nonzero found counter clear the buffer and report

use std::time::{Duration, Instant};

use super::device::Intensity;
use super::error::DispatchError;
use super::hooks::ResultSink;
use super::runtime::{BufferSlot, ComputeDevice, Launch, ResultBuffer, StageArg, WorkItem, FOUND};
use super::sizing::{set_threads_hashes, DynamicTuner, ThreadSizing};
use super::variant::KernelArg;

/// Scan-hash driver for one device thread
pub struct ScanHasher<D> {
    device_id: usize,
    device: D,
    tuner: DynamicTuner,
    /// Largest batch of this thread; the registry keeps the per-device maximum
    max_hashes: u64,
}

impl<D: ComputeDevice> ScanHasher<D> {
    /// Driver over an initialised device
    pub fn new(device_id: usize, device: D, dynamic_interval: Duration, now: Instant) -> Self {
        Self {
            device_id,
            device,
            tuner: DynamicTuner::new(dynamic_interval, now),
            max_hashes: 0,
        }
    }

    /// Device id
    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Underlying runtime
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Largest batch dispatched so far
    pub fn max_hashes(&self) -> u64 {
        self.max_hashes
    }

    /// Restart the dynamic measurement window, e.g. after a pause
    pub fn reset_timer(&mut self, now: Instant) {
        self.tuner.reset(now);
    }

    fn resolve(arg: KernelArg, work: &WorkItem) -> StageArg {
        match arg {
            KernelArg::Input => StageArg::Buffer(BufferSlot::Input),
            KernelArg::Output => StageArg::Buffer(BufferSlot::Output),
            KernelArg::PadBuffer => StageArg::Buffer(BufferSlot::Pad),
            KernelArg::HashBuffer => StageArg::Buffer(BufferSlot::Hash),
            KernelArg::MidstateLo => StageArg::Uint4(work.midstate_words(false)),
            KernelArg::MidstateHi => StageArg::Uint4(work.midstate_words(true)),
            KernelArg::Target32 => StageArg::U32(work.le_target32()),
            KernelArg::Target64 => StageArg::U64(work.le_target64()),
        }
    }

    fn queue_kernel_parameters(&mut self, work: &WorkItem) -> Result<(), DispatchError> {
        let spec = self.device.tuning().variant.spec();
        let header = if spec.family.flips_header() {
            work.flipped_header()
        } else {
            work.data
        };
        self.device.write_header(&header)?;

        for (stage, stage_spec) in spec.stages.iter().enumerate() {
            for (index, arg) in stage_spec.args.iter().enumerate() {
                self.device.set_arg(stage, index as u32, Self::resolve(*arg, work))?;
            }
        }
        Ok(())
    }

    /// Run one iteration and return the hashes dispatched
    ///
    /// An exhausted work item dispatches nothing and returns 0.
    pub fn scanhash(
        &mut self,
        work: &mut WorkItem,
        intensity: &mut Intensity,
        now: Instant,
        sink: &dyn ResultSink,
    ) -> Result<u64, DispatchError> {
        let remaining = work.nonce_end.saturating_sub(work.nonce);
        if remaining == 0 {
            return Ok(0);
        }

        if let Some(outcome) = self.tuner.tick(now, intensity) {
            tracing::debug!("GPU {} dynamic retune: {:?}", self.device_id, outcome);
        }

        let tuning = self.device.tuning();
        let spec = tuning.variant.spec();
        let ThreadSizing { mut global_threads, mut hashes, .. } = set_threads_hashes(
            tuning.vector_width,
            tuning.compute_shaders,
            tuning.work_size as u64,
            intensity,
        );
        self.max_hashes = self.max_hashes.max(hashes);
        if hashes > remaining {
            global_threads = remaining.div_ceil(tuning.vector_width.max(1) as u64);
            hashes = remaining;
        }
        let launch = Launch {
            global_threads,
            local_threads: tuning.work_size,
            global_offset: tuning.goffset.then_some(work.nonce),
        };

        if spec.family.needs_hash_buffer() {
            self.device.ensure_hash_buffer(global_threads)?;
        }
        self.queue_kernel_parameters(work)?;

        for stage in 0..spec.stages.len() {
            self.device.enqueue_stage(stage, launch)?;
        }
        self.device.enqueue_read_results()?;

        // The batch can shrink when intensity drops and results land one
        // call late, so step by the largest batch to never rescan nonces
        work.nonce = work.nonce.saturating_add(self.max_hashes).min(work.nonce_end);

        self.device.finish()?;

        if self.device.results()[FOUND] != 0 {
            let results: ResultBuffer = *self.device.results();
            self.device.clear_results()?;
            tracing::debug!("GPU {} found something?", self.device_id);
            sink.postprocess(self.device_id, work, &results);
            self.device.finish()?;
        }

        Ok(hashes)
    }
}
