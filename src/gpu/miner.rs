// src/gpu/miner.rs - Backend wiring
// Tree location: ./src/gpu/miner.rs

//! Start-up and shutdown of the whole backend
//!
//! # Version History
//! - 0.1.0: Initial device bring-up and thread spawning
//! - 0.1.1: Work splitting across device threads
//!
//! # Start-up
//! 1. Count devices on the selected platform
//! 2. Bring up every enabled device (WELL or NOSTART)
//! 3. One worker per device thread, one supervisor, one control thread

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;

use super::control::{control_channel, ControlHandle};
use super::device::DeviceDescriptor;
use super::hooks::{HealthObserver, ResultSink};
use super::registry::DeviceRegistry;
use super::runtime::WorkItem;
use super::sizing::DEFAULT_DYNAMIC_INTERVAL_MS;
use super::supervisor::{bring_up, reinit_channel, DeviceFactory, ReinitHandle, ReinitSupervisor, SlotHandle};
use super::worker::{MinerThread, WorkerContext};
use crate::{OclScanError, Result};

/// Loop timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinerOptions {
    /// Dynamic intensity target per scan call
    pub dynamic_interval: Duration,
    /// Wait between checks while paused or without work
    pub idle: Duration,
}

impl Default for MinerOptions {
    fn default() -> Self {
        Self {
            dynamic_interval: Duration::from_millis(DEFAULT_DYNAMIC_INTERVAL_MS),
            idle: Duration::from_millis(100),
        }
    }
}

struct WorkSlot {
    device_id: usize,
    tx: Sender<WorkItem>,
}

/// Running backend
pub struct Miner {
    registry: Arc<DeviceRegistry>,
    reinit: ReinitHandle,
    control: ControlHandle,
    slots: Vec<WorkSlot>,
    workers: Vec<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
    control_thread: Option<JoinHandle<()>>,
}

fn spawn_named<T: FnOnce() + Send + 'static>(name: String, f: T) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| OclScanError::Thread(format!("Failed to spawn {}: {}", name, e)))
}

impl Miner {
    /// Bring up `descriptors` through `factory` and start every thread
    pub fn start<F: DeviceFactory>(
        factory: Arc<F>,
        mut descriptors: Vec<DeviceDescriptor>,
        options: MinerOptions,
        sink: Arc<dyn ResultSink>,
        observer: Arc<dyn HealthObserver>,
    ) -> Result<Self> {
        let count = factory.device_count()?;
        if descriptors.len() > count {
            tracing::warn!(
                "⚠️  {} devices configured but platform reports {}, ignoring the rest",
                descriptors.len(),
                count
            );
            descriptors.truncate(count);
        }
        tracing::info!("🔍 Starting {} GPU(s)", descriptors.len());

        let registry = Arc::new(DeviceRegistry::new(descriptors));
        let (reinit, reinit_rx) = reinit_channel(registry.len());
        let first_failure = Arc::new(AtomicBool::new(false));
        let ctx = WorkerContext {
            registry: registry.clone(),
            reinit: reinit.clone(),
            sink,
            observer: observer.clone(),
            dynamic_interval: options.dynamic_interval,
            idle: options.idle,
        };

        let mut supervisor_slots = Vec::new();
        let mut slots = Vec::new();
        let mut workers = Vec::new();

        for id in 0..registry.len() {
            let Some((enabled, threads)) = registry.with(id, |d| (d.enabled, d.threads.max(1))) else {
                continue;
            };
            let mut devices = if enabled {
                bring_up(factory.as_ref(), &registry, observer.as_ref(), id, &first_failure)
                    .unwrap_or_default()
                    .into_iter()
            } else {
                tracing::info!("GPU {} disabled, not initialising", id);
                Vec::new().into_iter()
            };

            for thread in 0..threads {
                let (restart_tx, restart_rx) = crossbeam_channel::unbounded();
                let (work_tx, work_rx) = crossbeam_channel::unbounded();
                supervisor_slots.push(SlotHandle { device_id: id, thread, tx: restart_tx });
                slots.push(WorkSlot { device_id: id, tx: work_tx });

                let worker = MinerThread::new(id, thread, devices.next(), ctx.clone(), restart_rx, work_rx);
                workers.push(spawn_named(format!("gpu{}-t{}", id, thread), move || worker.run())?);
            }
        }

        let supervisor = ReinitSupervisor::new(
            factory,
            registry.clone(),
            observer,
            supervisor_slots,
            reinit.clone(),
            count,
            first_failure,
        );
        let supervisor = supervisor
            .spawn(reinit_rx)
            .map_err(|e| OclScanError::Thread(format!("Failed to spawn reinit: {}", e)))?;

        let (control, controller, control_rx) = control_channel(registry.clone(), reinit.clone());
        let control_thread = controller
            .spawn(control_rx)
            .map_err(|e| OclScanError::Thread(format!("Failed to spawn control: {}", e)))?;

        Ok(Self {
            registry,
            reinit,
            control,
            slots,
            workers,
            supervisor: Some(supervisor),
            control_thread: Some(control_thread),
        })
    }

    /// Device descriptors
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Operator command path
    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    fn send_split(&self, work: &WorkItem, targets: Vec<&WorkSlot>) -> usize {
        let parts = work.split(targets.len());
        let mut sent = 0;
        for (slot, part) in targets.into_iter().zip(parts) {
            if slot.tx.send(part).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Hand `work` to the threads of one device, nonce range split between them
    pub fn submit_work(&self, device_id: usize, work: &WorkItem) -> usize {
        let targets: Vec<&WorkSlot> = self.slots.iter().filter(|s| s.device_id == device_id).collect();
        if targets.is_empty() {
            tracing::warn!("⚠️  No threads for GPU {}", device_id);
            return 0;
        }
        self.send_split(work, targets)
    }

    /// Hand `work` to every thread, nonce range split between them
    pub fn broadcast_work(&self, work: &WorkItem) -> usize {
        self.send_split(work, self.slots.iter().collect())
    }

    /// Stop every thread and wait for them
    pub fn shutdown(mut self) -> Result<()> {
        tracing::info!("🔄 Shutting down miner");
        self.reinit.shutdown();
        self.slots.clear();

        let mut failed = 0;
        if let Some(handle) = self.supervisor.take() {
            failed += usize::from(handle.join().is_err());
        }
        for handle in self.workers.drain(..) {
            failed += usize::from(handle.join().is_err());
        }
        drop(self.control);
        if let Some(handle) = self.control_thread.take() {
            failed += usize::from(handle.join().is_err());
        }

        if failed > 0 {
            return Err(OclScanError::Thread(format!("{} thread(s) panicked", failed)));
        }
        tracing::info!("✅ Miner stopped");
        Ok(())
    }
}
