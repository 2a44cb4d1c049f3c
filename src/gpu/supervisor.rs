// src/gpu/supervisor.rs - Device reinit supervisor
// Tree location: ./src/gpu/supervisor.rs

//! Serial device restarts
//!
//! # Version History
//! - 0.1.0: Single reinit thread fed by a bounded queue
//! - 0.1.1: Device count check, per-device request dedup
//!
//! Restarts come from two places: a worker whose dispatch failed and the
//! operator. Both end up as a [`SupervisorMessage::Restart`] on one bounded
//! channel consumed by exactly one thread, so at most one device is being
//! rebuilt at any time.
//!
//! # Restart Sequence
//! 1. Skip if the platform no longer reports the same device count; the
//!    device goes DEAD and its threads are told the restart failed
//! 2. Health back to INIT, every thread slot of the device told to halt
//! 3. A fresh runtime per thread slot from the [`DeviceFactory`]
//! 4. WELL with the runtime handed to each slot, or NOSTART and the device disabled

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Local;
use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::device::{DeviceDescriptor, DeviceHealth};
use super::error::InitError;
use super::hooks::HealthObserver;
use super::registry::DeviceRegistry;
use super::runtime::ComputeDevice;

/// Builds device runtimes; implemented over `ocl` and by test fakes
pub trait DeviceFactory: Send + Sync + 'static {
    /// Runtime type produced
    type Device: ComputeDevice + 'static;

    /// GPU devices currently reported by the selected platform
    fn device_count(&self) -> Result<usize, InitError>;

    /// Build the runtime for thread slot `thread` of `desc`
    fn init_device(&self, desc: &DeviceDescriptor, thread: usize) -> Result<Self::Device, InitError>;
}

/// Supervisor to worker
pub enum RestartSignal<D> {
    /// Fresh runtime; resume mining
    Restarted(D),
    /// Reinit failed or was skipped; the device is NOSTART or DEAD
    Failed,
    /// Drop the current runtime, a restart is under way
    Halt,
    /// Exit the worker loop
    Shutdown,
}

/// Requests consumed by the supervisor thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorMessage {
    /// Restart device id
    Restart(usize),
    /// Stop the supervisor and every worker
    Shutdown,
}

/// Cloneable sender side of the reinit queue
#[derive(Debug, Clone)]
pub struct ReinitHandle {
    tx: Sender<SupervisorMessage>,
    pending: Arc<Vec<AtomicBool>>,
}

/// Reinit queue sized for `devices`
pub fn reinit_channel(devices: usize) -> (ReinitHandle, Receiver<SupervisorMessage>) {
    let (tx, rx) = crossbeam_channel::bounded(devices + 1);
    let pending = Arc::new((0..devices).map(|_| AtomicBool::new(false)).collect());
    (ReinitHandle { tx, pending }, rx)
}

impl ReinitHandle {
    /// Queue a restart of `device_id`
    ///
    /// Returns false when a restart of that device is already pending or the
    /// queue is gone.
    pub fn request(&self, device_id: usize) -> bool {
        let Some(flag) = self.pending.get(device_id) else {
            tracing::warn!("⚠️  Reinit requested for unknown GPU {}", device_id);
            return false;
        };
        if flag.swap(true, Ordering::SeqCst) {
            tracing::debug!("GPU {} reinit already pending", device_id);
            return false;
        }
        match self.tx.try_send(SupervisorMessage::Restart(device_id)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                flag.store(false, Ordering::SeqCst);
                tracing::warn!("⚠️  Reinit queue full, dropping request for GPU {}", device_id);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                flag.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// True while a restart of `device_id` is queued or running
    pub fn is_pending(&self, device_id: usize) -> bool {
        self.pending
            .get(device_id)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn complete(&self, device_id: usize) {
        if let Some(flag) = self.pending.get(device_id) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Ask the supervisor to stop; blocks while the queue is full
    pub fn shutdown(&self) -> bool {
        self.tx.send(SupervisorMessage::Shutdown).is_ok()
    }
}

/// Supervisor side of one worker thread
pub struct SlotHandle<D> {
    /// Device the slot mines on
    pub device_id: usize,
    /// Thread index within the device
    pub thread: usize,
    /// Restart signals to the worker
    pub tx: Sender<RestartSignal<D>>,
}

/// Build runtimes for every thread of device `id` and record the outcome
///
/// Shared by startup and by restarts. On failure the device goes NOSTART and
/// is disabled; the first failure in the process also tells the operator
/// that restarting will not help.
pub(crate) fn bring_up<F: DeviceFactory>(
    factory: &F,
    registry: &DeviceRegistry,
    observer: &dyn HealthObserver,
    id: usize,
    first_failure: &AtomicBool,
) -> Option<Vec<F::Device>> {
    let desc = registry.snapshot(id)?;
    tracing::info!("🔧 Initialising GPU {} ({}), kernel {}", id, desc.name, desc.kernel);

    let mut devices = Vec::with_capacity(desc.threads.max(1));
    for thread in 0..desc.threads.max(1) {
        match factory.init_device(&desc, thread) {
            Ok(device) => devices.push(device),
            Err(e) => {
                tracing::error!("❌ Failed to init GPU {} thread {}: {}", id, thread, e);
                if !first_failure.swap(true, Ordering::SeqCst) {
                    tracing::error!(
                        "❌ Restarting the GPU from the control path will not fix this; re-check your settings"
                    );
                }
                registry.with(id, |d| {
                    d.transition(DeviceHealth::NoStart);
                    d.enabled = false;
                });
                observer.device_health(id, DeviceHealth::NoStart);
                return None;
            }
        }
    }

    let summary = devices.first().map(|d| d.tuning().summary());
    registry.with(id, |d| {
        d.transition(DeviceHealth::Well);
        d.last_initialised = Some(Local::now());
        d.runtime = summary;
    });
    observer.device_health(id, DeviceHealth::Well);
    tracing::info!("✅ GPU {} initialised", id);
    Some(devices)
}

/// The one reinit worker
pub struct ReinitSupervisor<F: DeviceFactory> {
    factory: Arc<F>,
    registry: Arc<DeviceRegistry>,
    observer: Arc<dyn HealthObserver>,
    slots: Vec<SlotHandle<F::Device>>,
    handle: ReinitHandle,
    expected_devices: usize,
    first_failure: Arc<AtomicBool>,
}

impl<F: DeviceFactory> ReinitSupervisor<F> {
    /// Supervisor over `slots`; `expected_devices` is the count seen at startup
    pub fn new(
        factory: Arc<F>,
        registry: Arc<DeviceRegistry>,
        observer: Arc<dyn HealthObserver>,
        slots: Vec<SlotHandle<F::Device>>,
        handle: ReinitHandle,
        expected_devices: usize,
        first_failure: Arc<AtomicBool>,
    ) -> Self {
        Self {
            factory,
            registry,
            observer,
            slots,
            handle,
            expected_devices,
            first_failure,
        }
    }

    /// Process messages until shutdown or until every sender is gone
    pub fn run(mut self, rx: Receiver<SupervisorMessage>) {
        tracing::debug!("Reinit supervisor running");
        for message in rx.iter() {
            match message {
                SupervisorMessage::Restart(id) => self.restart(id),
                SupervisorMessage::Shutdown => break,
            }
        }
        for slot in &self.slots {
            let _ = slot.tx.send(RestartSignal::Shutdown);
        }
        self.slots.clear();
        tracing::debug!("Reinit supervisor stopped");
    }

    /// Run on a dedicated thread
    pub fn spawn(self, rx: Receiver<SupervisorMessage>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("reinit".to_string())
            .spawn(move || self.run(rx))
    }

    /// Restart device `id` now
    pub fn restart(&mut self, id: usize) {
        self.restart_inner(id);
        self.handle.complete(id);
    }

    fn send_to_slots(&self, id: usize, mut signal: impl FnMut() -> RestartSignal<F::Device>) {
        for slot in self.slots.iter().filter(|s| s.device_id == id) {
            let _ = slot.tx.send(signal());
        }
    }

    /// Skipped restart: the device goes DEAD and its threads stop waiting
    fn abandon(&self, id: usize) {
        if self.registry.with(id, |d| d.transition(DeviceHealth::Dead)) == Some(true) {
            self.observer.device_health(id, DeviceHealth::Dead);
        }
        self.send_to_slots(id, || RestartSignal::Failed);
    }

    fn restart_inner(&mut self, id: usize) {
        match self.factory.device_count() {
            Ok(count) if count == self.expected_devices => {}
            Ok(count) => {
                tracing::warn!(
                    "⚠️  Platform reports {} GPUs instead of {}, not restarting GPU {}",
                    count,
                    self.expected_devices,
                    id
                );
                self.abandon(id);
                return;
            }
            Err(e) => {
                tracing::warn!("⚠️  Unable to count GPUs ({}), not restarting GPU {}", e, id);
                self.abandon(id);
                return;
            }
        }

        if self.registry.with(id, |d| d.begin_restart()).is_none() {
            tracing::warn!("⚠️  Restart requested for unknown GPU {}", id);
            return;
        }
        self.observer.device_health(id, DeviceHealth::Init);
        tracing::info!("🔄 Restarting GPU {}", id);

        self.send_to_slots(id, || RestartSignal::Halt);

        let outcome = bring_up(
            self.factory.as_ref(),
            &self.registry,
            self.observer.as_ref(),
            id,
            &self.first_failure,
        );

        match outcome {
            Some(devices) => {
                let mut devices = devices.into_iter();
                for slot in self.slots.iter().filter(|s| s.device_id == id) {
                    let signal = match devices.next() {
                        Some(device) => RestartSignal::Restarted(device),
                        None => RestartSignal::Failed,
                    };
                    let _ = slot.tx.send(signal);
                }
            }
            None => self.send_to_slots(id, || RestartSignal::Failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::hooks::LogHealth;
    use crate::gpu::testing::{FakeFactory, RecordingHealth};

    struct Rig {
        factory: Arc<FakeFactory>,
        registry: Arc<DeviceRegistry>,
        health: Arc<RecordingHealth>,
        supervisor: ReinitSupervisor<FakeFactory>,
        rx: Vec<Receiver<RestartSignal<crate::gpu::testing::FakeDevice>>>,
    }

    fn rig(devices: usize) -> Rig {
        let factory = Arc::new(FakeFactory::new(devices));
        let registry = Arc::new(DeviceRegistry::new(
            (0..devices).map(|i| DeviceDescriptor::new(i, "Tahiti")).collect(),
        ));
        let health = Arc::new(RecordingHealth::default());
        let mut slots = Vec::new();
        let mut rx = Vec::new();
        for id in 0..devices {
            let (tx, r) = crossbeam_channel::unbounded();
            slots.push(SlotHandle { device_id: id, thread: 0, tx });
            rx.push(r);
        }
        let (handle, _queue) = reinit_channel(devices);
        let supervisor = ReinitSupervisor::new(
            factory.clone(),
            registry.clone(),
            health.clone(),
            slots,
            handle,
            devices,
            Arc::new(AtomicBool::new(false)),
        );
        Rig { factory, registry, health, supervisor, rx }
    }

    #[test]
    fn test_restart_sick_device() {
        let mut r = rig(2);
        r.registry.set_health(1, DeviceHealth::Well);
        r.registry.set_health(1, DeviceHealth::Sick);

        r.supervisor.restart(1);

        assert_eq!(r.registry.health(1), Some(DeviceHealth::Well));
        let desc = r.registry.snapshot(1).unwrap();
        assert!(desc.last_initialised.is_some());
        assert_eq!(desc.runtime.unwrap().work_size, 256);
        assert!(matches!(r.rx[1].try_recv(), Ok(RestartSignal::Halt)));
        assert!(matches!(r.rx[1].try_recv(), Ok(RestartSignal::Restarted(_))));
        assert!(r.rx[0].try_recv().is_err());
        assert_eq!(
            *r.health.changes.lock().unwrap(),
            vec![(1, DeviceHealth::Init), (1, DeviceHealth::Well)]
        );
    }

    #[test]
    fn test_failed_restart_is_nostart() {
        let mut r = rig(1);
        r.factory.failing.lock().unwrap().push(0);
        r.registry.set_health(0, DeviceHealth::Well);

        r.supervisor.restart(0);

        let desc = r.registry.snapshot(0).unwrap();
        assert_eq!(desc.health, DeviceHealth::NoStart);
        assert!(!desc.enabled);
        assert!(matches!(r.rx[0].try_recv(), Ok(RestartSignal::Halt)));
        assert!(matches!(r.rx[0].try_recv(), Ok(RestartSignal::Failed)));
    }

    #[test]
    fn test_device_count_change_skips_restart() {
        let mut r = rig(2);
        r.registry.set_health(0, DeviceHealth::Well);
        r.registry.set_health(0, DeviceHealth::Sick);
        r.factory.count.store(1, Ordering::SeqCst);

        r.supervisor.restart(0);

        assert_eq!(r.registry.health(0), Some(DeviceHealth::Dead));
        assert_eq!(r.factory.init_count(0), 0);
        assert!(matches!(r.rx[0].try_recv(), Ok(RestartSignal::Failed)));
        assert!(r.rx[0].try_recv().is_err());
        assert!(r.rx[1].try_recv().is_err());
        assert_eq!(*r.health.changes.lock().unwrap(), vec![(0, DeviceHealth::Dead)]);
        assert!(!r.supervisor.handle.is_pending(0));
    }

    #[test]
    fn test_request_dedup() {
        let (handle, rx) = reinit_channel(2);
        assert!(handle.request(0));
        assert!(!handle.request(0));
        assert!(handle.request(1));
        assert!(!handle.request(5));
        assert!(handle.is_pending(0));
        assert_eq!(rx.try_recv(), Ok(SupervisorMessage::Restart(0)));
        assert_eq!(rx.try_recv(), Ok(SupervisorMessage::Restart(1)));
        assert!(rx.try_recv().is_err());

        handle.complete(0);
        assert!(!handle.is_pending(0));
        assert!(handle.request(0));
    }

    #[test]
    fn test_run_stops_workers_on_shutdown() {
        let r = rig(1);
        let (handle, rx) = reinit_channel(1);
        assert!(handle.shutdown());
        r.supervisor.run(rx);
        assert!(matches!(r.rx[0].try_recv(), Ok(RestartSignal::Shutdown)));
    }

    #[test]
    fn test_bring_up_logs_first_failure_once() {
        let factory = FakeFactory::new(2);
        factory.failing.lock().unwrap().extend([0, 1]);
        let registry = DeviceRegistry::new(vec![
            DeviceDescriptor::new(0, "Cypress"),
            DeviceDescriptor::new(1, "Cypress"),
        ]);
        let first = AtomicBool::new(false);
        assert!(bring_up(&factory, &registry, &LogHealth, 0, &first).is_none());
        assert!(first.load(Ordering::SeqCst));
        assert!(bring_up(&factory, &registry, &LogHealth, 1, &first).is_none());
        assert_eq!(registry.health(1), Some(DeviceHealth::NoStart));
    }
}
