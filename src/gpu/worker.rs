// src/gpu/worker.rs - Per device-thread mining loop
// Tree location: ./src/gpu/worker.rs

//! Mining loop of one device thread
//!
//! # Version History
//! - 0.1.0: Scan loop with latest-work draining
//! - 0.1.1: Cooperative stop on dispatch failure, dynamic pause of extra threads
//!
//! A thread only dispatches while its device is enabled and WELL. In dynamic
//! mode every thread but the first stays paused. After a failed dispatch
//! the runtime is dropped, one reinit is requested and the thread waits for
//! the supervisor's verdict before doing anything else.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, TryRecvError};

use super::device::DeviceHealth;
use super::dispatch::ScanHasher;
use super::hooks::{HealthObserver, ResultSink};
use super::registry::DeviceRegistry;
use super::runtime::{ComputeDevice, WorkItem};
use super::supervisor::{ReinitHandle, RestartSignal};

/// Shared collaborators of every worker
#[derive(Clone)]
pub struct WorkerContext {
    /// Device descriptors
    pub registry: Arc<DeviceRegistry>,
    /// Reinit queue
    pub reinit: ReinitHandle,
    /// Candidate consumer
    pub sink: Arc<dyn ResultSink>,
    /// Health consumer
    pub observer: Arc<dyn HealthObserver>,
    /// Dynamic intensity target per scan call
    pub dynamic_interval: Duration,
    /// Wait between checks while paused or without work
    pub idle: Duration,
}

/// One device thread
pub struct MinerThread<D> {
    device_id: usize,
    thread: usize,
    ctx: WorkerContext,
    hasher: Option<ScanHasher<D>>,
    restart_rx: Receiver<RestartSignal<D>>,
    work_rx: Receiver<WorkItem>,
    work: Option<WorkItem>,
    paused: bool,
}

enum Flow {
    Continue,
    Exit,
}

impl<D: ComputeDevice> MinerThread<D> {
    /// Thread for slot `thread` of `device_id`; `device` is None when init failed
    pub fn new(
        device_id: usize,
        thread: usize,
        device: Option<D>,
        ctx: WorkerContext,
        restart_rx: Receiver<RestartSignal<D>>,
        work_rx: Receiver<WorkItem>,
    ) -> Self {
        let hasher = device.map(|d| ScanHasher::new(device_id, d, ctx.dynamic_interval, Instant::now()));
        Self {
            device_id,
            thread,
            ctx,
            hasher,
            restart_rx,
            work_rx,
            work: None,
            paused: true,
        }
    }

    fn apply(&mut self, signal: RestartSignal<D>) -> Flow {
        match signal {
            RestartSignal::Restarted(device) => {
                tracing::debug!("GPU {} thread {} resuming on fresh runtime", self.device_id, self.thread);
                self.hasher = Some(ScanHasher::new(
                    self.device_id,
                    device,
                    self.ctx.dynamic_interval,
                    Instant::now(),
                ));
                Flow::Continue
            }
            RestartSignal::Failed => {
                self.hasher = None;
                Flow::Continue
            }
            RestartSignal::Halt => {
                self.hasher = None;
                Flow::Continue
            }
            RestartSignal::Shutdown => Flow::Exit,
        }
    }

    fn runnable(&self) -> bool {
        if self.hasher.is_none() {
            return false;
        }
        let thread = self.thread;
        self.ctx
            .registry
            .with(self.device_id, |d| {
                d.enabled && d.health == DeviceHealth::Well && !(thread > 0 && d.pauses_extra_threads())
            })
            .unwrap_or(false)
    }

    fn drain(&mut self) -> Flow {
        loop {
            match self.restart_rx.try_recv() {
                Ok(signal) => {
                    if let Flow::Exit = self.apply(signal) {
                        return Flow::Exit;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Flow::Exit,
            }
        }
        loop {
            match self.work_rx.try_recv() {
                Ok(work) => self.work = Some(work),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Flow::Exit,
            }
        }
        Flow::Continue
    }

    fn wait(&mut self) -> Flow {
        select! {
            recv(self.restart_rx) -> signal => match signal {
                Ok(signal) => self.apply(signal),
                Err(_) => Flow::Exit,
            },
            recv(self.work_rx) -> work => match work {
                Ok(work) => {
                    self.work = Some(work);
                    Flow::Continue
                }
                Err(_) => Flow::Exit,
            },
            default(self.ctx.idle) => Flow::Continue,
        }
    }

    /// Block until the supervisor settles the restart
    fn await_restart(&mut self) -> Flow {
        loop {
            match self.restart_rx.recv() {
                Ok(RestartSignal::Halt) => continue,
                Ok(signal) => return self.apply(signal),
                Err(_) => return Flow::Exit,
            }
        }
    }

    fn step(&mut self) -> Flow {
        let (Some(hasher), Some(work)) = (self.hasher.as_mut(), self.work.as_mut()) else {
            return Flow::Continue;
        };
        let Some((mut intensity, generation)) = self
            .ctx
            .registry
            .with(self.device_id, |d| (d.intensity(), d.intensity_generation()))
        else {
            return Flow::Exit;
        };

        let now = Instant::now();
        if self.paused {
            hasher.reset_timer(now);
            self.paused = false;
        }

        match hasher.scanhash(work, &mut intensity, now, self.ctx.sink.as_ref()) {
            Ok(hashes) => {
                let secs = now.elapsed().as_secs_f64();
                let max_hashes = hasher.max_hashes();
                self.ctx.registry.with(self.device_id, |d| {
                    d.sync_intensity(intensity, generation);
                    d.hash_rate.record(hashes, secs);
                    d.hash_rate.max_hashes = d.hash_rate.max_hashes.max(max_hashes);
                });
                Flow::Continue
            }
            Err(e) => {
                tracing::error!("❌ GPU {} thread {} scan failed: {}", self.device_id, self.thread, e);
                self.hasher = None;
                self.ctx.registry.set_health(self.device_id, DeviceHealth::Sick);
                self.ctx.observer.device_health(self.device_id, DeviceHealth::Sick);
                self.ctx.reinit.request(self.device_id);
                self.await_restart()
            }
        }
    }

    /// Run until shutdown
    pub fn run(mut self) {
        tracing::debug!("GPU {} thread {} started", self.device_id, self.thread);
        loop {
            if let Flow::Exit = self.drain() {
                break;
            }
            let has_work = self.work.as_ref().map(|w| !w.is_exhausted()).unwrap_or(false);
            let flow = if has_work && self.runnable() {
                self.step()
            } else {
                self.paused = true;
                self.wait()
            };
            if let Flow::Exit = flow {
                break;
            }
        }
        tracing::debug!("GPU {} thread {} stopped", self.device_id, self.thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::{DeviceDescriptor, Intensity};
    use crate::gpu::supervisor::{reinit_channel, ReinitSupervisor, SlotHandle, SupervisorMessage};
    use crate::gpu::testing::{self, FakeDevice, FakeFactory, FakeState, RecordingHealth, RecordingSink};
    use crate::gpu::variant::KernelVariant;
    use crossbeam_channel::Sender;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct Rig {
        registry: Arc<DeviceRegistry>,
        health: Arc<RecordingHealth>,
        reinit_rx: Receiver<SupervisorMessage>,
        restart_tx: Sender<RestartSignal<FakeDevice>>,
        work_tx: Sender<WorkItem>,
        state: Arc<Mutex<FakeState>>,
    }

    fn rig(thread: usize, mode: Intensity) -> (MinerThread<FakeDevice>, Rig) {
        let mut desc = DeviceDescriptor::new(0, "Tahiti");
        desc.transition(DeviceHealth::Well);
        desc.threads = 2;
        desc.set_mode(mode);
        let registry = Arc::new(DeviceRegistry::new(vec![desc]));
        let (reinit, reinit_rx) = reinit_channel(1);
        let health = Arc::new(RecordingHealth::default());
        let ctx = WorkerContext {
            registry: registry.clone(),
            reinit,
            sink: Arc::new(RecordingSink::default()),
            observer: health.clone(),
            dynamic_interval: Duration::from_millis(7),
            idle: Duration::from_millis(1),
        };
        let (restart_tx, restart_rx) = crossbeam_channel::unbounded();
        let (work_tx, work_rx) = crossbeam_channel::unbounded();
        let device = FakeDevice::new(testing::tuning(KernelVariant::CKolivas));
        let state = device.state.clone();
        let thread = MinerThread::new(0, thread, Some(device), ctx, restart_rx, work_rx);
        (thread, Rig { registry, health, reinit_rx, restart_tx, work_tx, state })
    }

    #[test]
    fn test_step_accounts_hashes() {
        let (mut t, r) = rig(0, Intensity::Fixed(10));
        r.work_tx.send(testing::work(1)).unwrap();
        assert!(matches!(t.drain(), Flow::Continue));
        assert!(t.runnable());
        assert!(matches!(t.step(), Flow::Continue));

        let desc = r.registry.snapshot(0).unwrap();
        assert_eq!(desc.hash_rate.total_hashes, 1 << 10);
        assert_eq!(desc.hash_rate.max_hashes, 1 << 10);
        assert_eq!(t.work.as_ref().unwrap().nonce, 1 << 10);
    }

    #[test]
    fn test_latest_work_wins() {
        let (mut t, r) = rig(0, Intensity::Fixed(10));
        r.work_tx.send(testing::work(1)).unwrap();
        r.work_tx.send(testing::work(2)).unwrap();
        t.drain();
        assert_eq!(t.work.as_ref().unwrap().id, 2);
    }

    #[test]
    fn test_extra_threads_pause_in_dynamic_mode() {
        let (t0, _r0) = rig(0, Intensity::Dynamic(10));
        assert!(t0.runnable());
        let (t1, r1) = rig(1, Intensity::Dynamic(10));
        assert!(!t1.runnable());
        r1.registry.with(0, |d| d.set_intensity(10).unwrap());
        assert!(t1.runnable());
    }

    #[test]
    fn test_disabled_or_unwell_does_not_dispatch() {
        let (t, r) = rig(0, Intensity::Fixed(10));
        r.registry.with(0, |d| d.enabled = false);
        assert!(!t.runnable());
        r.registry.with(0, |d| {
            d.enabled = true;
            d.begin_restart();
        });
        assert!(!t.runnable());
    }

    #[test]
    fn test_dispatch_failure_requests_one_reinit() {
        let (mut t, r) = rig(0, Intensity::Fixed(10));
        r.state.lock().unwrap().fail_enqueue_at = Some(2);
        r.work_tx.send(testing::work(1)).unwrap();
        t.drain();
        assert!(matches!(t.step(), Flow::Continue));
        assert_eq!(r.state.lock().unwrap().enqueue_events(), 1);

        // Second iteration fails; the supervisor's verdict is already queued
        r.restart_tx.send(RestartSignal::Halt).unwrap();
        r.restart_tx.send(RestartSignal::Failed).unwrap();
        assert!(matches!(t.step(), Flow::Continue));

        assert_eq!(r.registry.health(0), Some(DeviceHealth::Sick));
        assert_eq!(*r.health.changes.lock().unwrap(), vec![(0, DeviceHealth::Sick)]);
        assert_eq!(r.reinit_rx.try_recv(), Ok(SupervisorMessage::Restart(0)));
        assert!(r.reinit_rx.try_recv().is_err());
        assert!(t.hasher.is_none());
        assert!(!t.runnable());
        assert_eq!(r.state.lock().unwrap().enqueue_events(), 1);
    }

    #[test]
    fn test_skipped_restart_releases_thread() {
        let (mut t, r) = rig(0, Intensity::Fixed(10));
        r.state.lock().unwrap().fail_enqueue_at = Some(1);
        r.work_tx.send(testing::work(1)).unwrap();
        t.drain();

        // The platform reports another GPU since start-up
        let factory = Arc::new(FakeFactory::new(1));
        factory.count.store(2, Ordering::SeqCst);
        let handle = t.ctx.reinit.clone();
        let supervisor = ReinitSupervisor::new(
            factory.clone(),
            r.registry.clone(),
            r.health.clone(),
            vec![SlotHandle { device_id: 0, thread: 0, tx: r.restart_tx.clone() }],
            handle.clone(),
            1,
            Arc::new(AtomicBool::new(false)),
        );
        let reinit_rx = r.reinit_rx.clone();
        let supervisor = std::thread::spawn(move || supervisor.run(reinit_rx));

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let worker = std::thread::spawn(move || {
            let flow = t.step();
            let _ = done_tx.send((matches!(flow, Flow::Continue), t.hasher.is_none()));
            t
        });
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)), Ok((true, true)));
        let t = worker.join().unwrap();

        assert_eq!(r.registry.health(0), Some(DeviceHealth::Dead));
        assert_eq!(
            *r.health.changes.lock().unwrap(),
            vec![(0, DeviceHealth::Sick), (0, DeviceHealth::Dead)]
        );
        assert_eq!(factory.init_count(0), 0);
        assert!(!t.runnable());

        assert!(handle.shutdown());
        supervisor.join().unwrap();
    }

    #[test]
    fn test_restarted_runtime_resumes() {
        let (mut t, r) = rig(0, Intensity::Fixed(10));
        r.restart_tx.send(RestartSignal::Halt).unwrap();
        t.drain();
        assert!(t.hasher.is_none());

        let device = FakeDevice::new(testing::tuning(KernelVariant::CKolivas));
        r.restart_tx.send(RestartSignal::Restarted(device)).unwrap();
        t.drain();
        assert!(t.runnable());
    }

    #[test]
    fn test_run_exits_on_shutdown() {
        let (t, r) = rig(0, Intensity::Fixed(8));
        r.work_tx.send(testing::work(1)).unwrap();
        r.restart_tx.send(RestartSignal::Shutdown).unwrap();
        let join = std::thread::spawn(move || t.run());
        join.join().unwrap();
    }
}
