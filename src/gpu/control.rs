// src/gpu/control.rs - Operator command path
// Tree location: ./src/gpu/control.rs

//! Operator commands: enable, disable, restart, intensity
//!
//! Commands are applied by one control thread, in arrival order. Callers
//! get the outcome back on a per-command reply channel.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::device::{DeviceDescriptor, DeviceHealth, IntensityError};
use super::registry::DeviceRegistry;
use super::sizing::set_threads_hashes;
use super::supervisor::ReinitHandle;
use super::tuning::{hash_buffer_size, DEFAULT_WORK_SIZE};

/// Requested intensity mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "lowercase")]
pub enum IntensityRequest {
    /// Dynamic, starting from the current exponent
    Dynamic,
    /// Fixed `2^n`
    Fixed(i32),
    /// xintensity
    Shader(u32),
    /// rawintensity
    Raw(u32),
}

/// One operator action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorCommand {
    /// Resume mining on a WELL device
    Enable(usize),
    /// Stop dispatching on a device
    Disable(usize),
    /// Reinitialise a device
    Restart(usize),
    /// Change the intensity mode
    SetIntensity(usize, IntensityRequest),
}

/// Rejected operator commands
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// No such device
    #[error("Invalid GPU {0}")]
    InvalidDevice(usize),

    /// Enable on an enabled device
    #[error("GPU {0} is already enabled")]
    AlreadyEnabled(usize),

    /// Disable on a disabled device
    #[error("GPU {0} is already disabled")]
    AlreadyDisabled(usize),

    /// Enable refused until the device is WELL again
    #[error("GPU {0} is {1}: must restart device before enabling it")]
    NotWell(usize, DeviceHealth),

    /// Value outside the mode's range
    #[error("Invalid intensity: {0}")]
    Intensity(#[from] IntensityError),

    /// Chained variants cannot fit the batch's hash buffer
    #[error("Hash buffer of {requested} bytes exceeds max alloc {max_alloc}, decrease intensity/xintensity/rawintensity")]
    BufferTooLarge {
        /// Bytes the new batch would need
        requested: u64,
        /// Device maximum single allocation
        max_alloc: u64,
    },

    /// Control thread has stopped
    #[error("Control thread unavailable")]
    Unavailable,
}

/// Command plus its reply channel
pub type ControlRequest = (OperatorCommand, Sender<Result<(), ControlError>>);

/// Sender side of the command queue
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: Sender<ControlRequest>,
}

impl ControlHandle {
    /// Apply `command` and wait for the outcome
    pub fn execute(&self, command: OperatorCommand) -> Result<(), ControlError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send((command, reply_tx))
            .map_err(|_| ControlError::Unavailable)?;
        reply_rx.recv().map_err(|_| ControlError::Unavailable)?
    }

    /// Enable a device
    pub fn enable(&self, id: usize) -> Result<(), ControlError> {
        self.execute(OperatorCommand::Enable(id))
    }

    /// Disable a device
    pub fn disable(&self, id: usize) -> Result<(), ControlError> {
        self.execute(OperatorCommand::Disable(id))
    }

    /// Restart a device
    pub fn restart(&self, id: usize) -> Result<(), ControlError> {
        self.execute(OperatorCommand::Restart(id))
    }

    /// Change a device's intensity
    pub fn set_intensity(&self, id: usize, request: IntensityRequest) -> Result<(), ControlError> {
        self.execute(OperatorCommand::SetIntensity(id, request))
    }
}

/// Applies operator commands to the registry
pub struct Controller {
    registry: Arc<DeviceRegistry>,
    reinit: ReinitHandle,
}

/// Control thread plus the handle feeding it
pub fn control_channel(
    registry: Arc<DeviceRegistry>,
    reinit: ReinitHandle,
) -> (ControlHandle, Controller, Receiver<ControlRequest>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (ControlHandle { tx }, Controller { registry, reinit }, rx)
}

impl Controller {
    /// Apply commands until every handle is dropped
    pub fn spawn(self, rx: Receiver<ControlRequest>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new().name("control".to_string()).spawn(move || {
            for (command, reply) in rx.iter() {
                let outcome = self.apply(command);
                if let Err(e) = &outcome {
                    tracing::warn!("⚠️  {:?} rejected: {}", command, e);
                }
                let _ = reply.send(outcome);
            }
        })
    }

    /// Apply one command
    pub fn apply(&self, command: OperatorCommand) -> Result<(), ControlError> {
        match command {
            OperatorCommand::Enable(id) => self.modify(id, |d| {
                if d.enabled {
                    return Err(ControlError::AlreadyEnabled(id));
                }
                if d.health != DeviceHealth::Well {
                    return Err(ControlError::NotWell(id, d.health));
                }
                d.enabled = true;
                tracing::info!("✅ GPU {} enabled", id);
                Ok(())
            }),
            OperatorCommand::Disable(id) => self.modify(id, |d| {
                if !d.enabled {
                    return Err(ControlError::AlreadyDisabled(id));
                }
                d.enabled = false;
                tracing::info!("GPU {} disabled", id);
                Ok(())
            }),
            OperatorCommand::Restart(id) => {
                if id >= self.registry.len() {
                    return Err(ControlError::InvalidDevice(id));
                }
                if !self.reinit.request(id) {
                    tracing::info!("GPU {} restart already under way", id);
                }
                Ok(())
            }
            OperatorCommand::SetIntensity(id, request) => self.modify(id, |d| set_intensity(d, request)),
        }
    }

    fn modify(
        &self,
        id: usize,
        f: impl FnOnce(&mut DeviceDescriptor) -> Result<(), ControlError>,
    ) -> Result<(), ControlError> {
        self.registry
            .with(id, f)
            .unwrap_or(Err(ControlError::InvalidDevice(id)))
    }
}

fn set_intensity(d: &mut DeviceDescriptor, request: IntensityRequest) -> Result<(), ControlError> {
    let previous = d.intensity();
    match request {
        IntensityRequest::Dynamic => d.set_dynamic(),
        IntensityRequest::Fixed(v) => d.set_intensity(v)?,
        IntensityRequest::Shader(v) => d.set_xintensity(v)?,
        IntensityRequest::Raw(v) => d.set_rawintensity(v)?,
    }

    if d.kernel.spec().family.needs_hash_buffer() {
        if let Some(runtime) = d.runtime {
            let mut probe = d.intensity();
            let floor = if runtime.work_size > 0 { runtime.work_size } else { DEFAULT_WORK_SIZE };
            let sizing = set_threads_hashes(
                runtime.vector_width,
                runtime.compute_shaders,
                floor as u64,
                &mut probe,
            );
            let requested = hash_buffer_size(sizing.global_threads);
            if requested > runtime.max_alloc {
                d.set_mode(previous);
                return Err(ControlError::BufferTooLarge {
                    requested,
                    max_alloc: runtime.max_alloc,
                });
            }
        }
    }

    if d.intensity().is_dynamic() && d.threads > 1 {
        tracing::warn!("⚠️  GPU {}: dynamic intensity only runs the first of {} threads", d.id, d.threads);
    }
    tracing::info!("GPU {} intensity set to {}", d.id, d.intensity());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::{Intensity, RuntimeSummary};
    use crate::gpu::supervisor::{reinit_channel, SupervisorMessage};
    use crate::gpu::variant::KernelVariant;

    fn controller(devices: Vec<DeviceDescriptor>) -> (Controller, Receiver<SupervisorMessage>) {
        let (reinit, rx) = reinit_channel(devices.len());
        let registry = Arc::new(DeviceRegistry::new(devices));
        (Controller { registry, reinit }, rx)
    }

    #[test]
    fn test_enable_requires_well() {
        let mut d = DeviceDescriptor::new(0, "Tahiti");
        d.enabled = false;
        let (c, _rx) = controller(vec![d]);

        assert_eq!(
            c.apply(OperatorCommand::Enable(0)),
            Err(ControlError::NotWell(0, DeviceHealth::Init))
        );
        c.registry.set_health(0, DeviceHealth::Well);
        assert_eq!(c.apply(OperatorCommand::Enable(0)), Ok(()));
        assert_eq!(c.apply(OperatorCommand::Enable(0)), Err(ControlError::AlreadyEnabled(0)));
        assert_eq!(c.apply(OperatorCommand::Disable(0)), Ok(()));
        assert_eq!(c.apply(OperatorCommand::Disable(0)), Err(ControlError::AlreadyDisabled(0)));
        assert_eq!(c.apply(OperatorCommand::Disable(3)), Err(ControlError::InvalidDevice(3)));
    }

    #[test]
    fn test_restart_queues_once() {
        let (c, rx) = controller(vec![DeviceDescriptor::new(0, "Tahiti")]);
        assert_eq!(c.apply(OperatorCommand::Restart(0)), Ok(()));
        assert_eq!(c.apply(OperatorCommand::Restart(0)), Ok(()));
        assert_eq!(rx.try_recv(), Ok(SupervisorMessage::Restart(0)));
        assert!(rx.try_recv().is_err());
        assert_eq!(c.apply(OperatorCommand::Restart(1)), Err(ControlError::InvalidDevice(1)));
    }

    #[test]
    fn test_intensity_modes_exclusive() {
        let (c, _rx) = controller(vec![DeviceDescriptor::new(0, "Tahiti")]);
        c.apply(OperatorCommand::SetIntensity(0, IntensityRequest::Shader(64))).unwrap();
        assert_eq!(c.registry.snapshot(0).unwrap().intensity(), Intensity::Shader(64));
        c.apply(OperatorCommand::SetIntensity(0, IntensityRequest::Fixed(20))).unwrap();
        c.apply(OperatorCommand::SetIntensity(0, IntensityRequest::Dynamic)).unwrap();
        assert_eq!(c.registry.snapshot(0).unwrap().intensity(), Intensity::Dynamic(20));

        assert!(matches!(
            c.apply(OperatorCommand::SetIntensity(0, IntensityRequest::Raw(0))),
            Err(ControlError::Intensity(IntensityError::Disabled))
        ));
        assert_eq!(c.registry.snapshot(0).unwrap().intensity(), Intensity::Dynamic(20));
    }

    #[test]
    fn test_chained_rollback_on_oversized_hash_buffer() {
        let mut d = DeviceDescriptor::new(0, "Tahiti");
        d.kernel = KernelVariant::X11Mod;
        d.set_intensity(16).unwrap();
        d.runtime = Some(RuntimeSummary {
            compute_shaders: 2048,
            work_size: 256,
            vector_width: 1,
            max_alloc: 64 << 20,
        });
        let (c, _rx) = controller(vec![d]);

        // 2^20 threads * 64 bytes = 64 MiB fits exactly
        c.apply(OperatorCommand::SetIntensity(0, IntensityRequest::Fixed(20))).unwrap();
        let err = c
            .apply(OperatorCommand::SetIntensity(0, IntensityRequest::Fixed(21)))
            .unwrap_err();
        assert_eq!(err, ControlError::BufferTooLarge { requested: 128 << 20, max_alloc: 64 << 20 });
        assert_eq!(c.registry.snapshot(0).unwrap().intensity(), Intensity::Fixed(20));
    }

    #[test]
    fn test_handle_round_trip() {
        let (reinit, _rx) = reinit_channel(1);
        let registry = Arc::new(DeviceRegistry::new(vec![DeviceDescriptor::new(0, "Tahiti")]));
        let (handle, controller, rx) = control_channel(registry.clone(), reinit);
        let join = controller.spawn(rx).unwrap();

        assert_eq!(handle.disable(0), Ok(()));
        assert!(!registry.snapshot(0).unwrap().enabled);
        assert_eq!(handle.enable(5), Err(ControlError::InvalidDevice(5)));

        drop(handle);
        join.join().unwrap();
    }
}
