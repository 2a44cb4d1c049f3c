// src/gpu/registry.rs - Owned device descriptor collection
// Tree location: ./src/gpu/registry.rs

//! Device registry indexed by id
//!
//! Every descriptor sits behind its own lock so a worker updating its hash
//! counters never contends with another device. Structural changes (enable,
//! intensity, restart) go through the control and supervisor threads only.

use std::sync::{Mutex, MutexGuard};

use super::device::{DeviceDescriptor, DeviceHealth};

/// Shared descriptors, one lock per device
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Mutex<DeviceDescriptor>>,
}

impl DeviceRegistry {
    /// Registry over `devices`; ids are rewritten to match positions
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        let devices = devices
            .into_iter()
            .enumerate()
            .map(|(id, mut desc)| {
                desc.id = id;
                Mutex::new(desc)
            })
            .collect();
        Self { devices }
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True when no device is registered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn lock(&self, id: usize) -> Option<MutexGuard<'_, DeviceDescriptor>> {
        // A panicking worker must not make the descriptor unreachable
        self.devices
            .get(id)
            .map(|m| m.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Run `f` with exclusive access to device `id`
    pub fn with<R>(&self, id: usize, f: impl FnOnce(&mut DeviceDescriptor) -> R) -> Option<R> {
        self.lock(id).map(|mut guard| f(&mut guard))
    }

    /// Copy of device `id`
    pub fn snapshot(&self, id: usize) -> Option<DeviceDescriptor> {
        self.lock(id).map(|guard| guard.clone())
    }

    /// Copy of every device
    pub fn snapshots(&self) -> Vec<DeviceDescriptor> {
        (0..self.len()).filter_map(|id| self.snapshot(id)).collect()
    }

    /// Apply a state machine transition; false when refused or unknown id
    pub fn set_health(&self, id: usize, health: DeviceHealth) -> bool {
        self.with(id, |d| d.transition(health)).unwrap_or(false)
    }

    /// Current health of device `id`
    pub fn health(&self, id: usize) -> Option<DeviceHealth> {
        self.with(id, |d| d.health)
    }

    /// Sum of rolling hash rates
    pub fn total_rate(&self) -> f64 {
        (0..self.len())
            .filter_map(|id| self.with(id, |d| d.hash_rate.rolling))
            .sum()
    }
}
