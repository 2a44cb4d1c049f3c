// src/gpu/hooks.rs - Collaborator hooks for results and health
// Tree location: ./src/gpu/hooks.rs

//! Outbound interfaces: candidate nonces and device health changes
//!
//! The miner core only reports; verifying candidates and displaying health
//! belong to the caller.

use crossbeam_channel::Sender;

use super::device::DeviceHealth;
use super::runtime::{ResultBuffer, WorkItem, FOUND};

/// Receives result buffers with a nonzero found counter
pub trait ResultSink: Send + Sync {
    /// Handle one result buffer for `work`
    fn postprocess(&self, device_id: usize, work: &WorkItem, results: &ResultBuffer);
}

/// Receives device health changes
pub trait HealthObserver: Send + Sync {
    /// `device_id` is now `health`
    fn device_health(&self, device_id: usize, health: DeviceHealth);
}

/// Candidate nonces pulled out of a result buffer
pub fn candidate_nonces(results: &ResultBuffer) -> Vec<u32> {
    let found = (results[FOUND] as usize).min(FOUND);
    results[..found].to_vec()
}

/// Nonces reported by one device for one work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    /// Reporting device
    pub device_id: usize,
    /// Work item id
    pub work_id: u64,
    /// Candidate nonces
    pub nonces: Vec<u32>,
}

/// Logs candidates
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn postprocess(&self, device_id: usize, work: &WorkItem, results: &ResultBuffer) {
        let nonces = candidate_nonces(results);
        tracing::info!(
            "💎 GPU {} found {} candidate(s) for work {}: {:08x?}",
            device_id,
            nonces.len(),
            work.id,
            nonces
        );
    }
}

/// Forwards candidates over a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Candidates>,
}

impl ChannelSink {
    /// Sink feeding `tx`
    pub fn new(tx: Sender<Candidates>) -> Self {
        Self { tx }
    }
}

impl ResultSink for ChannelSink {
    fn postprocess(&self, device_id: usize, work: &WorkItem, results: &ResultBuffer) {
        let candidates = Candidates {
            device_id,
            work_id: work.id,
            nonces: candidate_nonces(results),
        };
        if self.tx.send(candidates).is_err() {
            tracing::debug!("Result receiver gone, dropping candidates from GPU {}", device_id);
        }
    }
}

/// Logs health changes
#[derive(Debug, Clone, Copy, Default)]
pub struct LogHealth;

impl HealthObserver for LogHealth {
    fn device_health(&self, device_id: usize, health: DeviceHealth) {
        match health {
            DeviceHealth::Well => tracing::info!("✅ GPU {} is {}", device_id, health),
            DeviceHealth::Init => tracing::info!("🔄 GPU {} is {}", device_id, health),
            _ => tracing::warn!("⚠️  GPU {} is {}", device_id, health),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_nonces() {
        let mut r: ResultBuffer = [0; 16];
        r[0] = 0xdead;
        r[1] = 0xbeef;
        r[FOUND] = 2;
        assert_eq!(candidate_nonces(&r), vec![0xdead, 0xbeef]);

        r[FOUND] = 99;
        assert_eq!(candidate_nonces(&r).len(), FOUND);
    }

    #[test]
    fn test_channel_sink() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = ChannelSink::new(tx);
        let work = WorkItem::new(9, [0; 80], [0; 32]);
        let mut r: ResultBuffer = [0; 16];
        r[0] = 42;
        r[FOUND] = 1;
        sink.postprocess(3, &work, &r);
        assert_eq!(
            rx.try_recv().unwrap(),
            Candidates { device_id: 3, work_id: 9, nonces: vec![42] }
        );
    }
}
