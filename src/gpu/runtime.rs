// src/gpu/runtime.rs - Device runtime interface and work items
// Tree location: ./src/gpu/runtime.rs

//! The seam between the dispatch loop and the native compute API
//!
//! A [`ComputeDevice`] owns one device's program, command queue and buffers.
//! The dispatch loop only talks to it through this trait, so the loop runs
//! the same against `ocl` and against the scripted device used in tests.
//!
//! # Result Buffer Layout
//! - 16 `u32` slots
//! - slot 15 (`FOUND`) counts the nonces the kernel wrote into slots 0..15

use super::error::DispatchError;
use super::tuning::DeviceTuning;
use crate::OclScanError;

/// Slots in the result buffer
pub const OUTPUT_SLOTS: usize = 16;
/// Slot holding the found counter
pub const FOUND: usize = 15;
/// Result buffer size in bytes
pub const OUTPUT_BYTES: usize = OUTPUT_SLOTS * std::mem::size_of::<u32>();

/// Host copy of the result buffer
pub type ResultBuffer = [u32; OUTPUT_SLOTS];

/// Header length in bytes
pub const HEADER_BYTES: usize = 80;

/// One unit of work handed to a device thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Caller assigned id
    pub id: u64,
    /// Block header
    pub data: [u8; HEADER_BYTES],
    /// SHA-256 midstate of the first header block (scrypt kernels)
    pub midstate: [u8; 32],
    /// 256-bit target, little-endian
    pub device_target: [u8; 32],
    /// Next nonce to scan
    pub nonce: u64,
    /// One past the last nonce of this item
    pub nonce_end: u64,
}

impl WorkItem {
    /// Work with the full 32-bit nonce space
    pub fn new(id: u64, data: [u8; HEADER_BYTES], device_target: [u8; 32]) -> Self {
        Self {
            id,
            data,
            midstate: [0u8; 32],
            device_target,
            nonce: 0,
            nonce_end: 1 << 32,
        }
    }

    /// Work from hex header and hex target
    pub fn from_hex(id: u64, header: &str, target: &str) -> crate::Result<Self> {
        let header = hex::decode(header.trim())?;
        let target = hex::decode(target.trim())?;
        let data: [u8; HEADER_BYTES] = header.as_slice().try_into().map_err(|_| {
            OclScanError::Work(format!("Header must be {} bytes, got {}", HEADER_BYTES, header.len()))
        })?;
        let device_target: [u8; 32] = target.as_slice().try_into().map_err(|_| {
            OclScanError::Work(format!("Target must be 32 bytes, got {}", target.len()))
        })?;
        Ok(Self::new(id, data, device_target))
    }

    /// Set the midstate
    pub fn with_midstate(mut self, midstate: [u8; 32]) -> Self {
        self.midstate = midstate;
        self
    }

    /// `device_target[28..32]` as little-endian u32
    pub fn le_target32(&self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.device_target[28..32]);
        u32::from_le_bytes(b)
    }

    /// `device_target[24..32]` as little-endian u64
    pub fn le_target64(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.device_target[24..32]);
        u64::from_le_bytes(b)
    }

    /// Midstate half as four native u32 words
    pub fn midstate_words(&self, hi: bool) -> [u32; 4] {
        let base = if hi { 16 } else { 0 };
        let mut out = [0u32; 4];
        for (i, w) in out.iter_mut().enumerate() {
            let mut b = [0u8; 4];
            b.copy_from_slice(&self.midstate[base + i * 4..base + i * 4 + 4]);
            *w = u32::from_le_bytes(b);
        }
        out
    }

    /// Header with every 32-bit word byte-swapped
    pub fn flipped_header(&self) -> [u8; HEADER_BYTES] {
        let mut out = self.data;
        for word in out.chunks_exact_mut(4) {
            word.reverse();
        }
        out
    }

    /// Nonce range used up
    pub fn is_exhausted(&self) -> bool {
        self.nonce >= self.nonce_end
    }

    /// Split the remaining nonce range into `parts` contiguous items
    pub fn split(&self, parts: usize) -> Vec<WorkItem> {
        let parts = parts.max(1) as u64;
        let span = self.nonce_end.saturating_sub(self.nonce);
        let step = span / parts;
        (0..parts)
            .map(|i| {
                let start = self.nonce + i * step;
                let end = if i + 1 == parts { self.nonce_end } else { start + step };
                WorkItem { nonce: start, nonce_end: end, ..self.clone() }
            })
            .collect()
    }
}

/// Device buffers that can be bound as kernel arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSlot {
    /// Header input
    Input,
    /// Result buffer
    Output,
    /// Scrypt scratch pad
    Pad,
    /// Chained hash buffer
    Hash,
}

/// Resolved kernel argument value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageArg {
    /// Device buffer
    Buffer(BufferSlot),
    /// `uint4` by value
    Uint4([u32; 4]),
    /// `uint` by value
    U32(u32),
    /// `ulong` by value
    U64(u64),
}

/// NDRange for one enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launch {
    /// Global work size
    pub global_threads: u64,
    /// Local work size
    pub local_threads: u32,
    /// Global offset (start nonce) when supported
    pub global_offset: Option<u64>,
}

/// One device's program, queue and buffers
pub trait ComputeDevice: Send {
    /// Tuning the runtime was built with
    fn tuning(&self) -> &DeviceTuning;

    /// Upload the 80-byte header into the input buffer (blocking)
    fn write_header(&mut self, header: &[u8; HEADER_BYTES]) -> Result<(), DispatchError>;

    /// Bind argument `index` of stage `stage`
    fn set_arg(&mut self, stage: usize, index: u32, arg: StageArg) -> Result<(), DispatchError>;

    /// Enqueue stage `stage`
    fn enqueue_stage(&mut self, stage: usize, launch: Launch) -> Result<(), DispatchError>;

    /// Enqueue a non-blocking read of the result buffer into the host copy
    fn enqueue_read_results(&mut self) -> Result<(), DispatchError>;

    /// Wait for everything queued
    fn finish(&mut self) -> Result<(), DispatchError>;

    /// Host copy of the results, valid after [`ComputeDevice::finish`]
    fn results(&self) -> &ResultBuffer;

    /// Enqueue a zero fill of the device result buffer and zero the host copy
    fn clear_results(&mut self) -> Result<(), DispatchError>;

    /// Make sure the hash buffer holds `threads` entries
    fn ensure_hash_buffer(&mut self, threads: u64) -> Result<(), DispatchError>;
}

impl<D: ComputeDevice + ?Sized> ComputeDevice for Box<D> {
    fn tuning(&self) -> &DeviceTuning {
        (**self).tuning()
    }
    fn write_header(&mut self, header: &[u8; HEADER_BYTES]) -> Result<(), DispatchError> {
        (**self).write_header(header)
    }
    fn set_arg(&mut self, stage: usize, index: u32, arg: StageArg) -> Result<(), DispatchError> {
        (**self).set_arg(stage, index, arg)
    }
    fn enqueue_stage(&mut self, stage: usize, launch: Launch) -> Result<(), DispatchError> {
        (**self).enqueue_stage(stage, launch)
    }
    fn enqueue_read_results(&mut self) -> Result<(), DispatchError> {
        (**self).enqueue_read_results()
    }
    fn finish(&mut self) -> Result<(), DispatchError> {
        (**self).finish()
    }
    fn results(&self) -> &ResultBuffer {
        (**self).results()
    }
    fn clear_results(&mut self) -> Result<(), DispatchError> {
        (**self).clear_results()
    }
    fn ensure_hash_buffer(&mut self, threads: u64) -> Result<(), DispatchError> {
        (**self).ensure_hash_buffer(threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work() -> WorkItem {
        let mut data = [0u8; 80];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut target = [0u8; 32];
        target[24..32].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        WorkItem::new(1, data, target)
    }

    #[test]
    fn test_targets() {
        let w = work();
        assert_eq!(w.le_target32(), u32::from_le_bytes([5, 6, 7, 8]));
        assert_eq!(w.le_target64(), u64::from_le_bytes([1, 2, 3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn test_flip80() {
        let flipped = work().flipped_header();
        assert_eq!(&flipped[0..8], &[3, 2, 1, 0, 7, 6, 5, 4]);
        assert_eq!(&flipped[76..80], &[79, 78, 77, 76]);
    }

    #[test]
    fn test_from_hex_lengths() {
        let header = "00".repeat(80);
        let target = "ff".repeat(32);
        let w = WorkItem::from_hex(7, &header, &target).unwrap();
        assert_eq!(w.id, 7);
        assert_eq!(w.le_target64(), u64::MAX);
        assert!(WorkItem::from_hex(7, "00", &target).is_err());
        assert!(WorkItem::from_hex(7, "zz", &target).is_err());
    }

    #[test]
    fn test_split_covers_range() {
        let parts = work().split(3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].nonce, 0);
        assert_eq!(parts[2].nonce_end, 1 << 32);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].nonce_end, pair[1].nonce);
        }
    }

    #[test]
    fn test_midstate_words() {
        let mut mid = [0u8; 32];
        mid[16] = 1;
        let w = work().with_midstate(mid);
        assert_eq!(w.midstate_words(true), [1, 0, 0, 0]);
        assert_eq!(w.midstate_words(false), [0, 0, 0, 0]);
    }
}
