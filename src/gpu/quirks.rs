// src/gpu/quirks.rs - Hardware quirks applied to compiled kernel images
// Tree location: ./src/gpu/quirks.rs

//! Post-compile binary fixups for specific hardware
//!
//! Evergreen and Northern Islands GPUs have `BFI_INT` in silicon but pre-1.2
//! compilers never emit it. The kernels are built with `-D BFI_INT` so they
//! use `amd_bytealign`, then every unflagged `BYTE_ALIGN_INT` ALU word in the
//! compiled image is rewritten to `BFI_INT`.
//!
//! # Version History
//! - 0.1.0: BFI_INT patch for AMD legacy image layout
//!
//! The image layout assumptions (marker offsets) are tied to the old AMD APP
//! compiler. Any marker miss is reported as [`QuirkError`] and the loader
//! falls back to a plain source build.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tuning::DeviceProbe;

/// Quirks known to the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuirkId {
    /// `BYTE_ALIGN_INT` to `BFI_INT` rewrite
    BfiInt,
}

impl QuirkId {
    /// Implementation for this quirk
    pub fn quirk(self) -> &'static dyn HardwareQuirk {
        match self {
            QuirkId::BfiInt => &BfiIntPatch,
        }
    }
}

/// A binary fixup tied to specific hardware
pub trait HardwareQuirk: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Does this device need the fixup
    fn applies(&self, probe: &DeviceProbe) -> bool;

    /// Compiler define that prepares the source for the patch
    fn compiler_define(&self) -> &'static str;

    /// Rewrite the compiled image in place
    fn patch(&self, image: &mut [u8]) -> Result<PatchReport, QuirkError>;
}

/// Counters from one patch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// BFE_INT candidates seen
    pub bfe_int: u32,
    /// BFE_UINT candidates seen
    pub bfe_uint: u32,
    /// BYTE_ALIGN_INT candidates seen
    pub byte_align: u32,
    /// Words rewritten
    pub patched: u32,
}

/// Image could not be patched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuirkError {
    /// A required marker string is missing
    #[error("Marker \"{0}\" not found")]
    MarkerNotFound(&'static str),
    /// Code region points outside the image
    #[error("Code region {start}+{length} exceeds image of {image} bytes")]
    OutOfBounds {
        /// Region start offset
        start: usize,
        /// Region length
        length: usize,
        /// Image size
        image: usize,
    },
}

/// Pick the quirk a device needs, if any
pub fn select_quirk(probe: &DeviceProbe) -> Option<QuirkId> {
    [QuirkId::BfiInt].into_iter().find(|q| q.quirk().applies(probe))
}

/// GPUs that have BFI_INT but whose compilers don't emit it
pub const BFI_INT_DEVICES: &[&str] = &[
    "Cedar", "Redwood", "Juniper", "Cypress", "Hemlock", "Caicos", "Turks", "Barts", "Cayman",
    "Antilles", "Wrestler", "Zacate", "WinterPark",
];

const OP3_INST_BFE_UINT: u64 = 4;
const OP3_INST_BFE_INT: u64 = 5;
const OP3_INST_BFI_INT: u64 = 6;
const OP3_INST_BYTE_ALIGN_INT: u64 = 13;

const ALU_INST_SHIFT: u32 = 45;
const ALU_INST_CLEAR: u64 = 0xfffc_1fff_ffff_ffff;

// Offsets from the second ".text" marker to the code start and length words
const TEXT_START_OFFSET: usize = 285;
const TEXT_LENGTH_OFFSET: usize = 289;

/// BYTE_ALIGN_INT to BFI_INT rewrite
#[derive(Debug, Clone, Copy, Default)]
pub struct BfiIntPatch;

impl HardwareQuirk for BfiIntPatch {
    fn name(&self) -> &'static str {
        "BFI_INT"
    }

    fn applies(&self, probe: &DeviceProbe) -> bool {
        probe.has_bit_align()
            && !probe.opencl12plus()
            && BFI_INT_DEVICES.iter().any(|d| probe.name.contains(d))
    }

    fn compiler_define(&self) -> &'static str {
        "BFI_INT"
    }

    fn patch(&self, image: &mut [u8]) -> Result<PatchReport, QuirkError> {
        let region = locate_code(image)?;
        tracing::debug!("At offset {} ({} bytes), to begin patching", region.start, region.len());
        let report = patch_opcodes(&mut image[region]);
        tracing::debug!(
            "Potential OP3 instructions identified: {} BFE_INT, {} BFE_UINT, {} BYTE_ALIGN",
            report.bfe_int,
            report.bfe_uint,
            report.byte_align
        );
        tracing::debug!("Patched a total of {} BFI_INT instructions", report.patched);
        Ok(report)
    }
}

/// Rewrite every unflagged BYTE_ALIGN_INT word in `code`
///
/// `code` is a run of little-endian 64-bit ALU words; a trailing partial
/// word is left alone.
pub fn patch_opcodes(code: &mut [u8]) -> PatchReport {
    let mut report = PatchReport::default();
    for chunk in code.chunks_exact_mut(8) {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let mut op = u64::from_le_bytes(word);

        let clamp = (op >> 63) & 0x1;
        let dest_rel = (op >> 60) & 0x1;
        let alu_inst = (op >> ALU_INST_SHIFT) & 0x1f;
        let s2_neg = (op >> 44) & 0x1;
        let s2_rel = (op >> 41) & 0x1;
        let pred_sel = (op >> 29) & 0x3;
        if clamp | dest_rel | s2_neg | s2_rel | pred_sel != 0 {
            continue;
        }

        match alu_inst {
            OP3_INST_BFE_INT => report.bfe_int += 1,
            OP3_INST_BFE_UINT => report.bfe_uint += 1,
            OP3_INST_BYTE_ALIGN_INT => {
                report.byte_align += 1;
                op = (op & ALU_INST_CLEAR) | (OP3_INST_BFI_INT << ALU_INST_SHIFT);
                chunk.copy_from_slice(&op.to_le_bytes());
                report.patched += 1;
            }
            _ => {}
        }
    }
    report
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Second occurrence of `marker`, or the first when there is only one
fn second_or_first(image: &[u8], marker: &'static str) -> Result<usize, QuirkError> {
    let first = find(image, 0, marker.as_bytes()).ok_or(QuirkError::MarkerNotFound(marker))?;
    Ok(find(image, first + 1, marker.as_bytes()).unwrap_or(first))
}

fn read_u32(image: &[u8], at: usize) -> Result<u32, QuirkError> {
    let bytes = image
        .get(at..at + 4)
        .ok_or(QuirkError::OutOfBounds { start: at, length: 4, image: image.len() })?;
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    Ok(u32::from_le_bytes(word))
}

/// Byte range of the ALU code inside a compiled image
pub fn locate_code(image: &[u8]) -> Result<std::ops::Range<usize>, QuirkError> {
    let text = second_or_first(image, ".text")?;
    let start = read_u32(image, text + TEXT_START_OFFSET)? as usize;
    let length = read_u32(image, text + TEXT_LENGTH_OFFSET)? as usize;

    // inner ELF header begins one byte before "ELF"
    let elf = second_or_first(image, "ELF")?;
    let base = elf
        .checked_sub(1)
        .ok_or(QuirkError::MarkerNotFound("ELF"))?;

    let begin = base.saturating_add(start);
    let end = begin.saturating_add(length);
    if end > image.len() {
        return Err(QuirkError::OutOfBounds { start: begin, length, image: image.len() });
    }
    Ok(begin..end)
}
