// src/gpu/variant.rs - Kernel variants and pipeline descriptors
// Tree location: ./src/gpu/variant.rs

//! Closed set of kernel pipelines
//!
//! Each [`KernelVariant`] maps to one [`VariantSpec`] in [`VARIANTS`]: the
//! program source, the hash family, and the ordered stage chain with the
//! argument wiring of every stage. Adding a variant means adding one enum
//! value and one table entry.
//!
//! # Version History
//! - 0.1.0: scrypt and sph single-kernel variants
//! - 0.1.1: x11mod / x13mod chained pipelines with a shared hash buffer

use serde::{Deserialize, Serialize};
use thiserror::Error;
use std::fmt;
use std::str::FromStr;

/// Named kernel pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KernelVariant {
    /// alexkarnew scrypt
    AlexKarNew,
    /// alexkarold scrypt
    AlexKarOld,
    /// ckolivas scrypt (default)
    #[default]
    CKolivas,
    /// psw scrypt
    Psw,
    /// zuikkis scrypt
    Zuikkis,
    /// darkcoin X11
    Darkcoin,
    /// qubitcoin
    Qubitcoin,
    /// quarkcoin
    Quarkcoin,
    /// myriadcoin-groestl
    MyriadcoinGroestl,
    /// fuguecoin
    Fuguecoin,
    /// inkcoin (shavite)
    Inkcoin,
    /// animecoin
    Animecoin,
    /// groestlcoin
    Groestlcoin,
    /// sifcoin
    Sifcoin,
    /// twecoin
    Twecoin,
    /// marucoin X13
    Marucoin,
    /// chained X11
    X11Mod,
    /// chained X13
    X13Mod,
    /// chained X13 with fused echo/hamsi/fugue stage
    X13ModOld,
    /// fresh
    Fresh,
}

/// Hash family shared by several variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashFamily {
    /// Scrypt kernels with a scratch pad
    Scrypt,
    /// Single-kernel sph hashes
    Sph,
    /// Multi-stage sph chain sharing a hash buffer
    Chained,
}

impl HashFamily {
    /// Header is uploaded with every 32-bit word byte-swapped
    pub fn flips_header(self) -> bool {
        !matches!(self, HashFamily::Scrypt)
    }

    /// Needs the scrypt scratch pad
    pub fn needs_pad_buffer(self) -> bool {
        matches!(self, HashFamily::Scrypt)
    }

    /// Needs the inter-stage hash buffer
    pub fn needs_hash_buffer(self) -> bool {
        matches!(self, HashFamily::Chained)
    }

    /// Requests an out-of-order command queue
    pub fn out_of_order_queue(self) -> bool {
        !matches!(self, HashFamily::Chained)
    }
}

/// One kernel argument, by position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    /// 128-byte input buffer holding the header
    Input,
    /// 16-slot result buffer
    Output,
    /// Scrypt scratch pad
    PadBuffer,
    /// Inter-stage hash buffer
    HashBuffer,
    /// `midstate[0..16]` as four u32
    MidstateLo,
    /// `midstate[16..32]` as four u32
    MidstateHi,
    /// `device_target[28..32]` little-endian u32
    Target32,
    /// `device_target[24..32]` little-endian u64
    Target64,
}

/// One kernel in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    /// Kernel function name
    pub kernel: &'static str,
    /// Arguments in position order
    pub args: &'static [KernelArg],
}

/// Static description of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantSpec {
    /// Variant this entry describes
    pub variant: KernelVariant,
    /// Selection string and cached binary name
    pub name: &'static str,
    /// Source file stem (`<source>.cl`)
    pub source: &'static str,
    /// Hash family
    pub family: HashFamily,
    /// Logged as experimental when selected
    pub experimental: bool,
    /// Kernels in enqueue order
    pub stages: &'static [StageSpec],
    /// Extra compiler define
    pub extra_define: Option<&'static str>,
    /// Lookup gap this kernel requires
    pub forced_lookup_gap: Option<u32>,
    /// Work-group size this kernel requires
    pub forced_work_size: Option<u32>,
}

impl VariantSpec {
    /// Single-kernel variant
    pub fn is_single(&self) -> bool {
        self.stages.len() == 1
    }
}

use KernelArg::*;

const SCRYPT_ARGS: &[KernelArg] = &[Input, Output, PadBuffer, MidstateLo, MidstateHi, Target32];
const SPH_ARGS: &[KernelArg] = &[Input, Output, Target64];
const FIRST_ARGS: &[KernelArg] = &[Input, HashBuffer];
const MIDDLE_ARGS: &[KernelArg] = &[HashBuffer];
const LAST_ARGS: &[KernelArg] = &[HashBuffer, Output, Target64];

const SEARCH: &[StageSpec] = &[StageSpec { kernel: "search", args: SCRYPT_ARGS }];
const SPH_SEARCH: &[StageSpec] = &[StageSpec { kernel: "search", args: SPH_ARGS }];

const fn stage(kernel: &'static str, args: &'static [KernelArg]) -> StageSpec {
    StageSpec { kernel, args }
}

const X11_STAGES: &[StageSpec] = &[
    stage("blake", FIRST_ARGS),
    stage("bmw", MIDDLE_ARGS),
    stage("groestl", MIDDLE_ARGS),
    stage("skein", MIDDLE_ARGS),
    stage("jh", MIDDLE_ARGS),
    stage("keccak", MIDDLE_ARGS),
    stage("luffa", MIDDLE_ARGS),
    stage("cubehash", MIDDLE_ARGS),
    stage("shavite", MIDDLE_ARGS),
    stage("simd", MIDDLE_ARGS),
    stage("echo", LAST_ARGS),
];

const X13_STAGES: &[StageSpec] = &[
    stage("blake", FIRST_ARGS),
    stage("bmw", MIDDLE_ARGS),
    stage("groestl", MIDDLE_ARGS),
    stage("skein", MIDDLE_ARGS),
    stage("jh", MIDDLE_ARGS),
    stage("keccak", MIDDLE_ARGS),
    stage("luffa", MIDDLE_ARGS),
    stage("cubehash", MIDDLE_ARGS),
    stage("shavite", MIDDLE_ARGS),
    stage("simd", MIDDLE_ARGS),
    stage("echo", MIDDLE_ARGS),
    stage("hamsi", MIDDLE_ARGS),
    stage("fugue", LAST_ARGS),
];

// echo, hamsi and fugue fused into the last kernel
const X13OLD_STAGES: &[StageSpec] = &[
    stage("blake", FIRST_ARGS),
    stage("bmw", MIDDLE_ARGS),
    stage("groestl", MIDDLE_ARGS),
    stage("skein", MIDDLE_ARGS),
    stage("jh", MIDDLE_ARGS),
    stage("keccak", MIDDLE_ARGS),
    stage("luffa", MIDDLE_ARGS),
    stage("cubehash", MIDDLE_ARGS),
    stage("shavite", MIDDLE_ARGS),
    stage("simd", MIDDLE_ARGS),
    stage("echo_hamsi_fugue", LAST_ARGS),
];

const fn scrypt(variant: KernelVariant, name: &'static str, experimental: bool) -> VariantSpec {
    VariantSpec {
        variant,
        name,
        source: name,
        family: HashFamily::Scrypt,
        experimental,
        stages: SEARCH,
        extra_define: None,
        forced_lookup_gap: None,
        forced_work_size: None,
    }
}

const fn sph(variant: KernelVariant, name: &'static str) -> VariantSpec {
    VariantSpec {
        variant,
        name,
        source: name,
        family: HashFamily::Sph,
        experimental: true,
        stages: SPH_SEARCH,
        extra_define: None,
        forced_lookup_gap: None,
        forced_work_size: None,
    }
}

/// Pipeline table, indexed by `KernelVariant as usize`
pub static VARIANTS: [VariantSpec; 20] = [
    scrypt(KernelVariant::AlexKarNew, "alexkarnew", true),
    scrypt(KernelVariant::AlexKarOld, "alexkarold", true),
    scrypt(KernelVariant::CKolivas, "ckolivas", false),
    scrypt(KernelVariant::Psw, "psw", true),
    VariantSpec {
        forced_lookup_gap: Some(2),
        forced_work_size: Some(256),
        ..scrypt(KernelVariant::Zuikkis, "zuikkis", true)
    },
    sph(KernelVariant::Darkcoin, "darkcoin"),
    sph(KernelVariant::Qubitcoin, "qubitcoin"),
    sph(KernelVariant::Quarkcoin, "quarkcoin"),
    sph(KernelVariant::MyriadcoinGroestl, "myriadcoin-groestl"),
    sph(KernelVariant::Fuguecoin, "fuguecoin"),
    sph(KernelVariant::Inkcoin, "inkcoin"),
    sph(KernelVariant::Animecoin, "animecoin"),
    sph(KernelVariant::Groestlcoin, "groestlcoin"),
    sph(KernelVariant::Sifcoin, "sifcoin"),
    sph(KernelVariant::Twecoin, "twecoin"),
    sph(KernelVariant::Marucoin, "marucoin"),
    VariantSpec {
        family: HashFamily::Chained,
        stages: X11_STAGES,
        ..sph(KernelVariant::X11Mod, "x11mod")
    },
    VariantSpec {
        family: HashFamily::Chained,
        stages: X13_STAGES,
        ..sph(KernelVariant::X13Mod, "x13mod")
    },
    VariantSpec {
        source: "x13mod",
        family: HashFamily::Chained,
        stages: X13OLD_STAGES,
        extra_define: Some("X13MODOLD"),
        ..sph(KernelVariant::X13ModOld, "x13modold")
    },
    sph(KernelVariant::Fresh, "fresh"),
];

impl KernelVariant {
    /// Every variant in table order
    pub fn all() -> impl Iterator<Item = KernelVariant> {
        VARIANTS.iter().map(|s| s.variant)
    }

    /// Pipeline descriptor
    pub fn spec(self) -> &'static VariantSpec {
        &VARIANTS[self as usize]
    }

    /// Selection string
    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// Hash family
    pub fn family(self) -> HashFamily {
        self.spec().family
    }
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Unknown kernel selection string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid kernel name: {0}")]
pub struct UnknownVariant(pub String);

impl FromStr for KernelVariant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        VARIANTS
            .iter()
            .find(|spec| spec.name.eq_ignore_ascii_case(wanted))
            .map(|spec| spec.variant)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

impl TryFrom<String> for KernelVariant {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KernelVariant> for String {
    fn from(value: KernelVariant) -> Self {
        value.name().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_indexed_by_discriminant() {
        for (i, spec) in VARIANTS.iter().enumerate() {
            assert_eq!(spec.variant as usize, i, "{} out of place", spec.name);
        }
        assert_eq!(KernelVariant::all().count(), 20);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("ckolivas".parse::<KernelVariant>().unwrap(), KernelVariant::CKolivas);
        assert_eq!(
            "myriadcoin-groestl".parse::<KernelVariant>().unwrap(),
            KernelVariant::MyriadcoinGroestl
        );
        assert_eq!(
            "scrypt-n".parse::<KernelVariant>().unwrap_err().to_string(),
            "Invalid kernel name: scrypt-n"
        );
        for v in KernelVariant::all() {
            assert_eq!(v.name().parse::<KernelVariant>().unwrap(), v);
        }
    }

    #[test]
    fn test_default_is_only_stable_kernel() {
        assert_eq!(KernelVariant::default(), KernelVariant::CKolivas);
        let stable: Vec<_> = VARIANTS.iter().filter(|s| !s.experimental).collect();
        assert_eq!(stable.len(), 1);
        assert_eq!(stable[0].variant, KernelVariant::CKolivas);
    }

    #[test]
    fn test_chained_wiring() {
        for v in [KernelVariant::X11Mod, KernelVariant::X13Mod, KernelVariant::X13ModOld] {
            let spec = v.spec();
            assert_eq!(spec.family, HashFamily::Chained);
            let first = spec.stages.first().unwrap();
            let last = spec.stages.last().unwrap();
            assert_eq!(first.args, &[KernelArg::Input, KernelArg::HashBuffer]);
            assert_eq!(last.args, &[KernelArg::HashBuffer, KernelArg::Output, KernelArg::Target64]);
            for mid in &spec.stages[1..spec.stages.len() - 1] {
                assert_eq!(mid.args, &[KernelArg::HashBuffer]);
            }
        }
        assert_eq!(KernelVariant::X11Mod.spec().stages.len(), 11);
        assert_eq!(KernelVariant::X13Mod.spec().stages.len(), 13);
        assert_eq!(KernelVariant::X13ModOld.spec().stages.len(), 11);
    }

    #[test]
    fn test_x13modold_shares_source() {
        let spec = KernelVariant::X13ModOld.spec();
        assert_eq!(spec.source, "x13mod");
        assert_eq!(spec.name, "x13modold");
        assert_eq!(spec.extra_define, Some("X13MODOLD"));
    }

    #[test]
    fn test_zuikkis_forced_tuning() {
        let spec = KernelVariant::Zuikkis.spec();
        assert_eq!(spec.forced_lookup_gap, Some(2));
        assert_eq!(spec.forced_work_size, Some(256));
    }

    #[test]
    fn test_family_flags() {
        assert!(!HashFamily::Scrypt.flips_header());
        assert!(HashFamily::Sph.flips_header());
        assert!(HashFamily::Scrypt.needs_pad_buffer());
        assert!(HashFamily::Chained.needs_hash_buffer());
        assert!(!HashFamily::Chained.out_of_order_queue());
    }

    #[test]
    fn test_serde_by_name() {
        let json = serde_json::to_string(&KernelVariant::X13Mod).unwrap();
        assert_eq!(json, "\"x13mod\"");
        let back: KernelVariant = serde_json::from_str("\"darkcoin\"").unwrap();
        assert_eq!(back, KernelVariant::Darkcoin);
    }
}
