//! Vulnerability profile: which speculative execution bugs affect this CPU.
//!
//! Everything here is a pure function of [`CpuInfo`]. The lookup tables
//! list parts that are known to be immune; anything not listed is assumed
//! affected.

use bitflags::bitflags;

use crate::cpu::CpuVendor::{Amd, Centaur, Intel, Nsc};
use crate::cpu::{intel, match_cpu, CpuCaps, CpuInfo, CpuMatch};

/// Speculative execution bug classes tracked by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BugClass {
    SpectreV1,
    SpectreV2,
    SpeculativeStoreBypass,
    Meltdown,
    L1tf,
}

impl BugClass {
    pub const ALL: [BugClass; 5] = [
        BugClass::Meltdown,
        BugClass::SpectreV1,
        BugClass::SpectreV2,
        BugClass::SpeculativeStoreBypass,
        BugClass::L1tf,
    ];

    /// Name of the sysfs vulnerabilities entry.
    pub const fn name(self) -> &'static str {
        match self {
            BugClass::SpectreV1 => "spectre_v1",
            BugClass::SpectreV2 => "spectre_v2",
            BugClass::SpeculativeStoreBypass => "spec_store_bypass",
            BugClass::Meltdown => "meltdown",
            BugClass::L1tf => "l1tf",
        }
    }

    const fn flag(self) -> CpuBugs {
        match self {
            BugClass::SpectreV1 => CpuBugs::SPECTRE_V1,
            BugClass::SpectreV2 => CpuBugs::SPECTRE_V2,
            BugClass::SpeculativeStoreBypass => CpuBugs::SPEC_STORE_BYPASS,
            BugClass::Meltdown => CpuBugs::MELTDOWN,
            BugClass::L1tf => CpuBugs::L1TF,
        }
    }
}

bitflags! {
    /// Set of bug classes the boot CPU is affected by.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuBugs: u8 {
        const SPECTRE_V1 = 1 << 0;
        const SPECTRE_V2 = 1 << 1;
        const SPEC_STORE_BYPASS = 1 << 2;
        const MELTDOWN = 1 << 3;
        const L1TF = 1 << 4;
    }
}

impl CpuBugs {
    #[inline]
    pub fn affected(&self, class: BugClass) -> bool {
        self.contains(class.flag())
    }
}

/// Parts that never speculate past a store to a dependent load.
const NO_SPEC_STORE_BYPASS: &[CpuMatch] = &[
    CpuMatch::model(Intel, 6, intel::ATOM_PINEVIEW),
    CpuMatch::model(Intel, 6, intel::ATOM_LINCROFT),
    CpuMatch::model(Intel, 6, intel::ATOM_PENWELL),
    CpuMatch::model(Intel, 6, intel::ATOM_CLOVERVIEW),
    CpuMatch::model(Intel, 6, intel::ATOM_CEDARVIEW),
    CpuMatch::model(Intel, 6, intel::ATOM_SILVERMONT1),
    CpuMatch::model(Intel, 6, intel::ATOM_AIRMONT),
    CpuMatch::model(Intel, 6, intel::ATOM_SILVERMONT2),
    CpuMatch::model(Intel, 6, intel::ATOM_MERRIFIELD),
    CpuMatch::model(Intel, 6, intel::CORE_YONAH),
    CpuMatch::model(Intel, 6, intel::XEON_PHI_KNL),
    CpuMatch::model(Intel, 6, intel::XEON_PHI_KNM),
    CpuMatch::family(Centaur, 5),
    CpuMatch::family(Intel, 5),
    CpuMatch::family(Nsc, 5),
    CpuMatch::family(Amd, 0x12),
    CpuMatch::family(Amd, 0x11),
    CpuMatch::family(Amd, 0x10),
    CpuMatch::family(Amd, 0xf),
    CpuMatch::any_vendor(4),
];

/// Parts whose L1 data cache is not exposed to terminal faults.
const NO_L1TF: &[CpuMatch] = &[
    CpuMatch::model(Intel, 6, intel::ATOM_SILVERMONT1),
    CpuMatch::model(Intel, 6, intel::ATOM_SILVERMONT2),
    CpuMatch::model(Intel, 6, intel::ATOM_AIRMONT),
    CpuMatch::model(Intel, 6, intel::ATOM_MERRIFIELD),
    CpuMatch::model(Intel, 6, intel::ATOM_MOOREFIELD),
    CpuMatch::model(Intel, 6, intel::ATOM_GOLDMONT),
    CpuMatch::model(Intel, 6, intel::ATOM_DENVERTON),
    CpuMatch::model(Intel, 6, intel::ATOM_GEMINI_LAKE),
    CpuMatch::model(Intel, 6, intel::XEON_PHI_KNL),
    CpuMatch::model(Intel, 6, intel::XEON_PHI_KNM),
];

/// Family 6 parts whose cache uses 44 physical address bits even when
/// CPUID reports fewer.
const CACHE_BITS_OVERRIDE: &[CpuMatch] = &[
    CpuMatch::model(Intel, 6, intel::NEHALEM),
    CpuMatch::model(Intel, 6, intel::WESTMERE),
    CpuMatch::model(Intel, 6, intel::SANDYBRIDGE),
    CpuMatch::model(Intel, 6, intel::IVYBRIDGE),
    CpuMatch::model(Intel, 6, intel::HASWELL_CORE),
    CpuMatch::model(Intel, 6, intel::HASWELL_ULT),
    CpuMatch::model(Intel, 6, intel::HASWELL_GT3E),
    CpuMatch::model(Intel, 6, intel::BROADWELL_CORE),
    CpuMatch::model(Intel, 6, intel::BROADWELL_GT3E),
    CpuMatch::model(Intel, 6, intel::SKYLAKE_MOBILE),
    CpuMatch::model(Intel, 6, intel::SKYLAKE_DESKTOP),
    CpuMatch::model(Intel, 6, intel::KABYLAKE_MOBILE),
    CpuMatch::model(Intel, 6, intel::KABYLAKE_DESKTOP),
];

const OVERRIDE_CACHE_BITS: u8 = 44;

const PAGE_SHIFT: u32 = 12;

/// Compute the bug set of `cpu`.
pub fn detect_bugs(cpu: &CpuInfo) -> CpuBugs {
    let mut bugs = CpuBugs::SPECTRE_V1 | CpuBugs::SPECTRE_V2;

    if !match_cpu(NO_SPEC_STORE_BYPASS, cpu) && !cpu.has(CpuCaps::SSB_NO) {
        bugs |= CpuBugs::SPEC_STORE_BYPASS;
    }

    let rdcl_immune = cpu.is_amd() || cpu.has(CpuCaps::RDCL_NO);
    if !rdcl_immune {
        bugs |= CpuBugs::MELTDOWN;
        if !match_cpu(NO_L1TF, cpu) {
            bugs |= CpuBugs::L1TF;
        }
    }

    bugs
}

/// Physical address bits used by the cache for L1TF PTE inversion.
pub fn corrected_cache_bits(cpu: &CpuInfo) -> u8 {
    if match_cpu(CACHE_BITS_OVERRIDE, cpu) {
        cpu.phys_bits.max(OVERRIDE_CACHE_BITS)
    } else {
        cpu.phys_bits
    }
}

/// First page frame number at or above MAX_PA/2.
///
/// Widths beyond 64 bits saturate at the top of the address space.
pub fn l1tf_pfn_limit(cache_bits: u8) -> u64 {
    match cache_bits {
        0 => 0,
        bits => {
            let half = 1u64
                .checked_shl(u32::from(bits) - 1)
                .unwrap_or(u64::MAX);
            half >> PAGE_SHIFT
        }
    }
}

/// Physical address of the first byte at or above MAX_PA/2.
pub fn l1tf_half_pa(cache_bits: u8) -> u64 {
    l1tf_pfn_limit(cache_bits) << PAGE_SHIFT
}

/// Whether PTE modifications must be checked against the L1TF PFN limit.
#[inline]
pub fn pfn_modify_check_required(bugs: CpuBugs) -> bool {
    bugs.affected(BugClass::L1tf)
}

/// Clamp a swap file size (in pages) so swapped-out PTEs never address
/// memory above MAX_PA/2.
pub fn l1tf_max_swap_pages(bugs: CpuBugs, cpu: &CpuInfo, generic_pages: u64) -> u64 {
    if bugs.affected(BugClass::L1tf) {
        generic_pages.min(l1tf_pfn_limit(corrected_cache_bits(cpu)))
    } else {
        generic_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuVendor;

    fn intel6(model: u8) -> CpuInfo {
        CpuInfo::new(CpuVendor::Intel, 6, model)
    }

    #[test]
    fn test_every_cpu_has_spectre() {
        for cpu in [
            intel6(intel::SKYLAKE_DESKTOP),
            intel6(intel::ATOM_SILVERMONT1),
            CpuInfo::new(CpuVendor::Amd, 0x17, 1),
            CpuInfo::new(CpuVendor::Unknown, 4, 0),
        ] {
            let bugs = detect_bugs(&cpu);
            assert!(bugs.affected(BugClass::SpectreV1));
            assert!(bugs.affected(BugClass::SpectreV2));
        }
    }

    #[test]
    fn test_modern_intel_fully_affected() {
        let bugs = detect_bugs(&intel6(intel::SKYLAKE_DESKTOP));
        assert!(bugs.contains(CpuBugs::all()));
    }

    #[test]
    fn test_old_atom_immune_to_ssb() {
        let bugs = detect_bugs(&intel6(intel::ATOM_CEDARVIEW));
        assert!(!bugs.affected(BugClass::SpeculativeStoreBypass));
        assert!(bugs.affected(BugClass::Meltdown));
        assert!(bugs.affected(BugClass::L1tf));

        let bugs = detect_bugs(&intel6(intel::ATOM_GOLDMONT));
        assert!(bugs.affected(BugClass::SpeculativeStoreBypass));
        assert!(!bugs.affected(BugClass::L1tf));
    }

    #[test]
    fn test_amd_profile() {
        let zen = detect_bugs(&CpuInfo::new(CpuVendor::Amd, 0x17, 1));
        assert!(zen.affected(BugClass::SpeculativeStoreBypass));
        assert!(!zen.affected(BugClass::Meltdown));
        assert!(!zen.affected(BugClass::L1tf));

        let k8 = detect_bugs(&CpuInfo::new(CpuVendor::Amd, 0xf, 1));
        assert!(!k8.affected(BugClass::SpeculativeStoreBypass));
    }

    #[test]
    fn test_arch_capabilities_clear_bugs() {
        let cpu = intel6(0x9E).with_arch_capabilities(0b1_0001);
        let bugs = detect_bugs(&cpu);
        assert!(!bugs.affected(BugClass::SpeculativeStoreBypass));
        assert!(!bugs.affected(BugClass::Meltdown));
        assert!(!bugs.affected(BugClass::L1tf));
    }

    #[test]
    fn test_cache_bits_override() {
        let hsw = intel6(intel::HASWELL_CORE).with_phys_bits(39);
        assert_eq!(corrected_cache_bits(&hsw), 44);
        let hsw46 = intel6(intel::HASWELL_CORE).with_phys_bits(46);
        assert_eq!(corrected_cache_bits(&hsw46), 46);
        let skx = intel6(intel::SKYLAKE_X).with_phys_bits(39);
        assert_eq!(corrected_cache_bits(&skx), 39);
    }

    #[test]
    fn test_pfn_limit_and_swap_clamp() {
        assert_eq!(l1tf_half_pa(44), 1 << 43);
        assert_eq!(l1tf_pfn_limit(44), 1 << 31);

        let cpu = intel6(intel::SKYLAKE_DESKTOP).with_phys_bits(36);
        let bugs = detect_bugs(&cpu);
        assert!(pfn_modify_check_required(bugs));
        assert_eq!(l1tf_max_swap_pages(bugs, &cpu, u64::MAX), 1 << 31);
        assert_eq!(l1tf_max_swap_pages(bugs, &cpu, 100), 100);

        let amd = CpuInfo::new(CpuVendor::Amd, 0x17, 1);
        let bugs = detect_bugs(&amd);
        assert_eq!(l1tf_max_swap_pages(bugs, &amd, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_pfn_limit_saturates_for_wide_addresses() {
        assert_eq!(l1tf_pfn_limit(64), (1u64 << 63) >> PAGE_SHIFT);
        assert_eq!(l1tf_pfn_limit(65), u64::MAX >> PAGE_SHIFT);
        assert_eq!(l1tf_pfn_limit(u8::MAX), u64::MAX >> PAGE_SHIFT);
        assert_eq!(l1tf_half_pa(70), (u64::MAX >> PAGE_SHIFT) << PAGE_SHIFT);

        let wide = intel6(intel::SKYLAKE_DESKTOP).with_phys_bits(70);
        let bugs = detect_bugs(&wide);
        assert_eq!(l1tf_max_swap_pages(bugs, &wide, u64::MAX), u64::MAX >> PAGE_SHIFT);
    }
}
