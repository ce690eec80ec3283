//! CPU identity and capability flags consumed by the mitigation engine.
//!
//! The policy code only ever sees a [`CpuInfo`] value. On x86_64 hosts
//! [`CpuInfo::detect`] fills it from CPUID; capabilities that need a
//! privileged read (IA32_ARCH_CAPABILITIES, AMD DE_CFG) or come from other
//! subsystems (PTI) are folded in by the boot path.

use bitflags::bitflags;

/// CPU vendor as reported by CPUID leaf 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Centaur,
    Nsc,
    Unknown,
}

impl CpuVendor {
    /// Decode the 12-byte vendor string.
    pub fn from_signature(sig: &[u8; 12]) -> Self {
        match sig {
            b"GenuineIntel" => CpuVendor::Intel,
            b"AuthenticAMD" => CpuVendor::Amd,
            b"CentaurHauls" => CpuVendor::Centaur,
            b"Geode by NSC" => CpuVendor::Nsc,
            _ => CpuVendor::Unknown,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CpuVendor::Intel => "Intel",
            CpuVendor::Amd => "AMD",
            CpuVendor::Centaur => "Centaur",
            CpuVendor::Nsc => "NSC",
            CpuVendor::Unknown => "Unknown",
        }
    }
}

bitflags! {
    /// Hardware capability flags relevant to speculation control.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuCaps: u32 {
        /// IA32_SPEC_CTRL with IBRS, and IA32_PRED_CMD with IBPB.
        const SPEC_CTRL = 1 << 0;
        /// Single Thread Indirect Branch Predictors.
        const STIBP = 1 << 1;
        /// Store bypass disable through IA32_SPEC_CTRL bit 2.
        const SSBD = 1 << 2;
        /// IA32_ARCH_CAPABILITIES MSR is present.
        const ARCH_CAPABILITIES = 1 << 3;
        /// AMD IBPB enumerated in CPUID 0x80000008.
        const AMD_IBPB = 1 << 4;
        /// AMD store bypass disable through the LS_CFG MSR.
        const AMD_SSBD = 1 << 5;
        /// The LS_CFG store bypass bit is known for this family.
        const AMD_SSBD_MASK = 1 << 6;
        /// LFENCE is dispatch serializing.
        const LFENCE_SERIALIZING = 1 << 7;
        /// Kernel page table isolation is active.
        const PTI = 1 << 8;
        /// ARCH_CAPABILITIES: not susceptible to rogue data cache load.
        const RDCL_NO = 1 << 9;
        /// ARCH_CAPABILITIES: not susceptible to speculative store bypass.
        const SSB_NO = 1 << 10;
    }
}

// IA32_ARCH_CAPABILITIES bits
const ARCH_CAP_RDCL_NO: u64 = 1 << 0;
const ARCH_CAP_SSB_NO: u64 = 1 << 4;

/// Intel family 6 model numbers referenced by the lookup tables.
pub mod intel {
    pub const CORE_YONAH: u8 = 0x0E;

    pub const NEHALEM: u8 = 0x1E;
    pub const WESTMERE: u8 = 0x25;
    pub const SANDYBRIDGE: u8 = 0x2A;
    pub const IVYBRIDGE: u8 = 0x3A;
    pub const HASWELL_CORE: u8 = 0x3C;
    pub const HASWELL_ULT: u8 = 0x45;
    pub const HASWELL_GT3E: u8 = 0x46;
    pub const BROADWELL_CORE: u8 = 0x3D;
    pub const BROADWELL_GT3E: u8 = 0x47;
    pub const SKYLAKE_MOBILE: u8 = 0x4E;
    pub const SKYLAKE_DESKTOP: u8 = 0x5E;
    pub const SKYLAKE_X: u8 = 0x55;
    pub const KABYLAKE_MOBILE: u8 = 0x8E;
    pub const KABYLAKE_DESKTOP: u8 = 0x9E;

    pub const ATOM_PINEVIEW: u8 = 0x1C;
    pub const ATOM_LINCROFT: u8 = 0x26;
    pub const ATOM_PENWELL: u8 = 0x27;
    pub const ATOM_CLOVERVIEW: u8 = 0x35;
    pub const ATOM_CEDARVIEW: u8 = 0x36;
    pub const ATOM_SILVERMONT1: u8 = 0x37;
    pub const ATOM_SILVERMONT2: u8 = 0x4D;
    pub const ATOM_AIRMONT: u8 = 0x4C;
    pub const ATOM_MERRIFIELD: u8 = 0x4A;
    pub const ATOM_MOOREFIELD: u8 = 0x5A;
    pub const ATOM_GOLDMONT: u8 = 0x5C;
    pub const ATOM_DENVERTON: u8 = 0x5F;
    pub const ATOM_GEMINI_LAKE: u8 = 0x7A;

    pub const XEON_PHI_KNL: u8 = 0x57;
    pub const XEON_PHI_KNM: u8 = 0x85;
}

/// One row of a vendor/family/model lookup table.
///
/// `vendor: None` matches any vendor, `model: None` any model of the family.
#[derive(Debug, Clone, Copy)]
pub struct CpuMatch {
    pub vendor: Option<CpuVendor>,
    pub family: u8,
    pub model: Option<u8>,
}

impl CpuMatch {
    pub const fn model(vendor: CpuVendor, family: u8, model: u8) -> Self {
        Self {
            vendor: Some(vendor),
            family,
            model: Some(model),
        }
    }

    pub const fn family(vendor: CpuVendor, family: u8) -> Self {
        Self {
            vendor: Some(vendor),
            family,
            model: None,
        }
    }

    pub const fn any_vendor(family: u8) -> Self {
        Self {
            vendor: None,
            family,
            model: None,
        }
    }

    pub fn matches(&self, cpu: &CpuInfo) -> bool {
        self.vendor.map_or(true, |v| v == cpu.vendor)
            && self.family == cpu.family
            && self.model.map_or(true, |m| m == cpu.model)
    }
}

/// Returns true if any row of `table` matches `cpu`.
pub fn match_cpu(table: &[CpuMatch], cpu: &CpuInfo) -> bool {
    table.iter().any(|m| m.matches(cpu))
}

/// LS_CFG store bypass disable bit per AMD family.
const AMD_LS_CFG_SSBD_BITS: &[(u8, u32)] = &[(0x15, 54), (0x16, 33), (0x17, 10)];

/// Identity of the boot processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub vendor: CpuVendor,
    pub family: u8,
    pub model: u8,
    pub stepping: u8,
    /// Physical address bits reported by CPUID 0x80000008.
    pub phys_bits: u8,
    pub caps: CpuCaps,
}

impl CpuInfo {
    /// Identity with no capabilities and 36 physical address bits.
    pub const fn new(vendor: CpuVendor, family: u8, model: u8) -> Self {
        CpuInfo {
            vendor,
            family,
            model,
            stepping: 0,
            phys_bits: 36,
            caps: CpuCaps::empty(),
        }
    }

    pub const fn with_caps(mut self, caps: CpuCaps) -> Self {
        self.caps = caps;
        self
    }

    pub const fn with_phys_bits(mut self, bits: u8) -> Self {
        self.phys_bits = bits;
        self
    }

    #[inline]
    pub fn has(&self, caps: CpuCaps) -> bool {
        self.caps.contains(caps)
    }

    #[inline]
    pub fn is_amd(&self) -> bool {
        self.vendor == CpuVendor::Amd
    }

    /// Fold an IA32_ARCH_CAPABILITIES value into the capability set.
    pub fn with_arch_capabilities(mut self, msr: u64) -> Self {
        self.caps |= CpuCaps::ARCH_CAPABILITIES;
        if msr & ARCH_CAP_RDCL_NO != 0 {
            self.caps |= CpuCaps::RDCL_NO;
        }
        if msr & ARCH_CAP_SSB_NO != 0 {
            self.caps |= CpuCaps::SSB_NO;
        }
        self
    }

    /// LS_CFG bit that disables store bypass on this AMD family, if known.
    pub fn amd_ls_cfg_ssbd_mask(&self) -> Option<u64> {
        if !self.is_amd() {
            return None;
        }
        AMD_LS_CFG_SSBD_BITS
            .iter()
            .find(|(family, _)| *family == self.family)
            .map(|(_, bit)| 1u64 << bit)
    }

    /// Read vendor, family/model and capabilities from CPUID.
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        let (max_leaf, ebx, ecx, edx) = cpuid(0, 0);
        let mut sig = [0u8; 12];
        sig[0..4].copy_from_slice(&ebx.to_le_bytes());
        sig[4..8].copy_from_slice(&edx.to_le_bytes());
        sig[8..12].copy_from_slice(&ecx.to_le_bytes());
        let vendor = CpuVendor::from_signature(&sig);

        let (eax1, _, _, _) = cpuid(1, 0);
        let mut family = ((eax1 >> 8) & 0xF) as u8;
        if family == 0xF {
            family += ((eax1 >> 20) & 0xFF) as u8;
        }
        let mut model = ((eax1 >> 4) & 0xF) as u8;
        if family >= 6 {
            model |= (((eax1 >> 16) & 0xF) as u8) << 4;
        }

        let mut info = CpuInfo::new(vendor, family, model);
        info.stepping = (eax1 & 0xF) as u8;

        if max_leaf >= 7 {
            let (_, _, _, edx7) = cpuid(7, 0);
            if edx7 & (1 << 26) != 0 {
                info.caps |= CpuCaps::SPEC_CTRL;
            }
            if edx7 & (1 << 27) != 0 {
                info.caps |= CpuCaps::STIBP;
            }
            if edx7 & (1 << 29) != 0 {
                info.caps |= CpuCaps::ARCH_CAPABILITIES;
            }
            if edx7 & (1 << 31) != 0 {
                info.caps |= CpuCaps::SSBD;
            }
        }

        let (max_ext, _, _, _) = cpuid(0x8000_0000, 0);
        if max_ext >= 0x8000_0008 {
            let (eax8, ebx8, _, _) = cpuid(0x8000_0008, 0);
            info.phys_bits = (eax8 & 0xFF) as u8;
            if vendor == CpuVendor::Amd && ebx8 & (1 << 12) != 0 {
                info.caps |= CpuCaps::AMD_IBPB;
            }
        }

        match vendor {
            CpuVendor::Intel => info.caps |= CpuCaps::LFENCE_SERIALIZING,
            // Later families need DE_CFG bit 1, which the boot path checks.
            CpuVendor::Amd if family == 0xF || family == 0x11 => {
                info.caps |= CpuCaps::LFENCE_SERIALIZING
            }
            _ => {}
        }

        if info.amd_ls_cfg_ssbd_mask().is_some() {
            info.caps |= CpuCaps::SSBD | CpuCaps::AMD_SSBD | CpuCaps::AMD_SSBD_MASK;
        }

        info
    }
}

/// Execute CPUID with the given leaf and subleaf.
///
/// RBX is reserved by LLVM, so it is saved around the instruction.
#[cfg(target_arch = "x86_64")]
fn cpuid(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
    let eax: u32;
    let ebx: u32;
    let ecx: u32;
    let edx: u32;

    unsafe {
        core::arch::asm!(
            "push rbx",
            "cpuid",
            "mov {ebx_out:e}, ebx",
            "pop rbx",
            inout("eax") leaf => eax,
            ebx_out = out(reg) ebx,
            inout("ecx") subleaf => ecx,
            lateout("edx") edx,
        );
    }

    (eax, ebx, ecx, edx)
}
