//! Speculation control registers and the base value model.
//!
//! The only primitive the rest of the crate uses to touch hardware is the
//! [`ControlRegisters`] trait. On x86_64 [`MsrControl`] implements it with
//! RDMSR/WRMSR; tests substitute a recording implementation.

use crate::error::SpecCtrlError;

// ============================================================================
// MSR Constants
// ============================================================================

/// IA32_SPEC_CTRL MSR - Speculation control
pub const MSR_IA32_SPEC_CTRL: u32 = 0x48;
/// IA32_PRED_CMD MSR - Predictor command (write-only)
pub const MSR_IA32_PRED_CMD: u32 = 0x49;
/// IA32_ARCH_CAPABILITIES MSR - Architecture capabilities
pub const MSR_IA32_ARCH_CAPABILITIES: u32 = 0x10A;
/// AMD64 load/store unit configuration
pub const MSR_AMD64_LS_CFG: u32 = 0xC001_1020;

// IA32_SPEC_CTRL bits
pub const SPEC_CTRL_IBRS: u64 = 1 << 0; // Indirect Branch Restricted Speculation
pub const SPEC_CTRL_STIBP: u64 = 1 << 1; // Single Thread Indirect Branch Predictors
pub const SPEC_CTRL_SSBD: u64 = 1 << 2; // Speculative Store Bypass Disable

// IA32_PRED_CMD bits
pub const PRED_CMD_IBPB: u64 = 1 << 0; // Indirect Branch Predictor Barrier

/// Per-processor control register touched by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRegister {
    SpecCtrl,
    PredCmd,
    AmdLsCfg,
}

impl ControlRegister {
    pub const fn msr(self) -> u32 {
        match self {
            ControlRegister::SpecCtrl => MSR_IA32_SPEC_CTRL,
            ControlRegister::PredCmd => MSR_IA32_PRED_CMD,
            ControlRegister::AmdLsCfg => MSR_AMD64_LS_CFG,
        }
    }
}

/// Privileged register access on the executing processor.
///
/// Implementations must be callable from any CPU; each call affects only
/// the CPU it runs on.
pub trait ControlRegisters: Send + Sync {
    /// Read a register. `None` if it cannot be read on this system.
    fn read(&self, reg: ControlRegister) -> Option<u64>;

    /// Write a register.
    fn write(&self, reg: ControlRegister, value: u64);
}

/// Combine a base value with an overlay.
///
/// Fails without producing a value when the overlay carries bits outside
/// `allowed`.
pub const fn apply(base: u64, overlay: u64, allowed: u64) -> Result<u64, SpecCtrlError> {
    if overlay & !allowed != 0 {
        return Err(SpecCtrlError::UnknownBits(overlay));
    }
    Ok(base | overlay)
}

/// Boot snapshot of IA32_SPEC_CTRL and the bits that may be modified on
/// top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecCtrlBase {
    value: u64,
    allowed: u64,
}

impl SpecCtrlBase {
    /// Snapshot with the firmware value. Reserved bits are kept as found;
    /// only IBRS may be modified initially.
    pub const fn new(boot_value: u64) -> Self {
        SpecCtrlBase {
            value: boot_value,
            allowed: SPEC_CTRL_IBRS,
        }
    }

    #[inline]
    pub const fn value(&self) -> u64 {
        self.value
    }

    #[inline]
    pub const fn allowed(&self) -> u64 {
        self.allowed
    }

    /// Make SSBD part of the value every processor loads.
    pub fn force_ssbd(&mut self) {
        self.value |= SPEC_CTRL_SSBD;
        self.allowed |= SPEC_CTRL_SSBD;
    }

    /// Allow per-task SSBD overlays.
    pub fn allow_ssbd(&mut self) {
        self.allowed |= SPEC_CTRL_SSBD;
    }

    /// Effective value for `overlay`.
    #[inline]
    pub const fn effective(&self, overlay: u64) -> Result<u64, SpecCtrlError> {
        apply(self.value, overlay, self.allowed)
    }
}

/// Boot snapshot of the AMD LS_CFG register and its store bypass bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsCfgBase {
    pub value: u64,
    pub ssbd_mask: u64,
}

impl LsCfgBase {
    #[inline]
    pub const fn effective(&self, ssbd: bool) -> u64 {
        if ssbd {
            self.value | self.ssbd_mask
        } else {
            self.value
        }
    }
}

/// [`ControlRegisters`] backed by RDMSR/WRMSR.
#[cfg(target_arch = "x86_64")]
pub struct MsrControl;

#[cfg(target_arch = "x86_64")]
impl ControlRegisters for MsrControl {
    fn read(&self, reg: ControlRegister) -> Option<u64> {
        use x86_64::registers::model_specific::Msr;

        // PRED_CMD is write-only
        if reg == ControlRegister::PredCmd {
            return None;
        }
        unsafe {
            let msr = Msr::new(reg.msr());
            Some(msr.read())
        }
    }

    fn write(&self, reg: ControlRegister, value: u64) {
        use x86_64::registers::model_specific::Msr;

        unsafe {
            let mut msr = Msr::new(reg.msr());
            msr.write(value);
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl MsrControl {
    /// Read IA32_ARCH_CAPABILITIES when CPUID enumerates it.
    pub fn read_arch_capabilities(&self, cpu: &crate::cpu::CpuInfo) -> Option<u64> {
        use x86_64::registers::model_specific::Msr;

        if !cpu.has(crate::cpu::CpuCaps::ARCH_CAPABILITIES) {
            return None;
        }
        unsafe {
            let msr = Msr::new(MSR_IA32_ARCH_CAPABILITIES);
            Some(msr.read())
        }
    }
}
