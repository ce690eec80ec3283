//! Human-readable vulnerability status, one line per bug class.
//!
//! The strings match the sysfs `vulnerabilities/*` files so existing
//! tooling can parse them.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use klog::klog;

use crate::cpu::CpuCaps;
use crate::select::MitigationDecision;
use crate::smt::SmtState;
use crate::vuln::BugClass;

const L1TF_DEFAULT_MSG: &str = "Mitigation: PTE Inversion";

/// L1D flush behaviour on VM entry, as configured by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmxL1dFlush {
    /// No hypervisor has set a state.
    Auto = 0,
    Never = 1,
    Cond = 2,
    Always = 3,
    EptDisabled = 4,
}

impl VmxL1dFlush {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => VmxL1dFlush::Never,
            2 => VmxL1dFlush::Cond,
            3 => VmxL1dFlush::Always,
            4 => VmxL1dFlush::EptDisabled,
            _ => VmxL1dFlush::Auto,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            VmxL1dFlush::Auto => "auto",
            VmxL1dFlush::Never => "vulnerable",
            VmxL1dFlush::Cond => "conditional cache flushes",
            VmxL1dFlush::Always => "cache flushes",
            VmxL1dFlush::EptDisabled => "EPT disabled",
        }
    }
}

/// Runtime state that feeds into the report besides the decision.
pub struct ReportState {
    vmx_l1d_flush: AtomicU8,
    bad_module: AtomicBool,
}

impl ReportState {
    pub const fn new() -> Self {
        ReportState {
            vmx_l1d_flush: AtomicU8::new(VmxL1dFlush::Auto as u8),
            bad_module: AtomicBool::new(false),
        }
    }

    pub fn set_vmx_l1d_flush(&self, state: VmxL1dFlush) {
        self.vmx_l1d_flush.store(state as u8, Ordering::Release);
    }

    pub fn vmx_l1d_flush(&self) -> VmxL1dFlush {
        VmxL1dFlush::from_u8(self.vmx_l1d_flush.load(Ordering::Acquire))
    }

    /// Whether a module built without retpolines was loaded.
    pub fn bad_module(&self) -> bool {
        self.bad_module.load(Ordering::Acquire)
    }

    /// Check a module about to be loaded.
    ///
    /// Returns false, and marks Spectre V2 as exposed, when retpolines are
    /// in use but the module was built without them.
    pub fn retpoline_module_ok(&self, decision: &MitigationDecision, has_retpoline: bool) -> bool {
        if !decision.spectre_v2.is_retpoline() || has_retpoline {
            return true;
        }
        klog!(Error, "Spectre V2 mitigation: System may be vulnerable to spectre v2");
        self.bad_module.store(true, Ordering::Release);
        false
    }
}

impl Default for ReportState {
    fn default() -> Self {
        Self::new()
    }
}

/// Status line of one bug class. Rendered through `Display`.
pub struct VulnerabilityStatus<'a> {
    pub class: BugClass,
    pub decision: &'a MitigationDecision,
    pub smt: SmtState,
    pub vmx_l1d_flush: VmxL1dFlush,
    pub bad_module: bool,
}

impl fmt::Display for VulnerabilityStatus<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.decision;
        if !d.affected(self.class) {
            return f.write_str("Not affected");
        }

        match self.class {
            BugClass::Meltdown => {
                if d.cpu.has(CpuCaps::PTI) {
                    f.write_str("Mitigation: PTI")
                } else {
                    f.write_str("Vulnerable")
                }
            }
            BugClass::SpectreV1 => f.write_str("Mitigation: __user pointer sanitization"),
            BugClass::SpectreV2 => {
                let module = if self.bad_module {
                    " - vulnerable module loaded"
                } else {
                    ""
                };
                if d.cpu.has(CpuCaps::SPEC_CTRL) && d.ibrs.ibrs {
                    write!(f, "Mitigation: IBRS+IBPB{}", module)
                } else if d.ibrs.ibpb {
                    write!(f, "{} + IBPB{}", d.spectre_v2.as_str(), module)
                } else {
                    write!(f, "{}{}", d.spectre_v2.as_str(), module)
                }
            }
            BugClass::SpeculativeStoreBypass => f.write_str(d.ssb.as_str()),
            BugClass::L1tf => {
                f.write_str(L1TF_DEFAULT_MSG)?;
                if !d.l1tf.effective {
                    f.write_str(" (not effective: RAM above MAX_PA/2)")?;
                }
                if self.vmx_l1d_flush != VmxL1dFlush::Auto {
                    write!(
                        f,
                        "; VMX: SMT {}, L1D {}",
                        if self.smt == SmtState::Enabled {
                            "vulnerable"
                        } else {
                            "disabled"
                        },
                        self.vmx_l1d_flush.as_str()
                    )?;
                }
                Ok(())
            }
        }
    }
}
