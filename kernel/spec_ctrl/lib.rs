//! Speculative Execution Mitigation Control for Zero-OS
//!
//! Decides once at boot which countermeasures against Spectre variant 2,
//! Speculative Store Bypass and L1 Terminal Fault are active, then keeps
//! that decision enforced on every processor and every scheduled task:
//!
//! - **Vulnerability profile**: per-CPU bug classes from vendor/family/model
//!   tables and architectural capability bits
//! - **Option parsing**: `spectre_v2=`, `spec_store_bypass_disable=`,
//!   `l1tf=`, `mitigations=` and their boolean shorthands
//! - **Selection**: one immutable [`MitigationDecision`]
//! - **Enforcement**: per-CPU cached SPEC_CTRL / LS_CFG loads, written only
//!   on change
//! - **Task policy**: prctl-style per-task store bypass control
//! - **Reporting**: `vulnerabilities/*` status lines
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = SpecCtrlConfig::with_cmdline(cmdline);
//! let report = spec_ctrl::init_global(config, &memory_map, smt_supported)?;
//! report.print();
//! ```

#![cfg_attr(not(test), no_std)]

pub mod cmdline;
pub mod config;
pub mod cpu;
pub mod ctrl;
pub mod enforce;
pub mod error;
pub mod prctl;
pub mod report;
pub mod select;
pub mod selftest;
pub mod smt;
pub mod task;
pub mod vuln;

use core::fmt;

use cpu_local::{current_cpu_id, CpuId};
use klog::{klog, klog_always};
#[cfg(target_arch = "x86_64")]
use spin::Once;

pub use cmdline::BootOptions;
pub use config::{BuildConfig, SpecCtrlConfig};
pub use cpu::{CpuCaps, CpuInfo, CpuVendor};
pub use ctrl::{ControlRegister, ControlRegisters};
pub use enforce::{CrossCall, Enforcer};
pub use error::{DiagnosticKind, Diagnostics, SpecCtrlError};
pub use prctl::{SpecCtrlStatus, TaskContext, PR_SPEC_STORE_BYPASS};
pub use report::{VmxL1dFlush, VulnerabilityStatus};
pub use select::{
    BootRegisters, L1tfMitigation, MemoryRegion, MitigationDecision, RegionKind,
    SpectreV2Mitigation, SsbMitigation,
};
pub use selftest::{SpecCtrlTest, TestReport, TestResult};
pub use smt::SmtState;
pub use task::{PolicyChange, SpecRequest, TaskSpecPolicy};
pub use vuln::BugClass;

#[cfg(target_arch = "x86_64")]
pub use ctrl::MsrControl;

use report::ReportState;
use select::SsbdPath;
use selftest::TestContext;
use smt::SmtControl;

/// Speculation control initialization errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecCtrlInitError {
    /// The global instance was already set up
    AlreadyInitialized,
}

impl fmt::Display for SpecCtrlInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecCtrlInitError::AlreadyInitialized => {
                write!(f, "speculation control already initialized")
            }
        }
    }
}

/// Speculation control boot report
#[derive(Debug)]
pub struct SpecCtrlReport {
    /// The committed decision
    pub decision: MitigationDecision,
    /// SMT state after the L1TF policy was applied
    pub smt: SmtState,
    /// Self-test report (if tests were run)
    pub test_report: Option<TestReport>,
}

impl SpecCtrlReport {
    /// Check that no self-test failed and nothing fell back or degraded
    pub fn is_secure(&self) -> bool {
        let tests_ok = self
            .test_report
            .as_ref()
            .map(|t| t.ok())
            .unwrap_or(true);
        self.decision.diagnostics.is_empty() && tests_ok
    }

    /// Print the report to the console
    pub fn print(&self) {
        let d = &self.decision;
        klog_always!("=== Speculation Control Report ===");
        klog_always!(
            "CPU: {} family {:#x} model {:#x}",
            d.cpu.vendor.name(),
            d.cpu.family,
            d.cpu.model
        );
        for class in BugClass::ALL {
            let status = VulnerabilityStatus {
                class,
                decision: d,
                smt: self.smt,
                vmx_l1d_flush: VmxL1dFlush::Auto,
                bad_module: false,
            };
            klog_always!("  {}: {}", class.name(), status);
        }
        klog_always!("SMT: {}", self.smt.as_str());
        klog_always!("L1TF: {} (MAX_PA/2 = {:#x})", d.l1tf.mode.as_str(), d.l1tf.half_pa);

        if !d.diagnostics.is_empty() {
            klog_always!("Diagnostics: {:?}", d.diagnostics);
        }

        if let Some(ref tests) = self.test_report {
            klog_always!("Self-Tests:");
            klog_always!(
                "  Passed: {}, Failed: {}, Warnings: {}",
                tests.passed,
                tests.failed,
                tests.warnings
            );
        }

        klog_always!(
            "Overall Status: {}",
            if self.is_secure() {
                "SECURE"
            } else {
                "WARNINGS"
            }
        );
    }
}

/// A committed mitigation decision and everything that enforces it.
///
/// Task hooks take the executing CPU from [`cpu_local::current_cpu_id`].
pub struct SpecCtrl<R: ControlRegisters> {
    enforcer: Enforcer<R>,
    smt: SmtControl,
    report: ReportState,
}

impl<R: ControlRegisters> SpecCtrl<R> {
    /// Wrap an already selected decision. Nothing is loaded yet.
    pub fn new(decision: MitigationDecision, regs: R, smt_supported: bool) -> Self {
        SpecCtrl {
            enforcer: Enforcer::new(decision, regs),
            smt: SmtControl::new(smt_supported),
            report: ReportState::new(),
        }
    }

    /// Select and enforce mitigations on the boot CPU.
    ///
    /// 1. Install the log profile
    /// 2. Parse the command line
    /// 3. Capture boot register values
    /// 4. Select mitigations
    /// 5. Load the boot CPU and apply the SMT policy
    /// 6. Run self-tests (optional)
    ///
    /// Never fails: unusable options and missing capabilities end up as
    /// [`Diagnostics`] on the decision.
    pub fn init(
        config: SpecCtrlConfig<'_>,
        cpu: &CpuInfo,
        memory: &[MemoryRegion],
        regs: R,
        smt_supported: bool,
    ) -> (Self, SpecCtrlReport) {
        klog::set_profile(config.log_profile);
        klog_always!("  Initializing speculation control...");

        klog_always!("    [1/6] Log profile: {:?}", config.log_profile);

        klog_always!("    [2/6] Parsing mitigation options...");
        let mut opts = BootOptions::parse(config.cmdline);
        if !config.enable_mitigations {
            klog_always!("      Mitigations disabled by configuration");
            opts.force_off();
        }

        klog_always!("    [3/6] Reading boot control registers...");
        let boot = read_boot_registers(&regs, cpu);

        klog_always!("    [4/6] Selecting mitigations...");
        let decision = MitigationDecision::select(cpu, &opts, &config.build, memory, boot);
        klog_always!(
            "      Spectre V2: {}, SSB: {}, L1TF: {}",
            decision.spectre_v2.as_str(),
            decision.ssb.as_str(),
            decision.l1tf.mode.as_str()
        );

        let spec_ctrl = SpecCtrl::new(decision, regs, smt_supported);

        klog_always!("    [5/6] Enforcing on boot CPU...");
        spec_ctrl.cpu_online();
        spec_ctrl.smt.apply(decision.l1tf.smt);

        let test_report = if config.run_self_tests {
            klog_always!("    [6/6] Running speculation control self-tests...");
            let tests = spec_ctrl.run_self_tests();
            if tests.failed > 0 {
                klog!(Error, "      WARNING: {} self-tests failed", tests.failed);
            } else {
                klog_always!("      All {} tests passed", tests.passed);
            }
            Some(tests)
        } else {
            klog_always!("    [6/6] Self-tests: SKIPPED (disabled)");
            None
        };

        let report = SpecCtrlReport {
            decision,
            smt: spec_ctrl.smt.state(),
            test_report,
        };
        (spec_ctrl, report)
    }

    #[inline]
    pub fn decision(&self) -> &MitigationDecision {
        self.enforcer.decision()
    }

    #[inline]
    pub fn enforcer(&self) -> &Enforcer<R> {
        &self.enforcer
    }

    // ------------------------------------------------------------------
    // Processors
    // ------------------------------------------------------------------

    /// Bring the executing CPU under enforcement.
    pub fn cpu_online(&self) {
        self.enforcer.init_cpu(current_cpu_id());
    }

    pub fn cpu_offline(&self, cpu: CpuId) {
        self.enforcer.cpu_offline(cpu);
    }

    /// Reload every online CPU; see [`Enforcer::resync_all`].
    pub fn resync_all(&self, xcall: &dyn CrossCall) {
        self.enforcer.resync_all(xcall);
    }

    #[inline]
    pub fn predictor_barrier(&self) {
        self.enforcer.predictor_barrier();
    }

    /// Kernel entry hook. Sets IBRS when IBRS is in use.
    #[inline]
    pub fn enter_kernel(&self) {
        self.enforcer.enter_kernel(current_cpu_id());
    }

    /// Return-to-user hook.
    #[inline]
    pub fn exit_kernel(&self) {
        self.enforcer.exit_kernel(current_cpu_id());
    }

    pub fn enter_guest(&self, guest_spec_ctrl: u64) {
        self.enforcer.enter_guest(current_cpu_id(), guest_spec_ctrl);
    }

    pub fn exit_guest(&self, guest_spec_ctrl: u64) {
        self.enforcer.exit_guest(current_cpu_id(), guest_spec_ctrl);
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Context switch on the executing CPU.
    #[inline]
    pub fn switch_to(&self, next: &TaskSpecPolicy) {
        self.enforcer.switch_to(current_cpu_id(), next);
    }

    /// Change a task's store bypass policy. `current` is true when `task`
    /// is the task running on the executing CPU.
    pub fn set_task_policy(
        &self,
        task: &TaskSpecPolicy,
        current: bool,
        request: SpecRequest,
    ) -> Result<PolicyChange, SpecCtrlError> {
        prctl::set_policy(&self.enforcer, task, task_context(current), request)
    }

    pub fn task_policy(&self, task: &TaskSpecPolicy) -> SpecCtrlStatus {
        prctl::get_policy(self.decision(), task)
    }

    /// Raw PR_SET_SPECULATION_CTRL.
    pub fn prctl_set(
        &self,
        task: &TaskSpecPolicy,
        current: bool,
        which: u64,
        ctrl: u64,
    ) -> Result<(), SpecCtrlError> {
        prctl::prctl_set(&self.enforcer, task, task_context(current), which, ctrl)
    }

    /// Raw PR_GET_SPECULATION_CTRL.
    pub fn prctl_get(&self, task: &TaskSpecPolicy, which: u64) -> Result<u32, SpecCtrlError> {
        prctl::prctl_get(self.decision(), task, which).map(|status| status.bits())
    }

    /// Called when seccomp strict mode engages for `task`.
    pub fn seccomp_mitigate(&self, task: &TaskSpecPolicy, current: bool) {
        prctl::seccomp_spec_mitigate(&self.enforcer, task, task_context(current));
    }

    // ------------------------------------------------------------------
    // SMT, reporting and self-tests
    // ------------------------------------------------------------------

    #[inline]
    pub fn smt_state(&self) -> SmtState {
        self.smt.state()
    }

    /// Re-enable SMT. Refused after `l1tf=full,force`.
    pub fn smt_enable(&self) -> Result<(), SpecCtrlError> {
        self.smt.enable()?;
        Ok(())
    }

    pub fn set_vmx_l1d_flush(&self, state: VmxL1dFlush) {
        self.report.set_vmx_l1d_flush(state);
    }

    /// Module load check; false when the module defeats retpolines.
    pub fn module_loaded(&self, has_retpoline: bool) -> bool {
        self.report
            .retpoline_module_ok(self.decision(), has_retpoline)
    }

    /// Status line for `class`.
    pub fn status(&self, class: BugClass) -> VulnerabilityStatus<'_> {
        VulnerabilityStatus {
            class,
            decision: self.decision(),
            smt: self.smt.state(),
            vmx_l1d_flush: self.report.vmx_l1d_flush(),
            bad_module: self.report.bad_module(),
        }
    }

    /// Upper bound for swap offsets so swap PTEs stay below MAX_PA/2.
    pub fn max_swap_pages(&self, generic_pages: u64) -> u64 {
        let d = self.decision();
        vuln::l1tf_max_swap_pages(d.bugs, &d.cpu, generic_pages)
    }

    pub fn run_self_tests(&self) -> TestReport {
        selftest::run_self_tests(&TestContext::new(&self.enforcer, self.smt.state()))
    }
}

fn task_context(current: bool) -> TaskContext {
    if current {
        TaskContext::Current {
            cpu: current_cpu_id(),
        }
    } else {
        TaskContext::Other
    }
}

fn read_boot_registers<R: ControlRegisters>(regs: &R, cpu: &CpuInfo) -> BootRegisters {
    let spec_ctrl = if cpu.has(CpuCaps::SPEC_CTRL) {
        regs.read(ControlRegister::SpecCtrl).unwrap_or(0)
    } else {
        0
    };
    let ls_cfg = if SsbdPath::for_cpu(cpu) == SsbdPath::LsCfg {
        regs.read(ControlRegister::AmdLsCfg).unwrap_or(0)
    } else {
        0
    };
    BootRegisters { spec_ctrl, ls_cfg }
}

// ============================================================================
// Global instance
// ============================================================================

#[cfg(target_arch = "x86_64")]
static SPEC_CTRL: Once<SpecCtrl<MsrControl>> = Once::new();

/// Detect the boot CPU, select mitigations and install the global instance.
///
/// Runs once on the boot CPU, after the memory map is known and before any
/// AP is started.
#[cfg(target_arch = "x86_64")]
pub fn init_global(
    config: SpecCtrlConfig<'_>,
    memory: &[MemoryRegion],
    smt_supported: bool,
) -> Result<SpecCtrlReport, SpecCtrlInitError> {
    if SPEC_CTRL.is_completed() {
        return Err(SpecCtrlInitError::AlreadyInitialized);
    }

    let regs = MsrControl;
    let mut cpu = CpuInfo::detect();
    if let Some(arch_caps) = regs.read_arch_capabilities(&cpu) {
        cpu = cpu.with_arch_capabilities(arch_caps);
    }

    let (spec_ctrl, report) = SpecCtrl::init(config, &cpu, memory, regs, smt_supported);
    SPEC_CTRL.call_once(|| spec_ctrl);
    Ok(report)
}

/// The global instance, once [`init_global`] has run.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn global() -> Option<&'static SpecCtrl<MsrControl>> {
    SPEC_CTRL.get()
}
