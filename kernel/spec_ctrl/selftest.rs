//! Runtime self-tests for speculation control.
//!
//! These run against a live instance after boot selection and check that
//! the decision, the per-CPU enforcement caches and the SMT state agree
//! with each other. They never change the state of real tasks.
//!
//! # Usage
//!
//! ```rust,ignore
//! let ctx = TestContext::new(spec_ctrl.enforcer(), spec_ctrl.smt_state());
//! let report = run_self_tests(&ctx);
//! if !report.ok() {
//!     klog!(Error, "spec_ctrl: self-tests failed");
//! }
//! ```

extern crate alloc;

use alloc::vec::Vec;
use cpu_local::{CpuId, CpuMask};

use crate::ctrl::{ControlRegisters, SPEC_CTRL_SSBD};
use crate::enforce::Enforcer;
use crate::error::{Diagnostics, SpecCtrlError};
use crate::prctl::{get_policy, SpecCtrlStatus};
use crate::select::{MitigationDecision, SsbMitigation, SsbdPath};
use crate::smt::{SmtPolicy, SmtState};
use crate::task::{SpecRequest, TaskSpecPolicy};
use crate::vuln::BugClass;

/// Result of a self-test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    /// Passed, but the system is not fully protected.
    Warning(&'static str),
    /// An invariant is broken.
    Fail(&'static str),
}

impl TestResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, TestResult::Pass | TestResult::Warning(_))
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, TestResult::Fail(_))
    }
}

#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub name: &'static str,
    pub result: TestResult,
}

/// Aggregate report for all executed tests.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub outcomes: Vec<TestOutcome>,
}

impl TestReport {
    pub fn empty() -> Self {
        TestReport {
            passed: 0,
            failed: 0,
            warnings: 0,
            outcomes: Vec::new(),
        }
    }

    /// No test failed.
    pub fn ok(&self) -> bool {
        self.failed == 0
    }

    /// No failures and no warnings.
    pub fn is_secure(&self) -> bool {
        self.failed == 0 && self.warnings == 0
    }
}

/// Read-only view of per-CPU enforcement, independent of the register
/// backend.
pub trait EnforcementView {
    fn decision(&self) -> &MitigationDecision;
    fn online(&self) -> &CpuMask;
    fn loaded_spec_ctrl(&self, cpu: CpuId) -> Option<u64>;
    fn host_default(&self, cpu: CpuId) -> Option<u64>;
    /// `cpu` currently holds a guest's SPEC_CTRL view.
    fn in_guest(&self, cpu: CpuId) -> bool;
}

impl<R: ControlRegisters> EnforcementView for Enforcer<R> {
    fn decision(&self) -> &MitigationDecision {
        Enforcer::decision(self)
    }

    fn online(&self) -> &CpuMask {
        Enforcer::online(self)
    }

    fn loaded_spec_ctrl(&self, cpu: CpuId) -> Option<u64> {
        Enforcer::loaded_spec_ctrl(self, cpu)
    }

    fn host_default(&self, cpu: CpuId) -> Option<u64> {
        Enforcer::host_default(self, cpu)
    }

    fn in_guest(&self, cpu: CpuId) -> bool {
        Enforcer::in_guest(self, cpu)
    }
}

/// State shared across all self-tests.
#[derive(Clone, Copy)]
pub struct TestContext<'a> {
    pub enforcement: &'a dyn EnforcementView,
    pub smt: SmtState,
}

impl<'a> TestContext<'a> {
    pub fn new(enforcement: &'a dyn EnforcementView, smt: SmtState) -> Self {
        TestContext { enforcement, smt }
    }

    #[inline]
    pub fn decision(&self) -> &'a MitigationDecision {
        self.enforcement.decision()
    }
}

/// A runtime check on a live instance.
pub trait SpecCtrlTest {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &TestContext<'_>) -> TestResult;

    fn description(&self) -> &'static str {
        "Speculation control validation test"
    }
}

const TESTS: [&dyn SpecCtrlTest; 6] = [
    &SpectreV2StatusTest,
    &SsbDecisionTest,
    &TaskPolicyTest,
    &EnforcementCacheTest,
    &L1tfStatusTest,
    &SmtPolicyTest,
];

/// Run every built-in self-test.
pub fn run_self_tests(ctx: &TestContext<'_>) -> TestReport {
    let mut report = TestReport::empty();
    report.outcomes.reserve(TESTS.len());

    for test in TESTS {
        let result = test.run(ctx);
        match &result {
            TestResult::Pass => report.passed += 1,
            TestResult::Warning(_) => report.warnings += 1,
            TestResult::Fail(_) => report.failed += 1,
        }
        report.outcomes.push(TestOutcome {
            name: test.name(),
            result,
        });
    }

    report
}

/// Run a single test by name.
pub fn run_test(name: &str, ctx: &TestContext<'_>) -> Option<TestOutcome> {
    TESTS
        .iter()
        .find(|test| test.name() == name)
        .map(|test| TestOutcome {
            name: test.name(),
            result: test.run(ctx),
        })
}

// ============================================================================
// Built-in Tests
// ============================================================================

struct SpectreV2StatusTest;

impl SpecCtrlTest for SpectreV2StatusTest {
    fn name(&self) -> &'static str {
        "spectre_v2_status"
    }

    fn description(&self) -> &'static str {
        "Check the Spectre V2 mode against build support and IBPB"
    }

    fn run(&self, ctx: &TestContext<'_>) -> TestResult {
        let d = ctx.decision();
        if !d.affected(BugClass::SpectreV2) {
            return TestResult::Pass;
        }
        if d.spectre_v2.is_retpoline() && !d.rsb_ctxsw {
            return TestResult::Fail("Retpoline selected without RSB fill on context switch");
        }
        if d.diagnostics.contains(Diagnostics::RETPOLINE_NOT_BUILT) {
            return TestResult::Warning("Retpoline requested but not compiled in");
        }
        if !d.spectre_v2.is_retpoline() {
            return TestResult::Warning("Spectre V2 mitigation not active");
        }
        if !d.ibrs.ibpb {
            return TestResult::Warning("IBPB not available");
        }
        TestResult::Pass
    }
}

struct SsbDecisionTest;

impl SpecCtrlTest for SsbDecisionTest {
    fn name(&self) -> &'static str {
        "ssb_decision"
    }

    fn description(&self) -> &'static str {
        "Verify the store bypass mode matches the SPEC_CTRL base value"
    }

    fn run(&self, ctx: &TestContext<'_>) -> TestResult {
        let d = ctx.decision();
        if d.ssb != SsbMitigation::None && d.ssbd_path == SsbdPath::None {
            return TestResult::Fail("Store bypass mode without a disable mechanism");
        }
        if d.ssbd_path == SsbdPath::SpecCtrl {
            let base = d.spec_ctrl_base;
            if d.ssbd_forced() && base.value() & SPEC_CTRL_SSBD == 0 {
                return TestResult::Fail("SSBD forced but missing from SPEC_CTRL base");
            }
            if d.ssb.per_task() && base.allowed() & SPEC_CTRL_SSBD == 0 {
                return TestResult::Fail("Per-task SSBD not in the modifiable mask");
            }
        }
        if d.ssbd_path == SsbdPath::LsCfg && d.ssb != SsbMitigation::None && d.ls_cfg_base.is_none() {
            return TestResult::Fail("LS_CFG path without a family SSBD bit");
        }
        if d.affected(BugClass::SpeculativeStoreBypass) && d.ssb == SsbMitigation::None {
            return TestResult::Warning("Speculative store bypass not mitigated");
        }
        TestResult::Pass
    }
}

/// Exercises the task state machine on a scratch task.
struct TaskPolicyTest;

impl SpecCtrlTest for TaskPolicyTest {
    fn name(&self) -> &'static str {
        "task_policy"
    }

    fn description(&self) -> &'static str {
        "Verify force-disable is one-way and status reporting per mode"
    }

    fn run(&self, ctx: &TestContext<'_>) -> TestResult {
        let d = ctx.decision();
        let scratch = TaskSpecPolicy::new();

        if scratch.transition(SpecRequest::ForceDisable).is_err() {
            return TestResult::Fail("Force-disable rejected");
        }
        if scratch.transition(SpecRequest::Enable) != Err(SpecCtrlError::PolicyDenied) {
            return TestResult::Fail("Force-disabled task could be re-enabled");
        }
        if !scratch.ssbd() {
            return TestResult::Fail("Force-disabled task has store bypass enabled");
        }

        let expected = match d.ssb {
            SsbMitigation::Disable => SpecCtrlStatus::DISABLE,
            SsbMitigation::Prctl | SsbMitigation::SeccompAndPrctl => {
                SpecCtrlStatus::PRCTL | SpecCtrlStatus::FORCE_DISABLE
            }
            SsbMitigation::None if d.affected(BugClass::SpeculativeStoreBypass) => {
                SpecCtrlStatus::ENABLE
            }
            SsbMitigation::None => SpecCtrlStatus::NOT_AFFECTED,
        };
        if get_policy(d, &scratch) != expected {
            return TestResult::Fail("Task status does not match the store bypass mode");
        }
        TestResult::Pass
    }
}

struct EnforcementCacheTest;

impl SpecCtrlTest for EnforcementCacheTest {
    fn name(&self) -> &'static str {
        "enforcement_cache"
    }

    fn description(&self) -> &'static str {
        "Verify every online CPU loaded the host SPEC_CTRL value"
    }

    fn run(&self, ctx: &TestContext<'_>) -> TestResult {
        let d = ctx.decision();
        if !d.uses_spec_ctrl() {
            return TestResult::Pass;
        }
        let view = ctx.enforcement;
        if view.online().count() == 0 {
            return TestResult::Fail("No CPU under enforcement");
        }

        let mut result = TestResult::Pass;
        for cpu in view.online().iter() {
            // Guest views are checked on exit.
            if view.in_guest(cpu) {
                continue;
            }
            let Some(loaded) = view.loaded_spec_ctrl(cpu) else {
                return TestResult::Fail("Online CPU never loaded SPEC_CTRL");
            };
            if loaded & d.spec_ctrl_base.value() != d.spec_ctrl_base.value() {
                return TestResult::Fail("Loaded SPEC_CTRL lost base bits");
            }
            if view.host_default(cpu) != Some(loaded) {
                result = TestResult::Warning("Loaded SPEC_CTRL differs from host default");
            }
        }
        result
    }
}

struct L1tfStatusTest;

impl SpecCtrlTest for L1tfStatusTest {
    fn name(&self) -> &'static str {
        "l1tf_status"
    }

    fn description(&self) -> &'static str {
        "Check PTE inversion covers all RAM"
    }

    fn run(&self, ctx: &TestContext<'_>) -> TestResult {
        let l1tf = &ctx.decision().l1tf;
        if l1tf.half_pa == 0 || l1tf.half_pa & 0xfff != 0 {
            return TestResult::Fail("MAX_PA/2 is not a page aligned address");
        }
        if !l1tf.effective {
            return TestResult::Warning("RAM above MAX_PA/2, PTE inversion not effective");
        }
        TestResult::Pass
    }
}

struct SmtPolicyTest;

impl SpecCtrlTest for SmtPolicyTest {
    fn name(&self) -> &'static str {
        "smt_policy"
    }

    fn description(&self) -> &'static str {
        "Verify the SMT state honours the L1TF mitigation level"
    }

    fn run(&self, ctx: &TestContext<'_>) -> TestResult {
        let policy = ctx.decision().l1tf.smt;
        match (policy, ctx.smt) {
            (_, SmtState::NotSupported) => TestResult::Pass,
            (SmtPolicy::ForceDisable, SmtState::ForceDisabled) => TestResult::Pass,
            (SmtPolicy::ForceDisable, _) => TestResult::Fail("SMT not force-disabled"),
            (SmtPolicy::Disable, SmtState::Enabled) => {
                TestResult::Warning("SMT re-enabled after L1TF requested it off")
            }
            _ => TestResult::Pass,
        }
    }
}
