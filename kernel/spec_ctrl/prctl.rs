//! Task speculation control interface (PR_GET/SET_SPECULATION_CTRL).
//!
//! The typed entry points are [`set_policy`] and [`get_policy`]; the raw
//! `which`/`ctrl` encoding used by the syscall layer goes through
//! [`prctl_set`] and [`prctl_get`].

use bitflags::bitflags;
use cpu_local::CpuId;
use klog::klog;

use crate::ctrl::ControlRegisters;
use crate::enforce::Enforcer;
use crate::error::SpecCtrlError;
use crate::select::{MitigationDecision, SsbMitigation};
use crate::task::{PolicyChange, SpecRequest, SsbTaskState, TaskSpecPolicy};
use crate::vuln::BugClass;

/// Speculation feature selector: speculative store bypass.
pub const PR_SPEC_STORE_BYPASS: u64 = 0;

bitflags! {
    /// Per-task speculation status as returned by the get interface.
    ///
    /// The empty set means the CPU is not affected.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpecCtrlStatus: u32 {
        /// The state can be changed per task.
        const PRCTL = 1 << 0;
        /// Speculation is enabled (mitigation off).
        const ENABLE = 1 << 1;
        /// Speculation is disabled (mitigation on).
        const DISABLE = 1 << 2;
        /// Disabled, and enabling is refused.
        const FORCE_DISABLE = 1 << 3;
    }
}

impl SpecCtrlStatus {
    pub const NOT_AFFECTED: Self = Self::empty();
}

impl SpecRequest {
    /// Decode a raw control value.
    pub fn from_raw(ctrl: u64) -> Result<Self, SpecCtrlError> {
        match ctrl {
            c if c == SpecCtrlStatus::ENABLE.bits() as u64 => Ok(SpecRequest::Enable),
            c if c == SpecCtrlStatus::DISABLE.bits() as u64 => Ok(SpecRequest::Disable),
            c if c == SpecCtrlStatus::FORCE_DISABLE.bits() as u64 => {
                Ok(SpecRequest::ForceDisable)
            }
            _ => Err(SpecCtrlError::OutOfRange),
        }
    }
}

/// Whose policy is being changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskContext {
    /// The task running on `cpu`; enforcement updates immediately.
    Current { cpu: CpuId },
    /// Another task; picked up when it is next scheduled in.
    Other,
}

/// Change the store bypass policy of a task.
pub fn set_policy<R: ControlRegisters>(
    enforcer: &Enforcer<R>,
    task: &TaskSpecPolicy,
    ctx: TaskContext,
    request: SpecRequest,
) -> Result<PolicyChange, SpecCtrlError> {
    if !enforcer.decision().ssb.per_task() {
        return Err(SpecCtrlError::PolicyUnsupported);
    }

    let change = task.transition(request)?;

    if let TaskContext::Current { cpu } = ctx {
        if change.ssbd_toggled() {
            enforcer.update_current(cpu, task);
        }
    }

    Ok(change)
}

/// Store bypass status of a task.
pub fn get_policy(decision: &MitigationDecision, task: &TaskSpecPolicy) -> SpecCtrlStatus {
    match decision.ssb {
        SsbMitigation::Disable => SpecCtrlStatus::DISABLE,
        SsbMitigation::Prctl | SsbMitigation::SeccompAndPrctl => match task.state() {
            SsbTaskState::ForceDisabled => SpecCtrlStatus::PRCTL | SpecCtrlStatus::FORCE_DISABLE,
            SsbTaskState::Disabled => SpecCtrlStatus::PRCTL | SpecCtrlStatus::DISABLE,
            SsbTaskState::Enabled => SpecCtrlStatus::PRCTL | SpecCtrlStatus::ENABLE,
        },
        SsbMitigation::None => {
            if decision.affected(BugClass::SpeculativeStoreBypass) {
                SpecCtrlStatus::ENABLE
            } else {
                SpecCtrlStatus::NOT_AFFECTED
            }
        }
    }
}

/// Raw set: `which` selects the feature, `ctrl` the requested state.
pub fn prctl_set<R: ControlRegisters>(
    enforcer: &Enforcer<R>,
    task: &TaskSpecPolicy,
    ctx: TaskContext,
    which: u64,
    ctrl: u64,
) -> Result<(), SpecCtrlError> {
    match which {
        PR_SPEC_STORE_BYPASS => {
            if !enforcer.decision().ssb.per_task() {
                return Err(SpecCtrlError::PolicyUnsupported);
            }
            let request = SpecRequest::from_raw(ctrl)?;
            set_policy(enforcer, task, ctx, request).map(|_| ())
        }
        _ => Err(SpecCtrlError::NoDevice),
    }
}

/// Raw get.
pub fn prctl_get(
    decision: &MitigationDecision,
    task: &TaskSpecPolicy,
    which: u64,
) -> Result<SpecCtrlStatus, SpecCtrlError> {
    match which {
        PR_SPEC_STORE_BYPASS => Ok(get_policy(decision, task)),
        _ => Err(SpecCtrlError::NoDevice),
    }
}

/// Seccomp strict mode hook: force-disable speculation for the task when
/// the store bypass mode is tied to seccomp.
pub fn seccomp_spec_mitigate<R: ControlRegisters>(
    enforcer: &Enforcer<R>,
    task: &TaskSpecPolicy,
    ctx: TaskContext,
) {
    if enforcer.decision().ssb != SsbMitigation::SeccompAndPrctl {
        return;
    }
    if let Err(e) = set_policy(enforcer, task, ctx, SpecRequest::ForceDisable) {
        klog!(Warn, "Speculation prctl: seccomp force-disable failed: {}", e);
    }
}
