//! Simultaneous multithreading control requested by the L1TF mitigation.
//!
//! The actual sibling offlining belongs to the CPU hotplug code; this
//! module only tracks the requested state so hotplug and reporting agree.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::SpecCtrlError;

/// SMT request implied by an L1TF mitigation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtPolicy {
    Keep,
    Disable,
    /// Disable and refuse any later attempt to enable.
    ForceDisable,
}

/// SMT control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmtState {
    Enabled = 0,
    Disabled = 1,
    ForceDisabled = 2,
    NotSupported = 3,
}

impl SmtState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SmtState::Enabled,
            1 => SmtState::Disabled,
            2 => SmtState::ForceDisabled,
            _ => SmtState::NotSupported,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SmtState::Enabled => "on",
            SmtState::Disabled => "off",
            SmtState::ForceDisabled => "forceoff",
            SmtState::NotSupported => "notsupported",
        }
    }
}

/// Refusal to re-enable SMT after a forced disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmtForceDisabled;

impl From<SmtForceDisabled> for SpecCtrlError {
    fn from(_: SmtForceDisabled) -> Self {
        SpecCtrlError::PolicyDenied
    }
}

pub struct SmtControl {
    state: AtomicU8,
}

impl SmtControl {
    pub const fn new(supported: bool) -> Self {
        let state = if supported {
            SmtState::Enabled
        } else {
            SmtState::NotSupported
        };
        SmtControl {
            state: AtomicU8::new(state as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> SmtState {
        SmtState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether sibling threads may run.
    #[inline]
    pub fn enabled(&self) -> bool {
        self.state() == SmtState::Enabled
    }

    /// Request SMT off. Ignored when unsupported or already force-disabled.
    pub fn disable(&self, force: bool) {
        let target = if force {
            SmtState::ForceDisabled
        } else {
            SmtState::Disabled
        };
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match SmtState::from_u8(raw) {
                    SmtState::ForceDisabled | SmtState::NotSupported => None,
                    _ => Some(target as u8),
                }
            });
    }

    /// Apply the SMT request of a mitigation decision.
    pub fn apply(&self, policy: SmtPolicy) {
        match policy {
            SmtPolicy::Keep => {}
            SmtPolicy::Disable => self.disable(false),
            SmtPolicy::ForceDisable => self.disable(true),
        }
    }

    /// Re-enable SMT. Refused after a forced disable.
    pub fn enable(&self) -> Result<(), SmtForceDisabled> {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match SmtState::from_u8(raw) {
                    SmtState::Disabled => Some(SmtState::Enabled as u8),
                    _ => None,
                }
            });
        match result {
            Err(raw) if SmtState::from_u8(raw) == SmtState::ForceDisabled => Err(SmtForceDisabled),
            _ => Ok(()),
        }
    }
}
