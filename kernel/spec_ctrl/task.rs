//! Per-task speculative store bypass state.
//!
//! Each task carries a [`TaskSpecPolicy`]. Transitions are a single atomic
//! read-modify-write, so a task changing its own policy never races with
//! another thread changing it through the prctl interface.
//!
//! Invariant: `ForceDisabled` implies disabled, and nothing leaves it.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::SpecCtrlError;

/// Store bypass state of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SsbTaskState {
    Enabled = 0,
    Disabled = 1,
    ForceDisabled = 2,
}

impl SsbTaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SsbTaskState::Enabled,
            1 => SsbTaskState::Disabled,
            _ => SsbTaskState::ForceDisabled,
        }
    }

    /// Whether store bypass is disabled for the task.
    #[inline]
    pub const fn ssbd(self) -> bool {
        !matches!(self, SsbTaskState::Enabled)
    }

    #[inline]
    pub const fn force_disabled(self) -> bool {
        matches!(self, SsbTaskState::ForceDisabled)
    }

    /// State after `request`, or `None` when the request is refused.
    const fn next(self, request: SpecRequest) -> Option<Self> {
        match (self, request) {
            (SsbTaskState::ForceDisabled, SpecRequest::Enable) => None,
            (SsbTaskState::ForceDisabled, _) => Some(SsbTaskState::ForceDisabled),
            (_, SpecRequest::Enable) => Some(SsbTaskState::Enabled),
            (_, SpecRequest::Disable) => Some(SsbTaskState::Disabled),
            (_, SpecRequest::ForceDisable) => Some(SsbTaskState::ForceDisabled),
        }
    }
}

/// Requested change of a task's speculation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecRequest {
    Enable,
    Disable,
    ForceDisable,
}

/// Outcome of a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyChange {
    pub previous: SsbTaskState,
    pub current: SsbTaskState,
}

impl PolicyChange {
    #[inline]
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }

    /// Whether the enforced SSBD bit flips, requiring a register update.
    #[inline]
    pub fn ssbd_toggled(&self) -> bool {
        self.previous.ssbd() != self.current.ssbd()
    }
}

/// Speculation policy embedded in a task.
#[derive(Debug)]
pub struct TaskSpecPolicy {
    state: AtomicU8,
}

impl TaskSpecPolicy {
    pub const fn new() -> Self {
        TaskSpecPolicy {
            state: AtomicU8::new(SsbTaskState::Enabled as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> SsbTaskState {
        SsbTaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn ssbd(&self) -> bool {
        self.state().ssbd()
    }

    /// Policy for a child task: the parent's state, force included.
    pub fn fork(&self) -> Self {
        TaskSpecPolicy {
            state: AtomicU8::new(self.state() as u8),
        }
    }

    /// Apply `request`.
    ///
    /// Enabling a force-disabled task fails with
    /// [`SpecCtrlError::PolicyDenied`] and leaves the state untouched.
    /// The returned change describes this update alone, even when other
    /// CPUs transition the same task concurrently.
    pub fn transition(&self, request: SpecRequest) -> Result<PolicyChange, SpecCtrlError> {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                SsbTaskState::from_u8(raw).next(request).map(|next| next as u8)
            });

        let previous = match result {
            Ok(raw) => SsbTaskState::from_u8(raw),
            Err(_) => return Err(SpecCtrlError::PolicyDenied),
        };
        match previous.next(request) {
            Some(current) => Ok(PolicyChange { previous, current }),
            None => Err(SpecCtrlError::PolicyDenied),
        }
    }
}

impl Default for TaskSpecPolicy {
    fn default() -> Self {
        Self::new()
    }
}
