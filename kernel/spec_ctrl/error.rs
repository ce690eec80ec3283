//! Error and diagnostic types.
//!
//! [`SpecCtrlError`] is returned to callers of the task policy and register
//! interfaces. [`Diagnostics`] records non-fatal findings from option
//! parsing and mitigation selection; nothing in this crate fails boot.

use bitflags::bitflags;
use core::fmt;

/// Errors returned by the speculation control interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecCtrlError {
    /// Enabling speculation was requested for a force-disabled task.
    PolicyDenied,
    /// The store bypass mode does not permit per-task control.
    PolicyUnsupported,
    /// Unknown speculation feature selector.
    NoDevice,
    /// Unknown control value.
    OutOfRange,
    /// A control register write carried bits outside the modifiable mask.
    UnknownBits(u64),
}

// Linux errno numbers
const EPERM: i32 = 1;
const ENXIO: i32 = 6;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const ERANGE: i32 = 34;

impl SpecCtrlError {
    /// Positive errno value for the syscall layer.
    pub const fn errno(&self) -> i32 {
        match self {
            SpecCtrlError::PolicyDenied => EPERM,
            SpecCtrlError::PolicyUnsupported => ENXIO,
            SpecCtrlError::NoDevice => ENODEV,
            SpecCtrlError::OutOfRange => ERANGE,
            SpecCtrlError::UnknownBits(_) => EINVAL,
        }
    }
}

impl fmt::Display for SpecCtrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecCtrlError::PolicyDenied => write!(f, "speculation is force-disabled for this task"),
            SpecCtrlError::PolicyUnsupported => {
                write!(f, "per-task speculation control not available")
            }
            SpecCtrlError::NoDevice => write!(f, "unknown speculation feature"),
            SpecCtrlError::OutOfRange => write!(f, "unknown speculation control value"),
            SpecCtrlError::UnknownBits(val) => {
                write!(f, "SPEC_CTRL MSR value {:#018x} is unknown", val)
            }
        }
    }
}

/// Category of a recorded diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A boot option was not understood and the automatic choice was used.
    ConfigurationFallback,
    /// The requested mitigation needs a capability this system lacks.
    CapabilityUnavailable,
    /// The mitigation is active but does not cover the whole system.
    IneffectiveMitigation,
}

bitflags! {
    /// Non-fatal findings from parsing and selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Diagnostics: u16 {
        const SPECTRE_V2_UNKNOWN_OPTION = 1 << 0;
        const SSB_UNKNOWN_OPTION = 1 << 1;
        const L1TF_UNKNOWN_OPTION = 1 << 2;
        const MITIGATIONS_UNKNOWN_OPTION = 1 << 3;
        /// `spectre_v2=retpoline,amd` on a non-AMD CPU.
        const RETPOLINE_AMD_NOT_AMD = 1 << 4;
        const RETPOLINE_NOT_BUILT = 1 << 5;
        const LFENCE_NOT_SERIALIZING = 1 << 6;
        /// Store bypass disable requested but the CPU cannot do it.
        const SSBD_UNAVAILABLE = 1 << 7;
        /// RAM is mapped above MAX_PA/2.
        const L1TF_INEFFECTIVE = 1 << 8;
    }
}

impl Diagnostics {
    /// Category of a single diagnostic flag.
    pub fn kind(self) -> DiagnosticKind {
        if self.intersects(Self::L1TF_INEFFECTIVE) {
            DiagnosticKind::IneffectiveMitigation
        } else if self.intersects(
            Self::RETPOLINE_NOT_BUILT | Self::LFENCE_NOT_SERIALIZING | Self::SSBD_UNAVAILABLE,
        ) {
            DiagnosticKind::CapabilityUnavailable
        } else {
            DiagnosticKind::ConfigurationFallback
        }
    }

    /// Whether any recorded flag belongs to `kind`.
    pub fn has_kind(&self, kind: DiagnosticKind) -> bool {
        self.iter().any(|flag| flag.kind() == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_values() {
        assert_eq!(SpecCtrlError::PolicyDenied.errno(), 1);
        assert_eq!(SpecCtrlError::PolicyUnsupported.errno(), 6);
        assert_eq!(SpecCtrlError::NoDevice.errno(), 19);
        assert_eq!(SpecCtrlError::OutOfRange.errno(), 34);
    }

    #[test]
    fn test_diagnostic_kinds() {
        assert_eq!(
            Diagnostics::SSB_UNKNOWN_OPTION.kind(),
            DiagnosticKind::ConfigurationFallback
        );
        assert_eq!(
            Diagnostics::LFENCE_NOT_SERIALIZING.kind(),
            DiagnosticKind::CapabilityUnavailable
        );

        let diags = Diagnostics::RETPOLINE_AMD_NOT_AMD | Diagnostics::L1TF_INEFFECTIVE;
        assert!(diags.has_kind(DiagnosticKind::IneffectiveMitigation));
        assert!(diags.has_kind(DiagnosticKind::ConfigurationFallback));
        assert!(!diags.has_kind(DiagnosticKind::CapabilityUnavailable));
        assert!(!Diagnostics::empty().has_kind(DiagnosticKind::ConfigurationFallback));
    }
}
