//! Boot configuration for speculation control.

use klog::KlogProfile;

/// Properties of the kernel build that constrain mitigation choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildConfig {
    /// Retpoline thunks are available.
    pub retpoline: bool,
    /// Every indirect branch was compiled through a retpoline thunk.
    pub retpoline_compiler: bool,
    /// Seccomp strict mode is available to force-disable speculation.
    pub seccomp: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            retpoline: cfg!(feature = "retpoline"),
            retpoline_compiler: cfg!(feature = "retpoline-compiler"),
            seccomp: cfg!(feature = "seccomp"),
        }
    }
}

impl BuildConfig {
    /// A build without retpoline support or seccomp.
    pub const fn minimal() -> Self {
        BuildConfig {
            retpoline: false,
            retpoline_compiler: false,
            seccomp: false,
        }
    }
}

/// Speculation control configuration
#[derive(Debug, Clone, Copy)]
pub struct SpecCtrlConfig<'a> {
    /// Kernel command line to take mitigation options from
    pub cmdline: &'a str,
    /// Build properties
    pub build: BuildConfig,
    /// Whether to select mitigations at all (false acts as `mitigations=off`)
    pub enable_mitigations: bool,
    /// Log filter installed before the first message
    pub log_profile: KlogProfile,
    /// Whether to run speculation control self-tests
    pub run_self_tests: bool,
}

impl Default for SpecCtrlConfig<'_> {
    fn default() -> Self {
        SpecCtrlConfig {
            cmdline: "",
            build: BuildConfig::default(),
            enable_mitigations: true,
            log_profile: KlogProfile::Balanced,
            run_self_tests: false, // Enabled in strict mode
        }
    }
}

impl<'a> SpecCtrlConfig<'a> {
    /// Configuration taking options from `cmdline`.
    pub fn with_cmdline(cmdline: &'a str) -> Self {
        SpecCtrlConfig {
            cmdline,
            ..Self::default()
        }
    }

    /// Strict configuration (production recommended)
    pub fn strict() -> Self {
        SpecCtrlConfig {
            run_self_tests: true,
            ..Self::default()
        }
    }

    /// Permissive configuration (for debugging)
    pub fn permissive() -> Self {
        SpecCtrlConfig {
            enable_mitigations: false,
            log_profile: KlogProfile::Performance,
            run_self_tests: false,
            ..Self::default()
        }
    }
}
