//! Boot command line options for speculation mitigations.
//!
//! Recognized tokens:
//!
//! | Token | Values |
//! |-------|--------|
//! | `spectre_v2=` | off, on, retpoline, retpoline,amd, retpoline,generic, auto |
//! | `nospectre_v2` | |
//! | `spec_store_bypass_disable=` | auto, on, off, prctl, seccomp |
//! | `nospec_store_bypass_disable` | |
//! | `l1tf=` | off, flush,nowarn, flush, flush,nosmt, full, full,force |
//! | `nospec` | |
//! | `mitigations=` | off, auto, auto,nosmt |
//!
//! When a key appears more than once the last occurrence wins. The boolean
//! switches override their keyed counterpart regardless of position, and
//! `mitigations=off` overrides everything. Parsing never fails: unknown
//! values keep the automatic choice and set a [`Diagnostics`] flag.

use crate::error::Diagnostics;
use crate::select::L1tfMitigation;

/// Longest option value accepted; longer values are treated as unknown.
const MAX_VALUE_LEN: usize = 19;

/// `spectre_v2=` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectreV2Cmd {
    None,
    Auto,
    Force,
    Retpoline,
    RetpolineGeneric,
    RetpolineAmd,
}

impl SpectreV2Cmd {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(Self::None),
            "on" => Some(Self::Force),
            "retpoline" => Some(Self::Retpoline),
            "retpoline,amd" => Some(Self::RetpolineAmd),
            "retpoline,generic" => Some(Self::RetpolineGeneric),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// `spec_store_bypass_disable=` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsbCmd {
    None,
    Auto,
    On,
    Prctl,
    Seccomp,
}

impl SsbCmd {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "on" => Some(Self::On),
            "off" => Some(Self::None),
            "prctl" => Some(Self::Prctl),
            "seccomp" => Some(Self::Seccomp),
            _ => None,
        }
    }
}

impl L1tfMitigation {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(Self::Off),
            "flush,nowarn" => Some(Self::FlushNoWarn),
            "flush" => Some(Self::Flush),
            "flush,nosmt" => Some(Self::FlushNoSmt),
            "full" => Some(Self::Full),
            "full,force" => Some(Self::FullForce),
            _ => None,
        }
    }
}

/// `mitigations=` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MitigationsCmd {
    Off,
    Auto,
    AutoNoSmt,
}

impl MitigationsCmd {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(Self::Off),
            "auto" => Some(Self::Auto),
            "auto,nosmt" => Some(Self::AutoNoSmt),
            _ => None,
        }
    }
}

/// Speculation mitigation options from the boot command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    pub spectre_v2: SpectreV2Cmd,
    pub ssb: SsbCmd,
    pub l1tf: L1tfMitigation,
    /// IBRS and IBPB must not be used.
    pub nospec: bool,
    pub mitigations: MitigationsCmd,
    pub diagnostics: Diagnostics,
}

impl Default for BootOptions {
    fn default() -> Self {
        BootOptions {
            spectre_v2: SpectreV2Cmd::Auto,
            ssb: SsbCmd::Auto,
            l1tf: L1tfMitigation::Flush,
            nospec: false,
            mitigations: MitigationsCmd::Auto,
            diagnostics: Diagnostics::empty(),
        }
    }
}

impl BootOptions {
    /// Parse a whitespace-separated kernel command line.
    pub fn parse(cmdline: &str) -> Self {
        let mut opts = BootOptions::default();
        let mut nospectre_v2 = false;
        let mut nossb = false;
        let mut l1tf_explicit = false;

        for token in cmdline.split_ascii_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (token, None),
            };

            match (key, value) {
                ("nospectre_v2", None) => nospectre_v2 = true,
                ("nospec_store_bypass_disable", None) => nossb = true,
                ("nospec", None) => opts.nospec = true,
                ("spectre_v2", Some(v)) => {
                    opts.spectre_v2 = lookup(v, SpectreV2Cmd::parse).unwrap_or_else(|| {
                        opts.diagnostics |= Diagnostics::SPECTRE_V2_UNKNOWN_OPTION;
                        SpectreV2Cmd::Auto
                    });
                }
                ("spec_store_bypass_disable", Some(v)) => {
                    opts.ssb = lookup(v, SsbCmd::parse).unwrap_or_else(|| {
                        opts.diagnostics |= Diagnostics::SSB_UNKNOWN_OPTION;
                        SsbCmd::Auto
                    });
                }
                ("l1tf", Some(v)) => match lookup(v, L1tfMitigation::parse) {
                    Some(mode) => {
                        opts.l1tf = mode;
                        l1tf_explicit = true;
                    }
                    None => {
                        opts.diagnostics |= Diagnostics::L1TF_UNKNOWN_OPTION;
                        opts.l1tf = L1tfMitigation::Flush;
                        l1tf_explicit = false;
                    }
                },
                ("mitigations", Some(v)) => {
                    opts.mitigations = lookup(v, MitigationsCmd::parse).unwrap_or_else(|| {
                        opts.diagnostics |= Diagnostics::MITIGATIONS_UNKNOWN_OPTION;
                        MitigationsCmd::Auto
                    });
                }
                _ => {}
            }
        }

        if nospectre_v2 {
            opts.spectre_v2 = SpectreV2Cmd::None;
        }
        if nossb {
            opts.ssb = SsbCmd::None;
        }

        match opts.mitigations {
            MitigationsCmd::Off => opts.force_off(),
            MitigationsCmd::AutoNoSmt if !l1tf_explicit => {
                opts.l1tf = L1tfMitigation::FlushNoSmt;
            }
            _ => {}
        }

        // These commands rule out IBRS/IBPB as well.
        if matches!(
            opts.spectre_v2,
            SpectreV2Cmd::None | SpectreV2Cmd::Retpoline | SpectreV2Cmd::RetpolineGeneric
        ) {
            opts.nospec = true;
        }

        opts
    }

    /// Turn every mitigation class off, as `mitigations=off` does.
    pub fn force_off(&mut self) {
        self.mitigations = MitigationsCmd::Off;
        self.spectre_v2 = SpectreV2Cmd::None;
        self.ssb = SsbCmd::None;
        self.l1tf = L1tfMitigation::Off;
        self.nospec = true;
    }

    /// Whether the class-wide kill switch is in effect.
    #[inline]
    pub fn mitigations_off(&self) -> bool {
        self.mitigations == MitigationsCmd::Off
    }
}

fn lookup<T>(value: &str, parse: fn(&str) -> Option<T>) -> Option<T> {
    if value.len() > MAX_VALUE_LEN {
        return None;
    }
    parse(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = BootOptions::parse("root=/dev/sda1 quiet");
        assert_eq!(opts, BootOptions::default());
        assert_eq!(opts.l1tf, L1tfMitigation::Flush);
        assert!(!opts.nospec);
    }

    #[test]
    fn test_last_occurrence_wins() {
        let opts = BootOptions::parse("spectre_v2=retpoline,amd spectre_v2=on l1tf=full l1tf=flush,nowarn");
        assert_eq!(opts.spectre_v2, SpectreV2Cmd::Force);
        assert_eq!(opts.l1tf, L1tfMitigation::FlushNoWarn);

        let opts = BootOptions::parse("spec_store_bypass_disable=on spec_store_bypass_disable=prctl");
        assert_eq!(opts.ssb, SsbCmd::Prctl);
    }

    #[test]
    fn test_boolean_switches_override() {
        let opts = BootOptions::parse("nospectre_v2 spectre_v2=on");
        assert_eq!(opts.spectre_v2, SpectreV2Cmd::None);
        assert!(opts.nospec);

        let opts = BootOptions::parse("nospec_store_bypass_disable spec_store_bypass_disable=on");
        assert_eq!(opts.ssb, SsbCmd::None);
    }

    #[test]
    fn test_unknown_values_fall_back() {
        let opts = BootOptions::parse("spectre_v2=bogus spec_store_bypass_disable=maybe l1tf=sometimes");
        assert_eq!(opts.spectre_v2, SpectreV2Cmd::Auto);
        assert_eq!(opts.ssb, SsbCmd::Auto);
        assert_eq!(opts.l1tf, L1tfMitigation::Flush);
        assert!(opts.diagnostics.contains(
            Diagnostics::SPECTRE_V2_UNKNOWN_OPTION
                | Diagnostics::SSB_UNKNOWN_OPTION
                | Diagnostics::L1TF_UNKNOWN_OPTION
        ));

        // A bare key without a value is not the keyed option.
        let opts = BootOptions::parse("spectre_v2");
        assert_eq!(opts.spectre_v2, SpectreV2Cmd::Auto);
        assert!(opts.diagnostics.is_empty());
    }

    #[test]
    fn test_overlong_value_is_unknown() {
        let opts = BootOptions::parse("spectre_v2=retpoline,generic,xxxx");
        assert_eq!(opts.spectre_v2, SpectreV2Cmd::Auto);
        assert!(opts.diagnostics.contains(Diagnostics::SPECTRE_V2_UNKNOWN_OPTION));

        let opts = BootOptions::parse("spectre_v2=retpoline,generic");
        assert_eq!(opts.spectre_v2, SpectreV2Cmd::RetpolineGeneric);
    }

    #[test]
    fn test_kill_switch() {
        let expected_off = |opts: &BootOptions| {
            opts.spectre_v2 == SpectreV2Cmd::None
                && opts.ssb == SsbCmd::None
                && opts.l1tf == L1tfMitigation::Off
                && opts.nospec
        };

        let opts = BootOptions::parse("mitigations=off spectre_v2=on spec_store_bypass_disable=on l1tf=full,force");
        assert!(opts.mitigations_off());
        assert!(expected_off(&opts));

        let opts = BootOptions::parse("l1tf=full mitigations=off mitigations=off");
        assert!(expected_off(&opts));
    }

    #[test]
    fn test_auto_nosmt() {
        let opts = BootOptions::parse("mitigations=auto,nosmt");
        assert_eq!(opts.l1tf, L1tfMitigation::FlushNoSmt);

        let opts = BootOptions::parse("mitigations=auto,nosmt l1tf=flush,nowarn");
        assert_eq!(opts.l1tf, L1tfMitigation::FlushNoWarn);
    }

    #[test]
    fn test_nospec_from_spectre_commands() {
        assert!(BootOptions::parse("spectre_v2=retpoline").nospec);
        assert!(BootOptions::parse("spectre_v2=retpoline,generic").nospec);
        assert!(!BootOptions::parse("spectre_v2=retpoline,amd").nospec);
        assert!(!BootOptions::parse("spectre_v2=auto").nospec);
        assert!(BootOptions::parse("nospec").nospec);
    }
}
