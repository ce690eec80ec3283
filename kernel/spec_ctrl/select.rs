//! Mitigation selection engine.
//!
//! Runs once on the boot CPU. Each bug class has a pure selection function
//! taking the vulnerability verdict, the boot command and the CPU
//! capabilities; [`MitigationDecision::select`] runs them in order
//! (Spectre V2, IBRS/IBPB defaults, L1TF, store bypass) and folds the
//! results into the immutable decision that drives enforcement.

use crate::cmdline::{BootOptions, SpectreV2Cmd, SsbCmd};
use crate::config::BuildConfig;
use crate::cpu::{intel, match_cpu, CpuCaps, CpuInfo, CpuMatch, CpuVendor};
use crate::ctrl::{LsCfgBase, SpecCtrlBase, SPEC_CTRL_IBRS, SPEC_CTRL_SSBD};
use crate::error::Diagnostics;
use crate::smt::SmtPolicy;
use crate::vuln::{corrected_cache_bits, detect_bugs, l1tf_half_pa, BugClass, CpuBugs};
use klog::klog;

// ============================================================================
// Modes
// ============================================================================

/// Active Spectre variant 2 mitigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectreV2Mitigation {
    None,
    RetpolineMinimalGeneric,
    RetpolineMinimalAmd,
    RetpolineGeneric,
    RetpolineAmd,
}

impl SpectreV2Mitigation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "Vulnerable",
            Self::RetpolineMinimalGeneric => "Vulnerable: Minimal generic ASM retpoline",
            Self::RetpolineMinimalAmd => "Vulnerable: Minimal AMD ASM retpoline",
            Self::RetpolineGeneric => "Mitigation: Full generic retpoline",
            Self::RetpolineAmd => "Mitigation: Full AMD retpoline",
        }
    }

    #[inline]
    pub const fn is_retpoline(self) -> bool {
        !matches!(self, Self::None)
    }

    #[inline]
    pub const fn is_amd(self) -> bool {
        matches!(self, Self::RetpolineMinimalAmd | Self::RetpolineAmd)
    }
}

/// Active speculative store bypass mitigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsbMitigation {
    None,
    Disable,
    Prctl,
    SeccompAndPrctl,
}

impl SsbMitigation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "Vulnerable",
            Self::Disable => "Mitigation: Speculative Store Bypass disabled",
            Self::Prctl => "Mitigation: Speculative Store Bypass disabled via prctl",
            Self::SeccompAndPrctl => {
                "Mitigation: Speculative Store Bypass disabled via prctl and seccomp"
            }
        }
    }

    /// Whether tasks may choose their own store bypass state.
    #[inline]
    pub const fn per_task(self) -> bool {
        matches!(self, Self::Prctl | Self::SeccompAndPrctl)
    }
}

/// L1TF mitigation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L1tfMitigation {
    Off,
    FlushNoWarn,
    Flush,
    FlushNoSmt,
    Full,
    FullForce,
}

impl L1tfMitigation {
    /// SMT request implied by this level.
    pub const fn smt_policy(self) -> SmtPolicy {
        match self {
            Self::Off | Self::FlushNoWarn | Self::Flush => SmtPolicy::Keep,
            Self::FlushNoSmt | Self::Full => SmtPolicy::Disable,
            Self::FullForce => SmtPolicy::ForceDisable,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::FlushNoWarn => "flush,nowarn",
            Self::Flush => "flush",
            Self::FlushNoSmt => "flush,nosmt",
            Self::Full => "full",
            Self::FullForce => "full,force",
        }
    }
}

/// Mechanism used to disable speculative store bypass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsbdPath {
    /// The CPU cannot disable store bypass.
    None,
    /// SSBD bit of IA32_SPEC_CTRL.
    SpecCtrl,
    /// Family specific bit of the AMD LS_CFG register.
    LsCfg,
}

impl SsbdPath {
    /// LS_CFG is only chosen for families with a known store bypass bit.
    pub fn for_cpu(cpu: &CpuInfo) -> Self {
        if cpu.is_amd()
            && cpu.has(CpuCaps::AMD_SSBD | CpuCaps::AMD_SSBD_MASK)
            && cpu.amd_ls_cfg_ssbd_mask().is_some()
        {
            SsbdPath::LsCfg
        } else if cpu.has(CpuCaps::SSBD) {
            SsbdPath::SpecCtrl
        } else {
            SsbdPath::None
        }
    }
}

// ============================================================================
// Spectre V2
// ============================================================================

/// Result of Spectre V2 selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectreV2Selection {
    pub mode: SpectreV2Mitigation,
    /// Fill the return stack buffer on every context switch.
    pub rsb_ctxsw: bool,
    pub diagnostics: Diagnostics,
}

pub fn select_spectre_v2(
    vulnerable: bool,
    cmd: SpectreV2Cmd,
    cpu: &CpuInfo,
    build: &BuildConfig,
) -> SpectreV2Selection {
    let mut diagnostics = Diagnostics::empty();

    let cmd = if cmd == SpectreV2Cmd::RetpolineAmd && !cpu.is_amd() {
        klog!(
            Error,
            "Spectre V2 mitigation: retpoline,amd selected but CPU is not AMD. Switching to AUTO select"
        );
        diagnostics |= Diagnostics::RETPOLINE_AMD_NOT_AMD;
        SpectreV2Cmd::Auto
    } else {
        cmd
    };

    let none = |diagnostics| SpectreV2Selection {
        mode: SpectreV2Mitigation::None,
        rsb_ctxsw: false,
        diagnostics,
    };

    if !vulnerable && matches!(cmd, SpectreV2Cmd::None | SpectreV2Cmd::Auto) {
        return none(diagnostics);
    }

    let want_amd = match cmd {
        SpectreV2Cmd::None => return none(diagnostics),
        SpectreV2Cmd::Force | SpectreV2Cmd::Auto => cpu.is_amd(),
        _ if !build.retpoline => {
            klog!(
                Error,
                "Spectre V2 mitigation: kernel not compiled with retpoline; no mitigation available!"
            );
            return none(diagnostics | Diagnostics::RETPOLINE_NOT_BUILT);
        }
        SpectreV2Cmd::Retpoline => cpu.is_amd(),
        SpectreV2Cmd::RetpolineAmd => true,
        SpectreV2Cmd::RetpolineGeneric => false,
    };

    let use_amd = if want_amd && !cpu.has(CpuCaps::LFENCE_SERIALIZING) {
        klog!(
            Error,
            "Spectre V2 mitigation: LFENCE not serializing. Switching to generic retpoline"
        );
        diagnostics |= Diagnostics::LFENCE_NOT_SERIALIZING;
        false
    } else {
        want_amd
    };

    let mode = match (use_amd, build.retpoline_compiler) {
        (true, true) => SpectreV2Mitigation::RetpolineAmd,
        (true, false) => SpectreV2Mitigation::RetpolineMinimalAmd,
        (false, true) => SpectreV2Mitigation::RetpolineGeneric,
        (false, false) => SpectreV2Mitigation::RetpolineMinimalGeneric,
    };

    klog!(Info, "Spectre V2 mitigation: {}", mode.as_str());
    klog!(
        Info,
        "Spectre V2 mitigation: Spectre v2 / SpectreRSB mitigation: Filling RSB on context switch"
    );

    SpectreV2Selection {
        mode,
        rsb_ctxsw: true,
        diagnostics,
    }
}

// ============================================================================
// IBRS / IBPB
// ============================================================================

/// Cores whose return stack buffer falls back to the BTB on underflow, so
/// retpolines alone do not cover them.
const SKYLAKE_ERA: &[CpuMatch] = &[
    CpuMatch::model(CpuVendor::Intel, 6, intel::SKYLAKE_MOBILE),
    CpuMatch::model(CpuVendor::Intel, 6, intel::SKYLAKE_DESKTOP),
    CpuMatch::model(CpuVendor::Intel, 6, intel::SKYLAKE_X),
    CpuMatch::model(CpuVendor::Intel, 6, intel::KABYLAKE_MOBILE),
    CpuMatch::model(CpuVendor::Intel, 6, intel::KABYLAKE_DESKTOP),
];

pub fn is_skylake_era(cpu: &CpuInfo) -> bool {
    match_cpu(SKYLAKE_ERA, cpu)
}

/// Whether IBRS and IBPB are in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IbrsState {
    pub ibrs: bool,
    pub ibpb: bool,
}

/// Compute IBRS/IBPB usage once the Spectre V2 mode is committed.
pub fn select_ibrs(cpu: &CpuInfo, nospec: bool, v2: SpectreV2Mitigation) -> IbrsState {
    if nospec {
        klog!(Info, "IBRS/IBPB: disabled");
        return IbrsState {
            ibrs: false,
            ibpb: false,
        };
    }

    let mut state = IbrsState {
        ibrs: cpu.has(CpuCaps::SPEC_CTRL),
        ibpb: cpu.has(CpuCaps::SPEC_CTRL),
    };
    if cpu.is_amd() {
        state.ibpb = cpu.has(CpuCaps::AMD_IBPB);
    }

    if state.ibrs && v2.is_retpoline() && !is_skylake_era(cpu) {
        klog!(
            Info,
            "Spectre V2 mitigation: Retpolines enabled, force-disabling IBRS due to !SKL-era core"
        );
        state.ibrs = false;
    }

    state
}

// ============================================================================
// Speculative Store Bypass
// ============================================================================

/// Result of store bypass selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsbSelection {
    pub mode: SsbMitigation,
    pub path: SsbdPath,
    pub diagnostics: Diagnostics,
}

pub fn select_ssb(
    vulnerable: bool,
    cmd: SsbCmd,
    cpu: &CpuInfo,
    build: &BuildConfig,
) -> SsbSelection {
    let path = SsbdPath::for_cpu(cpu);
    let mut selection = SsbSelection {
        mode: SsbMitigation::None,
        path,
        diagnostics: Diagnostics::empty(),
    };

    if path == SsbdPath::None {
        if vulnerable && cmd != SsbCmd::None {
            selection.diagnostics |= Diagnostics::SSBD_UNAVAILABLE;
        }
    } else if vulnerable || !matches!(cmd, SsbCmd::None | SsbCmd::Auto) {
        selection.mode = match cmd {
            SsbCmd::Auto | SsbCmd::Seccomp if build.seccomp => SsbMitigation::SeccompAndPrctl,
            SsbCmd::Auto | SsbCmd::Seccomp | SsbCmd::Prctl => SsbMitigation::Prctl,
            SsbCmd::On => SsbMitigation::Disable,
            SsbCmd::None => SsbMitigation::None,
        };
    }

    if vulnerable {
        klog!(Info, "Speculative Store Bypass: {}", selection.mode.as_str());
    }

    selection
}

// ============================================================================
// L1 Terminal Fault
// ============================================================================

/// Firmware memory map entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Ram,
    Reserved,
}

/// Firmware memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn ram(start: u64, size: u64) -> Self {
        MemoryRegion {
            start,
            size,
            kind: RegionKind::Ram,
        }
    }

    /// Whether any byte of this RAM region lies at or above `addr`.
    fn ram_at_or_above(&self, addr: u64) -> bool {
        self.kind == RegionKind::Ram
            && self.size != 0
            && self.start.saturating_add(self.size) > addr
    }
}

/// Result of L1TF selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L1tfSelection {
    pub mode: L1tfMitigation,
    pub smt: SmtPolicy,
    /// Corrected cache address bits.
    pub cache_bits: u8,
    /// First physical address that PTE inversion cannot protect.
    pub half_pa: u64,
    /// PTE inversion covers all RAM.
    pub effective: bool,
    pub diagnostics: Diagnostics,
}

pub fn select_l1tf(
    vulnerable: bool,
    cmd: L1tfMitigation,
    cpu: &CpuInfo,
    memory: &[MemoryRegion],
) -> L1tfSelection {
    let cache_bits = corrected_cache_bits(cpu);
    let half_pa = l1tf_half_pa(cache_bits);

    if !vulnerable {
        return L1tfSelection {
            mode: L1tfMitigation::Off,
            smt: SmtPolicy::Keep,
            cache_bits,
            half_pa,
            effective: true,
            diagnostics: Diagnostics::empty(),
        };
    }

    let mut selection = L1tfSelection {
        mode: cmd,
        smt: cmd.smt_policy(),
        cache_bits,
        half_pa,
        effective: true,
        diagnostics: Diagnostics::empty(),
    };

    if memory.iter().any(|r| r.ram_at_or_above(half_pa)) {
        klog!(
            Warn,
            "L1TF: System has more than MAX_PA/2 memory. L1TF mitigation not effective."
        );
        klog!(
            Info,
            "L1TF: You may make it effective by booting the kernel with mem={} parameter.",
            half_pa
        );
        klog!(Info, "L1TF: However, doing so will make a part of your RAM unusable.");
        selection.effective = false;
        selection.diagnostics |= Diagnostics::L1TF_INEFFECTIVE;
    }

    selection
}

// ============================================================================
// Decision
// ============================================================================

/// Register values captured on the boot CPU before selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootRegisters {
    pub spec_ctrl: u64,
    pub ls_cfg: u64,
}

/// The machine-wide mitigation decision. Computed once at boot and
/// immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MitigationDecision {
    pub cpu: CpuInfo,
    pub bugs: CpuBugs,
    pub spectre_v2: SpectreV2Mitigation,
    pub rsb_ctxsw: bool,
    pub ibrs: IbrsState,
    pub ssb: SsbMitigation,
    pub ssbd_path: SsbdPath,
    pub spec_ctrl_base: SpecCtrlBase,
    pub ls_cfg_base: Option<LsCfgBase>,
    pub l1tf: L1tfSelection,
    pub diagnostics: Diagnostics,
}

impl MitigationDecision {
    /// Select mitigations for every bug class.
    pub fn select(
        cpu: &CpuInfo,
        opts: &BootOptions,
        build: &BuildConfig,
        memory: &[MemoryRegion],
        boot: BootRegisters,
    ) -> Self {
        log_option_fallbacks(opts.diagnostics);

        let bugs = detect_bugs(cpu);
        let mut diagnostics = opts.diagnostics;

        let v2 = select_spectre_v2(
            bugs.affected(BugClass::SpectreV2),
            opts.spectre_v2,
            cpu,
            build,
        );
        diagnostics |= v2.diagnostics;

        // IBRS defaults depend on the committed Spectre V2 mode.
        let ibrs = select_ibrs(cpu, opts.nospec, v2.mode);

        let l1tf = select_l1tf(bugs.affected(BugClass::L1tf), opts.l1tf, cpu, memory);
        diagnostics |= l1tf.diagnostics;

        let ssb = select_ssb(
            bugs.affected(BugClass::SpeculativeStoreBypass),
            opts.ssb,
            cpu,
            build,
        );
        diagnostics |= ssb.diagnostics;

        let boot_spec_ctrl = if cpu.has(CpuCaps::SPEC_CTRL) {
            boot.spec_ctrl
        } else {
            0
        };
        let mut spec_ctrl_base = SpecCtrlBase::new(boot_spec_ctrl);
        let mut ls_cfg_base = None;

        match ssb.path {
            SsbdPath::SpecCtrl if ssb.mode == SsbMitigation::Disable => spec_ctrl_base.force_ssbd(),
            SsbdPath::SpecCtrl if ssb.mode.per_task() => spec_ctrl_base.allow_ssbd(),
            SsbdPath::LsCfg => {
                ls_cfg_base = cpu.amd_ls_cfg_ssbd_mask().map(|ssbd_mask| LsCfgBase {
                    value: boot.ls_cfg,
                    ssbd_mask,
                });
            }
            _ => {}
        }

        MitigationDecision {
            cpu: *cpu,
            bugs,
            spectre_v2: v2.mode,
            rsb_ctxsw: v2.rsb_ctxsw,
            ibrs,
            ssb: ssb.mode,
            ssbd_path: ssb.path,
            spec_ctrl_base,
            ls_cfg_base,
            l1tf,
            diagnostics,
        }
    }

    #[inline]
    pub fn affected(&self, class: BugClass) -> bool {
        self.bugs.affected(class)
    }

    /// Whether IA32_SPEC_CTRL is written on this system.
    #[inline]
    pub fn uses_spec_ctrl(&self) -> bool {
        self.cpu.has(CpuCaps::SPEC_CTRL) || self.ssbd_path == SsbdPath::SpecCtrl
    }

    /// Store bypass is disabled for every task.
    #[inline]
    pub fn ssbd_forced(&self) -> bool {
        self.ssb == SsbMitigation::Disable
    }

    /// SPEC_CTRL value for a task with the given store bypass state.
    pub fn host_spec_ctrl(&self, task_ssbd: bool) -> u64 {
        self.spec_ctrl_with(self.task_overlay(task_ssbd))
    }

    /// SPEC_CTRL value while the CPU executes kernel code.
    ///
    /// Equal to [`host_spec_ctrl`](Self::host_spec_ctrl) with IBRS added
    /// when IBRS is selected.
    pub fn kernel_spec_ctrl(&self, task_ssbd: bool) -> u64 {
        let mut overlay = self.task_overlay(task_ssbd);
        if self.ibrs.ibrs {
            overlay |= SPEC_CTRL_IBRS;
        }
        self.spec_ctrl_with(overlay)
    }

    fn task_overlay(&self, task_ssbd: bool) -> u64 {
        if task_ssbd && self.ssbd_path == SsbdPath::SpecCtrl {
            SPEC_CTRL_SSBD
        } else {
            0
        }
    }

    fn spec_ctrl_with(&self, overlay: u64) -> u64 {
        // Overlay bits are only produced for allowed paths.
        self.spec_ctrl_base
            .effective(overlay)
            .unwrap_or(self.spec_ctrl_base.value())
    }

    /// LS_CFG value for a task with the given store bypass state.
    pub fn host_ls_cfg(&self, task_ssbd: bool) -> Option<u64> {
        self.ls_cfg_base
            .map(|base| base.effective(task_ssbd || self.ssbd_forced()))
    }
}

fn log_option_fallbacks(diags: Diagnostics) {
    if diags.contains(Diagnostics::SPECTRE_V2_UNKNOWN_OPTION) {
        klog!(Error, "Spectre V2 mitigation: unknown option. Switching to AUTO select");
    }
    if diags.contains(Diagnostics::SSB_UNKNOWN_OPTION) {
        klog!(Error, "Speculative Store Bypass: unknown option. Switching to AUTO select");
    }
    if diags.contains(Diagnostics::L1TF_UNKNOWN_OPTION) {
        klog!(Error, "L1TF: unknown option. Using default flush");
    }
    if diags.contains(Diagnostics::MITIGATIONS_UNKNOWN_OPTION) {
        klog!(Error, "mitigations: unknown option. Switching to AUTO select");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiagnosticKind;

    fn skylake() -> CpuInfo {
        CpuInfo::new(CpuVendor::Intel, 6, intel::SKYLAKE_DESKTOP)
            .with_caps(
                CpuCaps::SPEC_CTRL
                    | CpuCaps::STIBP
                    | CpuCaps::SSBD
                    | CpuCaps::LFENCE_SERIALIZING
                    | CpuCaps::PTI,
            )
            .with_phys_bits(39)
    }

    fn haswell() -> CpuInfo {
        CpuInfo::new(CpuVendor::Intel, 6, intel::HASWELL_CORE)
            .with_caps(CpuCaps::SPEC_CTRL | CpuCaps::SSBD | CpuCaps::LFENCE_SERIALIZING)
            .with_phys_bits(39)
    }

    fn zen() -> CpuInfo {
        CpuInfo::new(CpuVendor::Amd, 0x17, 1)
            .with_caps(CpuCaps::SSBD | CpuCaps::AMD_SSBD | CpuCaps::AMD_SSBD_MASK | CpuCaps::AMD_IBPB)
            .with_phys_bits(48)
    }

    fn full_build() -> BuildConfig {
        BuildConfig {
            retpoline: true,
            retpoline_compiler: true,
            seccomp: true,
        }
    }

    #[test]
    fn test_not_vulnerable_gets_nothing() {
        let cpu = skylake();
        let build = full_build();
        for cmd in [SpectreV2Cmd::Auto, SpectreV2Cmd::None] {
            let sel = select_spectre_v2(false, cmd, &cpu, &build);
            assert_eq!(sel.mode, SpectreV2Mitigation::None);
            assert!(!sel.rsb_ctxsw);
        }
        for cmd in [SsbCmd::Auto, SsbCmd::None] {
            assert_eq!(select_ssb(false, cmd, &cpu, &build).mode, SsbMitigation::None);
        }
        let sel = select_l1tf(false, L1tfMitigation::FullForce, &cpu, &[]);
        assert_eq!(sel.mode, L1tfMitigation::Off);
        assert_eq!(sel.smt, SmtPolicy::Keep);
    }

    #[test]
    fn test_force_overrides_not_vulnerable() {
        let sel = select_spectre_v2(false, SpectreV2Cmd::Force, &skylake(), &full_build());
        assert_eq!(sel.mode, SpectreV2Mitigation::RetpolineGeneric);
        let sel = select_ssb(false, SsbCmd::On, &skylake(), &full_build());
        assert_eq!(sel.mode, SsbMitigation::Disable);
    }

    #[test]
    fn test_retpoline_variants() {
        let intel = skylake();
        let full = full_build();
        let minimal = BuildConfig {
            retpoline_compiler: false,
            ..full
        };

        let sel = select_spectre_v2(true, SpectreV2Cmd::Auto, &intel, &full);
        assert_eq!(sel.mode, SpectreV2Mitigation::RetpolineGeneric);
        assert!(sel.rsb_ctxsw);

        let sel = select_spectre_v2(true, SpectreV2Cmd::Auto, &intel, &minimal);
        assert_eq!(sel.mode, SpectreV2Mitigation::RetpolineMinimalGeneric);

        let amd = zen().with_caps(zen().caps | CpuCaps::LFENCE_SERIALIZING);
        let sel = select_spectre_v2(true, SpectreV2Cmd::Auto, &amd, &full);
        assert_eq!(sel.mode, SpectreV2Mitigation::RetpolineAmd);
        let sel = select_spectre_v2(true, SpectreV2Cmd::RetpolineGeneric, &amd, &minimal);
        assert_eq!(sel.mode, SpectreV2Mitigation::RetpolineMinimalGeneric);
    }

    #[test]
    fn test_amd_without_serializing_lfence() {
        let amd = zen();
        let minimal = BuildConfig {
            retpoline_compiler: false,
            ..full_build()
        };

        let sel = select_spectre_v2(true, SpectreV2Cmd::Auto, &amd, &minimal);
        assert_eq!(sel.mode, SpectreV2Mitigation::RetpolineMinimalGeneric);
        assert!(sel.diagnostics.contains(Diagnostics::LFENCE_NOT_SERIALIZING));
        assert!(sel.diagnostics.has_kind(DiagnosticKind::CapabilityUnavailable));

        let sel = select_spectre_v2(true, SpectreV2Cmd::Auto, &amd, &full_build());
        assert_eq!(sel.mode, SpectreV2Mitigation::RetpolineGeneric);
    }

    #[test]
    fn test_amd_request_on_intel_falls_back() {
        let sel = select_spectre_v2(true, SpectreV2Cmd::RetpolineAmd, &skylake(), &full_build());
        assert_eq!(sel.mode, SpectreV2Mitigation::RetpolineGeneric);
        assert!(!sel.mode.is_amd());
        assert!(sel.diagnostics.contains(Diagnostics::RETPOLINE_AMD_NOT_AMD));
        assert!(sel.diagnostics.has_kind(DiagnosticKind::ConfigurationFallback));
    }

    #[test]
    fn test_explicit_retpoline_needs_thunks() {
        let build = BuildConfig::minimal();
        for cmd in [
            SpectreV2Cmd::Retpoline,
            SpectreV2Cmd::RetpolineGeneric,
            SpectreV2Cmd::RetpolineAmd,
        ] {
            let sel = select_spectre_v2(true, cmd, &zen(), &build);
            assert_eq!(sel.mode, SpectreV2Mitigation::None);
            assert!(sel.diagnostics.contains(Diagnostics::RETPOLINE_NOT_BUILT));
        }
        // The automatic choice does not require thunks.
        let sel = select_spectre_v2(true, SpectreV2Cmd::Auto, &skylake(), &build);
        assert_eq!(sel.mode, SpectreV2Mitigation::RetpolineMinimalGeneric);
    }

    #[test]
    fn test_ibrs_defaults() {
        let retp = SpectreV2Mitigation::RetpolineGeneric;

        let state = select_ibrs(&skylake(), false, retp);
        assert_eq!(state, IbrsState { ibrs: true, ibpb: true });

        let state = select_ibrs(&haswell(), false, retp);
        assert_eq!(state, IbrsState { ibrs: false, ibpb: true });

        let state = select_ibrs(&haswell(), false, SpectreV2Mitigation::None);
        assert!(state.ibrs);

        let state = select_ibrs(&skylake(), true, retp);
        assert_eq!(state, IbrsState { ibrs: false, ibpb: false });

        let state = select_ibrs(&zen(), false, SpectreV2Mitigation::RetpolineAmd);
        assert_eq!(state, IbrsState { ibrs: false, ibpb: true });
    }

    #[test]
    fn test_ssb_modes() {
        let cpu = skylake();
        let full = full_build();
        let no_seccomp = BuildConfig {
            seccomp: false,
            ..full
        };

        assert_eq!(select_ssb(true, SsbCmd::Auto, &cpu, &full).mode, SsbMitigation::SeccompAndPrctl);
        assert_eq!(select_ssb(true, SsbCmd::Seccomp, &cpu, &no_seccomp).mode, SsbMitigation::Prctl);
        assert_eq!(select_ssb(true, SsbCmd::Auto, &cpu, &no_seccomp).mode, SsbMitigation::Prctl);
        assert_eq!(select_ssb(true, SsbCmd::Prctl, &cpu, &full).mode, SsbMitigation::Prctl);
        assert_eq!(select_ssb(true, SsbCmd::On, &cpu, &full).mode, SsbMitigation::Disable);
        assert_eq!(select_ssb(true, SsbCmd::None, &cpu, &full).mode, SsbMitigation::None);
    }

    #[test]
    fn test_ssb_without_capability() {
        let cpu = CpuInfo::new(CpuVendor::Intel, 6, intel::HASWELL_CORE);
        let sel = select_ssb(true, SsbCmd::On, &cpu, &full_build());
        assert_eq!(sel.mode, SsbMitigation::None);
        assert_eq!(sel.path, SsbdPath::None);
        assert!(sel.diagnostics.contains(Diagnostics::SSBD_UNAVAILABLE));
    }

    #[test]
    fn test_ssbd_paths() {
        assert_eq!(SsbdPath::for_cpu(&skylake()), SsbdPath::SpecCtrl);
        assert_eq!(SsbdPath::for_cpu(&zen()), SsbdPath::LsCfg);
        let virt_amd = CpuInfo::new(CpuVendor::Amd, 0x17, 1).with_caps(CpuCaps::SSBD);
        assert_eq!(SsbdPath::for_cpu(&virt_amd), SsbdPath::SpecCtrl);
    }

    #[test]
    fn test_ls_cfg_needs_family_bit() {
        let unknown_family = CpuInfo::new(CpuVendor::Amd, 0x19, 1)
            .with_caps(CpuCaps::AMD_SSBD | CpuCaps::AMD_SSBD_MASK);
        assert_eq!(unknown_family.amd_ls_cfg_ssbd_mask(), None);
        assert_eq!(SsbdPath::for_cpu(&unknown_family), SsbdPath::None);

        let sel = select_ssb(true, SsbCmd::On, &unknown_family, &full_build());
        assert_eq!(sel.mode, SsbMitigation::None);
        assert!(sel.diagnostics.contains(Diagnostics::SSBD_UNAVAILABLE));

        let d = MitigationDecision::select(
            &unknown_family,
            &BootOptions::parse("spec_store_bypass_disable=on"),
            &full_build(),
            &[],
            BootRegisters::default(),
        );
        assert_eq!(d.ssb, SsbMitigation::None);
        assert!(d.ls_cfg_base.is_none());
        assert_eq!(d.host_ls_cfg(true), None);

        // The architectural bit still works on such parts.
        let with_spec_ctrl = unknown_family.with_caps(
            CpuCaps::SSBD | CpuCaps::AMD_SSBD | CpuCaps::AMD_SSBD_MASK,
        );
        assert_eq!(SsbdPath::for_cpu(&with_spec_ctrl), SsbdPath::SpecCtrl);
    }

    #[test]
    fn test_kernel_view_adds_ibrs() {
        let d = MitigationDecision::select(
            &skylake(),
            &BootOptions::parse("spec_store_bypass_disable=prctl"),
            &full_build(),
            &[],
            BootRegisters::default(),
        );
        assert!(d.ibrs.ibrs);
        assert_eq!(d.kernel_spec_ctrl(false), SPEC_CTRL_IBRS);
        assert_eq!(d.kernel_spec_ctrl(true), SPEC_CTRL_IBRS | SPEC_CTRL_SSBD);
        assert_eq!(d.host_spec_ctrl(true), SPEC_CTRL_SSBD);

        let off = MitigationDecision::select(
            &skylake(),
            &BootOptions::parse("nospec"),
            &full_build(),
            &[],
            BootRegisters::default(),
        );
        assert_eq!(off.kernel_spec_ctrl(false), 0);
    }

    #[test]
    fn test_l1tf_smt_requests() {
        let cpu = skylake();
        assert_eq!(select_l1tf(true, L1tfMitigation::Flush, &cpu, &[]).smt, SmtPolicy::Keep);
        assert_eq!(select_l1tf(true, L1tfMitigation::FlushNoSmt, &cpu, &[]).smt, SmtPolicy::Disable);
        assert_eq!(select_l1tf(true, L1tfMitigation::Full, &cpu, &[]).smt, SmtPolicy::Disable);
        assert_eq!(
            select_l1tf(true, L1tfMitigation::FullForce, &cpu, &[]).smt,
            SmtPolicy::ForceDisable
        );
    }

    #[test]
    fn test_l1tf_ineffective_keeps_mode() {
        // 39 reported bits, corrected to 44 on Skylake.
        let cpu = skylake();
        let below = [MemoryRegion::ram(0, 64 << 30)];
        let sel = select_l1tf(true, L1tfMitigation::Flush, &cpu, &below);
        assert_eq!(sel.cache_bits, 44);
        assert_eq!(sel.half_pa, 1 << 43);
        assert!(sel.effective);

        let above = [
            MemoryRegion::ram(0, 1 << 30),
            MemoryRegion::ram((1 << 43) - (1 << 20), 2 << 20),
        ];
        let sel = select_l1tf(true, L1tfMitigation::Flush, &cpu, &above);
        assert_eq!(sel.mode, L1tfMitigation::Flush);
        assert!(!sel.effective);
        assert!(sel.diagnostics.has_kind(DiagnosticKind::IneffectiveMitigation));

        let reserved = [MemoryRegion {
            start: 1 << 44,
            size: 1 << 20,
            kind: RegionKind::Reserved,
        }];
        assert!(select_l1tf(true, L1tfMitigation::Flush, &cpu, &reserved).effective);
    }

    #[test]
    fn test_decision_ssb_disable_spec_ctrl() {
        let opts = BootOptions::parse("spec_store_bypass_disable=on");
        let boot = BootRegisters {
            spec_ctrl: 0x100,
            ls_cfg: 0,
        };
        let d = MitigationDecision::select(&skylake(), &opts, &full_build(), &[], boot);
        assert_eq!(d.ssb, SsbMitigation::Disable);
        assert_eq!(d.spec_ctrl_base.value(), 0x100 | SPEC_CTRL_SSBD);
        assert_eq!(d.spec_ctrl_base.allowed(), SPEC_CTRL_IBRS | SPEC_CTRL_SSBD);
        assert_eq!(d.host_spec_ctrl(false), 0x100 | SPEC_CTRL_SSBD);
        assert!(d.ls_cfg_base.is_none());
    }

    #[test]
    fn test_decision_ssb_disable_ls_cfg() {
        let opts = BootOptions::parse("spec_store_bypass_disable=on");
        let boot = BootRegisters {
            spec_ctrl: 0,
            ls_cfg: 0x5,
        };
        let d = MitigationDecision::select(&zen(), &opts, &full_build(), &[], boot);
        assert_eq!(d.ssb, SsbMitigation::Disable);
        assert_eq!(d.ssbd_path, SsbdPath::LsCfg);
        assert_eq!(d.spec_ctrl_base.value(), 0);
        assert_eq!(d.host_ls_cfg(false), Some(0x5 | (1 << 10)));
        assert!(!d.uses_spec_ctrl());
    }

    #[test]
    fn test_decision_prctl_overlay() {
        let d = MitigationDecision::select(
            &skylake(),
            &BootOptions::default(),
            &full_build(),
            &[],
            BootRegisters::default(),
        );
        assert_eq!(d.ssb, SsbMitigation::SeccompAndPrctl);
        assert_eq!(d.host_spec_ctrl(false), 0);
        assert_eq!(d.host_spec_ctrl(true), SPEC_CTRL_SSBD);
        assert!(d.rsb_ctxsw);
        assert_eq!(d.l1tf.mode, L1tfMitigation::Flush);
    }

    #[test]
    fn test_decision_kill_switch() {
        let opts = BootOptions::parse("mitigations=off spectre_v2=on");
        let d = MitigationDecision::select(&skylake(), &opts, &full_build(), &[], BootRegisters::default());
        assert_eq!(d.spectre_v2, SpectreV2Mitigation::None);
        assert_eq!(d.ssb, SsbMitigation::None);
        assert_eq!(d.l1tf.mode, L1tfMitigation::Off);
        assert_eq!(d.ibrs, IbrsState { ibrs: false, ibpb: false });
        assert!(!d.rsb_ctxsw);
    }

    #[test]
    fn test_decision_collects_diagnostics() {
        let opts = BootOptions::parse("spectre_v2=retpoline,amd spec_store_bypass_disable=bogus");
        let memory = [MemoryRegion::ram(0, 1 << 45)];
        let d = MitigationDecision::select(&skylake(), &opts, &full_build(), &memory, BootRegisters::default());
        assert!(d.diagnostics.contains(
            Diagnostics::RETPOLINE_AMD_NOT_AMD
                | Diagnostics::SSB_UNKNOWN_OPTION
                | Diagnostics::L1TF_INEFFECTIVE
        ));
        assert_eq!(d.spectre_v2, SpectreV2Mitigation::RetpolineGeneric);
    }
}
