//! Per-processor enforcement of the mitigation decision.
//!
//! Every CPU keeps a cache of the control register values it last loaded.
//! All paths funnel into one routine that computes the effective value for
//! the running task and writes it only when it differs from the cache, so
//! the common context switch between tasks with equal policy costs no MSR
//! write. A CPU coming online starts with an invalid cache and therefore
//! always writes once.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cpu_local::{CpuId, CpuLocal, CpuMask};
use klog::klog;

use crate::ctrl::{ControlRegister, ControlRegisters, PRED_CMD_IBPB};
use crate::error::SpecCtrlError;
use crate::select::MitigationDecision;
use crate::task::TaskSpecPolicy;

/// Cache value meaning "nothing loaded yet".
const NOT_LOADED: u64 = u64::MAX;

/// Runs a function on another processor and waits for it to finish.
///
/// Implemented by the IPI layer. The function receives the target CPU id.
pub trait CrossCall {
    fn call_on(&self, cpu: CpuId, f: &(dyn Fn(CpuId) + Sync));
}

/// Enforcement state of one processor.
struct CpuSpecState {
    spec_ctrl: AtomicU64,
    ls_cfg: AtomicU64,
    /// SSBD state of the task running on this CPU.
    task_ssbd: AtomicBool,
    /// Between kernel entry and the return to user mode.
    in_kernel: AtomicBool,
    in_guest: AtomicBool,
}

impl CpuSpecState {
    fn new() -> Self {
        CpuSpecState {
            spec_ctrl: AtomicU64::new(NOT_LOADED),
            ls_cfg: AtomicU64::new(NOT_LOADED),
            task_ssbd: AtomicBool::new(false),
            in_kernel: AtomicBool::new(false),
            in_guest: AtomicBool::new(false),
        }
    }

    fn invalidate(&self) {
        self.spec_ctrl.store(NOT_LOADED, Ordering::Relaxed);
        self.ls_cfg.store(NOT_LOADED, Ordering::Relaxed);
    }
}

/// Applies a [`MitigationDecision`] to every processor.
pub struct Enforcer<R: ControlRegisters> {
    decision: MitigationDecision,
    regs: R,
    cpus: CpuLocal<CpuSpecState>,
    online: CpuMask,
}

impl<R: ControlRegisters> Enforcer<R> {
    pub fn new(decision: MitigationDecision, regs: R) -> Self {
        Enforcer {
            decision,
            regs,
            cpus: CpuLocal::new(CpuSpecState::new),
            online: CpuMask::new(),
        }
    }

    #[inline]
    pub fn decision(&self) -> &MitigationDecision {
        &self.decision
    }

    #[inline]
    pub fn registers(&self) -> &R {
        &self.regs
    }

    /// CPUs with enforcement active.
    #[inline]
    pub fn online(&self) -> &CpuMask {
        &self.online
    }

    /// Bring `cpu` under enforcement. Runs on `cpu` at start-up or hot-add.
    pub fn init_cpu(&self, cpu: CpuId) {
        let Some(state) = self.cpus.get_cpu(cpu) else {
            klog!(Error, "spec_ctrl: CPU {} beyond per-CPU capacity", cpu);
            return;
        };
        state.invalidate();
        state.task_ssbd.store(false, Ordering::Relaxed);
        state.in_kernel.store(false, Ordering::Relaxed);
        state.in_guest.store(false, Ordering::Relaxed);
        self.online.insert(cpu);
        self.load(cpu, state);
        klog!(Debug, "spec_ctrl: CPU {} speculation control loaded", cpu);
    }

    /// Drop `cpu` from enforcement when it goes offline.
    pub fn cpu_offline(&self, cpu: CpuId) {
        self.online.remove(cpu);
        if let Some(state) = self.cpus.get_cpu(cpu) {
            state.invalidate();
        }
    }

    /// Scheduling transition on `cpu` to `next`.
    pub fn switch_to(&self, cpu: CpuId, next: &TaskSpecPolicy) {
        self.update_current(cpu, next);
    }

    /// Re-evaluate `cpu` after the running task's policy changed.
    pub fn update_current(&self, cpu: CpuId, task: &TaskSpecPolicy) {
        if let Some(state) = self.cpus.get_cpu(cpu) {
            state.task_ssbd.store(task.ssbd(), Ordering::Relaxed);
            self.load(cpu, state);
        }
    }

    /// Kernel entry on `cpu`: restrict indirect branch speculation.
    ///
    /// IBRS stays set across context switches until [`exit_kernel`].
    /// Without IBRS selected this is a no-op.
    ///
    /// [`exit_kernel`]: Self::exit_kernel
    pub fn enter_kernel(&self, cpu: CpuId) {
        self.set_kernel_mode(cpu, true);
    }

    /// Return to user mode on `cpu`: drop IBRS again.
    pub fn exit_kernel(&self, cpu: CpuId) {
        self.set_kernel_mode(cpu, false);
    }

    fn set_kernel_mode(&self, cpu: CpuId, in_kernel: bool) {
        if !self.decision.ibrs.ibrs {
            return;
        }
        if let Some(state) = self.cpus.get_cpu(cpu) {
            state.in_kernel.store(in_kernel, Ordering::Relaxed);
            if !state.in_guest.load(Ordering::Relaxed) {
                self.load(cpu, state);
            }
        }
    }

    /// Load the guest's SPEC_CTRL view before entering a guest on `cpu`.
    pub fn enter_guest(&self, cpu: CpuId, guest_spec_ctrl: u64) {
        if !self.decision.uses_spec_ctrl() {
            return;
        }
        let Some(state) = self.cpus.get_cpu(cpu) else {
            return;
        };
        let host = self.host_spec_ctrl(state);
        if host != guest_spec_ctrl {
            self.regs.write(ControlRegister::SpecCtrl, guest_spec_ctrl);
        }
        state.spec_ctrl.store(guest_spec_ctrl, Ordering::Relaxed);
        state.in_guest.store(true, Ordering::Relaxed);
    }

    /// Restore the host SPEC_CTRL view after a guest exit on `cpu`.
    pub fn exit_guest(&self, cpu: CpuId, guest_spec_ctrl: u64) {
        if !self.decision.uses_spec_ctrl() {
            return;
        }
        let Some(state) = self.cpus.get_cpu(cpu) else {
            return;
        };
        let host = self.host_spec_ctrl(state);
        if host != guest_spec_ctrl {
            self.regs.write(ControlRegister::SpecCtrl, host);
        }
        state.spec_ctrl.store(host, Ordering::Relaxed);
        state.in_guest.store(false, Ordering::Relaxed);
    }

    /// Host SPEC_CTRL value for the task running on `cpu`.
    pub fn host_default(&self, cpu: CpuId) -> Option<u64> {
        self.cpus.get_cpu(cpu).map(|state| self.host_spec_ctrl(state))
    }

    /// Load `base | overlay` into SPEC_CTRL on `cpu`.
    ///
    /// Overlays carrying bits outside the modifiable mask are refused and
    /// nothing is written.
    pub fn write_overlay(&self, cpu: CpuId, overlay: u64) -> Result<u64, SpecCtrlError> {
        let value = match self.decision.spec_ctrl_base.effective(overlay) {
            Ok(value) => value,
            Err(e) => {
                klog!(Warn, "spec_ctrl: {}", e);
                return Err(e);
            }
        };
        if let Some(state) = self.cpus.get_cpu(cpu) {
            if state.spec_ctrl.swap(value, Ordering::Relaxed) != value {
                self.regs.write(ControlRegister::SpecCtrl, value);
            }
        }
        Ok(value)
    }

    /// Indirect branch predictor barrier, when IBPB is in use.
    #[inline]
    pub fn predictor_barrier(&self) {
        if self.decision.ibrs.ibpb {
            self.regs.write(ControlRegister::PredCmd, PRED_CMD_IBPB);
        }
    }

    /// Reload every online CPU from the decision.
    ///
    /// Runs synchronously on each CPU through `xcall`; returns once all of
    /// them have reloaded.
    pub fn resync_all(&self, xcall: &dyn CrossCall) {
        let reload = |cpu: CpuId| {
            if let Some(state) = self.cpus.get_cpu(cpu) {
                state.invalidate();
                if !state.in_guest.load(Ordering::Relaxed) {
                    self.load(cpu, state);
                }
            }
        };
        for cpu in self.online.iter() {
            xcall.call_on(cpu, &reload);
        }
    }

    /// Whether `cpu` is between guest entry and exit.
    pub fn in_guest(&self, cpu: CpuId) -> bool {
        self.cpus
            .get_cpu(cpu)
            .is_some_and(|state| state.in_guest.load(Ordering::Relaxed))
    }

    /// Last SPEC_CTRL value loaded on `cpu`.
    pub fn loaded_spec_ctrl(&self, cpu: CpuId) -> Option<u64> {
        self.cpus
            .get_cpu(cpu)
            .map(|state| state.spec_ctrl.load(Ordering::Relaxed))
            .filter(|value| *value != NOT_LOADED)
    }

    fn host_spec_ctrl(&self, state: &CpuSpecState) -> u64 {
        let task_ssbd = state.task_ssbd.load(Ordering::Relaxed);
        if state.in_kernel.load(Ordering::Relaxed) {
            self.decision.kernel_spec_ctrl(task_ssbd)
        } else {
            self.decision.host_spec_ctrl(task_ssbd)
        }
    }

    fn load(&self, cpu: CpuId, state: &CpuSpecState) {
        let task_ssbd = state.task_ssbd.load(Ordering::Relaxed);

        if self.decision.uses_spec_ctrl() {
            let value = self.host_spec_ctrl(state);
            if state.spec_ctrl.swap(value, Ordering::Relaxed) != value {
                self.regs.write(ControlRegister::SpecCtrl, value);
                klog!(Trace, "spec_ctrl: CPU {} SPEC_CTRL <- {:#x}", cpu, value);
            }
        }

        if let Some(value) = self.decision.host_ls_cfg(task_ssbd) {
            if state.ls_cfg.swap(value, Ordering::Relaxed) != value {
                self.regs.write(ControlRegister::AmdLsCfg, value);
                klog!(Trace, "spec_ctrl: CPU {} LS_CFG <- {:#x}", cpu, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdline::BootOptions;
    use crate::config::BuildConfig;
    use crate::cpu::{intel, CpuCaps, CpuInfo, CpuVendor};
    use crate::ctrl::testing::RecordingRegisters;
    use crate::ctrl::SPEC_CTRL_SSBD;
    use crate::select::BootRegisters;
    use crate::task::SpecRequest;

    fn intel_enforcer(cmdline: &str) -> Enforcer<RecordingRegisters> {
        let cpu = CpuInfo::new(CpuVendor::Intel, 6, intel::SKYLAKE_DESKTOP)
            .with_caps(CpuCaps::SPEC_CTRL | CpuCaps::SSBD | CpuCaps::LFENCE_SERIALIZING)
            .with_phys_bits(46);
        let decision = MitigationDecision::select(
            &cpu,
            &BootOptions::parse(cmdline),
            &BuildConfig::default(),
            &[],
            BootRegisters::default(),
        );
        Enforcer::new(decision, RecordingRegisters::new())
    }

    /// Runs the function inline, recording the target CPUs.
    struct InlineCall {
        targets: std::sync::Mutex<Vec<CpuId>>,
    }

    impl CrossCall for InlineCall {
        fn call_on(&self, cpu: CpuId, f: &(dyn Fn(CpuId) + Sync)) {
            self.targets.lock().unwrap().push(cpu);
            f(cpu);
        }
    }

    #[test]
    fn test_first_write_always_happens() {
        let enf = intel_enforcer("spec_store_bypass_disable=prctl");
        enf.init_cpu(0);
        assert_eq!(enf.registers().take(), vec![(ControlRegister::SpecCtrl, 0)]);
        assert_eq!(enf.loaded_spec_ctrl(0), Some(0));
        assert!(enf.online().contains(0));
    }

    #[test]
    fn test_switch_writes_only_on_change() {
        let enf = intel_enforcer("spec_store_bypass_disable=prctl");
        enf.init_cpu(1);
        enf.registers().take();

        let plain = TaskSpecPolicy::new();
        let sandboxed = TaskSpecPolicy::new();
        sandboxed.transition(SpecRequest::Disable).unwrap();

        enf.switch_to(1, &plain);
        assert!(enf.registers().take().is_empty());

        enf.switch_to(1, &sandboxed);
        enf.switch_to(1, &sandboxed);
        assert_eq!(
            enf.registers().take(),
            vec![(ControlRegister::SpecCtrl, SPEC_CTRL_SSBD)]
        );

        enf.switch_to(1, &plain);
        assert_eq!(enf.registers().take(), vec![(ControlRegister::SpecCtrl, 0)]);
    }

    #[test]
    fn test_guest_round_trip() {
        let enf = intel_enforcer("spec_store_bypass_disable=on");
        enf.init_cpu(0);
        enf.registers().take();
        assert_eq!(enf.host_default(0), Some(SPEC_CTRL_SSBD));

        // Guest view equal to host: no writes either way.
        enf.enter_guest(0, SPEC_CTRL_SSBD);
        enf.exit_guest(0, SPEC_CTRL_SSBD);
        assert!(enf.registers().take().is_empty());

        enf.enter_guest(0, 0);
        assert!(enf.in_guest(0));
        enf.exit_guest(0, 0);
        assert!(!enf.in_guest(0));
        assert_eq!(
            enf.registers().take(),
            vec![
                (ControlRegister::SpecCtrl, 0),
                (ControlRegister::SpecCtrl, SPEC_CTRL_SSBD)
            ]
        );
        assert_eq!(enf.loaded_spec_ctrl(0), Some(SPEC_CTRL_SSBD));
    }

    #[test]
    fn test_predictor_barrier() {
        let enf = intel_enforcer("");
        enf.predictor_barrier();
        assert_eq!(enf.registers().take(), vec![(ControlRegister::PredCmd, PRED_CMD_IBPB)]);

        let enf = intel_enforcer("nospec");
        enf.predictor_barrier();
        assert!(enf.registers().take().is_empty());
    }

    #[test]
    fn test_resync_reaches_online_cpus() {
        let enf = intel_enforcer("");
        enf.init_cpu(0);
        enf.init_cpu(2);
        enf.init_cpu(3);
        enf.cpu_offline(3);
        enf.registers().take();

        let xcall = InlineCall {
            targets: std::sync::Mutex::new(Vec::new()),
        };
        enf.resync_all(&xcall);
        assert_eq!(*xcall.targets.lock().unwrap(), vec![0, 2]);
        assert_eq!(enf.registers().take().len(), 2);
        assert_eq!(enf.loaded_spec_ctrl(3), None);
    }

    #[test]
    fn test_overlay_outside_mask_refused() {
        let enf = intel_enforcer("spec_store_bypass_disable=prctl");
        enf.init_cpu(0);
        enf.registers().take();

        assert_eq!(enf.write_overlay(0, SPEC_CTRL_SSBD), Ok(SPEC_CTRL_SSBD));
        assert_eq!(
            enf.registers().take(),
            vec![(ControlRegister::SpecCtrl, SPEC_CTRL_SSBD)]
        );

        // STIBP is never modifiable.
        assert_eq!(
            enf.write_overlay(0, crate::ctrl::SPEC_CTRL_STIBP),
            Err(SpecCtrlError::UnknownBits(crate::ctrl::SPEC_CTRL_STIBP))
        );
        assert!(enf.registers().take().is_empty());
        assert_eq!(enf.loaded_spec_ctrl(0), Some(SPEC_CTRL_SSBD));
    }

    #[test]
    fn test_ibrs_held_in_kernel_across_switch() {
        use crate::ctrl::SPEC_CTRL_IBRS;

        let enf = intel_enforcer("spec_store_bypass_disable=prctl");
        assert!(enf.decision().ibrs.ibrs);
        enf.init_cpu(0);
        enf.registers().take();

        enf.enter_kernel(0);
        assert_eq!(enf.registers().take(), vec![(ControlRegister::SpecCtrl, SPEC_CTRL_IBRS)]);

        let sandboxed = TaskSpecPolicy::new();
        sandboxed.transition(SpecRequest::Disable).unwrap();
        enf.switch_to(0, &sandboxed);
        assert_eq!(
            enf.registers().take(),
            vec![(ControlRegister::SpecCtrl, SPEC_CTRL_IBRS | SPEC_CTRL_SSBD)]
        );
        assert_eq!(enf.host_default(0), Some(SPEC_CTRL_IBRS | SPEC_CTRL_SSBD));

        enf.exit_kernel(0);
        assert_eq!(enf.registers().take(), vec![(ControlRegister::SpecCtrl, SPEC_CTRL_SSBD)]);
        assert_eq!(enf.loaded_spec_ctrl(0), Some(SPEC_CTRL_SSBD));
    }

    #[test]
    fn test_kernel_hooks_idle_without_ibrs() {
        let enf = intel_enforcer("nospec");
        assert!(!enf.decision().ibrs.ibrs);
        enf.init_cpu(0);
        enf.registers().take();

        enf.enter_kernel(0);
        enf.switch_to(0, &TaskSpecPolicy::new());
        enf.exit_kernel(0);
        assert!(enf.registers().take().is_empty());
    }

    #[test]
    fn test_amd_ls_cfg_path() {
        let cpu = CpuInfo::new(CpuVendor::Amd, 0x15, 2)
            .with_caps(CpuCaps::SSBD | CpuCaps::AMD_SSBD | CpuCaps::AMD_SSBD_MASK);
        let decision = MitigationDecision::select(
            &cpu,
            &BootOptions::parse("spec_store_bypass_disable=prctl"),
            &BuildConfig::default(),
            &[],
            BootRegisters {
                spec_ctrl: 0,
                ls_cfg: 0x3,
            },
        );
        let enf = Enforcer::new(decision, RecordingRegisters::new());
        enf.init_cpu(0);
        assert_eq!(enf.registers().take(), vec![(ControlRegister::AmdLsCfg, 0x3)]);

        let task = TaskSpecPolicy::new();
        task.transition(SpecRequest::Disable).unwrap();
        enf.update_current(0, &task);
        assert_eq!(
            enf.registers().take(),
            vec![(ControlRegister::AmdLsCfg, 0x3 | (1 << 54))]
        );

        // No SPEC_CTRL on this part: guest hooks are no-ops.
        enf.enter_guest(0, 0);
        assert!(enf.registers().take().is_empty());
    }
}
