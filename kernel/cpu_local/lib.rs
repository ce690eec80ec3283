//! Minimal per-CPU storage for SMP support
//!
//! Provides a per-CPU storage abstraction using CPU ID indexed arrays and an
//! online CPU mask used by code that has to reach every running processor
//! (speculation control resync, shootdowns).
//!
//! The logical CPU index of the running processor comes from a source
//! registered by the architecture code during bring-up (LAPIC ID lookup on
//! x86_64). Until one is registered every caller is treated as CPU 0, which
//! is correct during early boot when only the BSP runs.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cpu_local::{current_cpu_id, CpuLocal};
//! use core::sync::atomic::AtomicU64;
//!
//! static LOADED: CpuLocal<AtomicU64> = CpuLocal::new(|| AtomicU64::new(0));
//!
//! LOADED.with_cpu(current_cpu_id(), |v| v.store(1, Ordering::Relaxed));
//! ```

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Once, RwLock};

/// Maximum number of CPUs supported
const MAX_CPUS: usize = 64;

/// Logical CPU index (0 = BSP, 1+ = APs).
pub type CpuId = usize;

/// Per-CPU storage wrapper
///
/// Stores one instance of T per CPU, lazily initialized on first access.
/// Safe to use from interrupt context as long as T's operations are safe.
pub struct CpuLocal<T> {
    /// Initialization function for each CPU's slot
    init: fn() -> T,
    /// Array of per-CPU slots, initialized lazily
    slots: Once<[T; MAX_CPUS]>,
}

impl<T> CpuLocal<T> {
    /// Create a new per-CPU storage with the given initializer
    ///
    /// The initializer is called once per CPU slot on first access.
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            init,
            slots: Once::new(),
        }
    }

    fn get_slots(&self) -> &[T; MAX_CPUS] {
        self.slots
            .call_once(|| core::array::from_fn(|_| (self.init)()))
    }

    /// Access a specific CPU's slot.
    ///
    /// Used for cross-CPU operations. Only sound for `T` that supports
    /// concurrent access.
    ///
    /// Returns None if cpu_id is out of range (>= MAX_CPUS).
    #[inline]
    pub fn with_cpu<R>(&self, cpu_id: CpuId, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.get_cpu(cpu_id).map(f)
    }

    /// Get a reference to a specific CPU's slot.
    ///
    /// For a `static CpuLocal` the returned reference is `'static`.
    #[inline]
    pub fn get_cpu(&self, cpu_id: CpuId) -> Option<&T> {
        self.get_slots().get(cpu_id)
    }
}

// ============================================================================
// Current CPU identification
// ============================================================================

/// Function returning the logical index of the executing CPU.
pub type CpuIdSource = fn() -> CpuId;

static CPU_ID_SOURCE: RwLock<Option<CpuIdSource>> = RwLock::new(None);

/// Register the function used by [`current_cpu_id`].
///
/// Called once by the architecture code after the LAPIC ID mapping is set
/// up. Must be installed before any AP starts executing kernel code.
pub fn register_cpu_id_source(source: CpuIdSource) {
    *CPU_ID_SOURCE.write() = Some(source);
}

/// Get the current CPU ID.
///
/// Falls back to CPU 0 before a source is registered (early boot, BSP only).
#[inline]
pub fn current_cpu_id() -> CpuId {
    match *CPU_ID_SOURCE.read() {
        Some(source) => source(),
        None => 0,
    }
}

/// Get the maximum number of supported CPUs
pub const fn max_cpus() -> usize {
    MAX_CPUS
}

// ============================================================================
// Online CPU mask
// ============================================================================

/// Set of logical CPUs, one bit per CPU index.
///
/// Updates are single atomic RMW operations, so bring-up of one CPU never
/// races with the teardown of another.
pub struct CpuMask {
    bits: AtomicU64,
}

impl CpuMask {
    /// Empty mask.
    pub const fn new() -> Self {
        Self {
            bits: AtomicU64::new(0),
        }
    }

    /// Add a CPU. Returns false if it was already present.
    pub fn insert(&self, cpu_id: CpuId) -> bool {
        assert!(cpu_id < MAX_CPUS, "CPU ID {} out of range", cpu_id);
        let bit = 1u64 << cpu_id;
        self.bits.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Remove a CPU. Returns false if it was not present.
    pub fn remove(&self, cpu_id: CpuId) -> bool {
        if cpu_id >= MAX_CPUS {
            return false;
        }
        let bit = 1u64 << cpu_id;
        self.bits.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    #[inline]
    pub fn contains(&self, cpu_id: CpuId) -> bool {
        cpu_id < MAX_CPUS && self.bits.load(Ordering::Acquire) & (1u64 << cpu_id) != 0
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.bits.load(Ordering::Acquire).count_ones() as usize
    }

    /// Iterate over a snapshot of the members, lowest index first.
    pub fn iter(&self) -> CpuMaskIter {
        CpuMaskIter {
            remaining: self.bits.load(Ordering::Acquire),
        }
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over a [`CpuMask`] snapshot.
pub struct CpuMaskIter {
    remaining: u64,
}

impl Iterator for CpuMaskIter {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        if self.remaining == 0 {
            return None;
        }
        let cpu = self.remaining.trailing_zeros() as CpuId;
        self.remaining &= self.remaining - 1;
        Some(cpu)
    }
}
