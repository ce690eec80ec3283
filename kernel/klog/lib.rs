//! Zero-OS kernel logging (`klog`).
//!
//! Profile-aware logging macros used by the speculation control code. The
//! crate owns no output device: the boot path registers a sink (serial
//! console, VGA, ring buffer) with [`register_sink`], and every macro routes
//! its formatted arguments there.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Profile-aware | Use case |
//! |-------|--------------|---------------|----------|
//! | [`kprintln!`] | Compiled out | No | Debug diagnostics |
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | Secure-gated | Boot banners, status messages |
//! | [`klog_force!`] | Active | No | Critical errors |
//!
//! # Hardening Profile Integration
//!
//! Log filtering is **runtime** and derived from the active hardening
//! profile. The boot path calls [`set_profile`] before the first message:
//!
//! - **Secure** : no output
//! - **Balanced**: `Error` + `Warn` only
//! - **Performance**: all levels
//!
//! The hot path is a single `Relaxed` atomic load + integer compare.

#![cfg_attr(not(test), no_std)]

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::RwLock;

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Level::Trace`]) to most severe
/// ([`Level::Error`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness or security.
    Error = 4,
}

// ============================================================================
// Profile Filter
// ============================================================================

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level. Messages with `level >= LOG_MIN_LEVEL` are emitted.
/// Initialised to DISABLED; the boot path must call [`set_profile`].
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(LEVEL_DISABLED);

/// Runtime gate for [`klog_always!`]. Fail-closed until [`set_profile`].
static LOG_ALWAYS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Hardening profile identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KlogProfile {
    /// Maximum security, no klog output.
    Secure = 0,
    /// Balanced: errors and warnings only.
    Balanced = 1,
    /// Performance/debug: all levels.
    Performance = 2,
}

impl KlogProfile {
    /// Parse a profile name as accepted on the kernel command line.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "secure" => Some(Self::Secure),
            "balanced" => Some(Self::Balanced),
            "performance" | "perf" => Some(Self::Performance),
            _ => None,
        }
    }
}

/// Set the klog filter from a profile.
///
/// Safe to call again if the profile changes at runtime. Secure profile
/// also suppresses [`klog_always!`]; use [`klog_force!`] for output that
/// must appear regardless of profile.
#[inline]
pub fn set_profile(profile: KlogProfile) {
    let min = match profile {
        KlogProfile::Secure => LEVEL_DISABLED,
        KlogProfile::Balanced => Level::Warn as u8,
        KlogProfile::Performance => Level::Trace as u8,
    };
    LOG_MIN_LEVEL.store(min, Ordering::Release);
    LOG_ALWAYS_ENABLED.store(profile != KlogProfile::Secure, Ordering::Release);
}

/// Disable all klog output. Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_always_enabled() -> bool {
    LOG_ALWAYS_ENABLED.load(Ordering::Relaxed)
}

// ============================================================================
// Output Sink
// ============================================================================

/// Output function installed by the console driver.
pub type KlogSink = fn(fmt::Arguments);

/// Registered sink; messages are dropped until one is installed.
static SINK: RwLock<Option<KlogSink>> = RwLock::new(None);

/// Install the output sink. Replaces any previously registered sink.
pub fn register_sink(sink: KlogSink) {
    *SINK.write() = Some(sink);
}

/// Remove the output sink (e.g. when the console is torn down).
pub fn unregister_sink() {
    *SINK.write() = None;
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_print(args: fmt::Arguments) {
    if let Some(sink) = *SINK.read() {
        sink(args);
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Emit one line through the sink.
#[doc(hidden)]
#[inline]
pub fn _klog_line(args: fmt::Arguments) {
    _klog_print(format_args!("{}\n", args));
}

/// Profile-gated kernel output (boot banners, status messages).
///
/// Suppressed in [`KlogProfile::Secure`].
#[macro_export]
macro_rules! klog_always {
    () => {
        $crate::klog_always!("")
    };
    ($($arg:tt)+) => {{
        if $crate::_klog_always_enabled() {
            $crate::_klog_line(format_args!($($arg)+));
        }
    }};
}

/// Unconditional kernel output, never suppressed by any profile.
#[macro_export]
macro_rules! klog_force {
    () => {
        $crate::klog_force!("")
    };
    ($($arg:tt)+) => {
        $crate::_klog_line(format_args!($($arg)+))
    };
}

/// Debug-only kernel print. Fully compiled out in release builds.
#[macro_export]
macro_rules! kprintln {
    ($($arg:tt)*) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)*);
    }};
}

/// Profile-aware kernel logging.
///
/// `Debug` and `Trace` levels are additionally compiled out in release
/// builds.
///
/// ```ignore
/// klog!(Warn, "Spectre V2 mitigation: LFENCE not serializing");
/// klog!(Info, "SMP: {} CPUs online", count);
/// ```
#[macro_export]
macro_rules! klog {
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::_klog_at!(Debug, $($arg)+);
    }};
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::_klog_at!(Trace, $($arg)+);
    }};
    ($level:ident, $($arg:tt)+) => {
        $crate::_klog_at!($level, $($arg)+)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! _klog_at {
    ($level:ident, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::$level) {
            $crate::_klog_line(format_args!($($arg)+));
        }
    }};
}
