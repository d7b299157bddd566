//! Compile-time tuning constants.
//!
//! Everything here is fixed at build time. The sampling rates trade
//! precision for overhead: a sample is published only once per threshold's
//! worth of bytes, so the record path is almost always a couple of counter
//! additions. The copy rate is a prime a little above twice the malloc rate
//! so the two sampling phases do not lock step on workloads that copy what
//! they allocate.

use libc::c_int;

/// Bytes of recorded allocation between published malloc samples.
pub const MALLOC_SAMPLING_RATE: u32 = 1_048_549; // ~= 1 MiB

/// Bytes of recorded deallocation between published free samples.
pub const FREE_SAMPLING_RATE: u32 = 1_048_549; // ~= 1 MiB

/// Bytes of recorded copying between published copy samples.
///
/// Next prime after `MALLOC_SAMPLING_RATE * 2 + 1`.
pub const MEMCPY_SAMPLING_RATE: u32 = 2_097_131;

/// Bytes of recorded allocation between call-stack inspections.
///
/// Stacks are walked far less often than samples are published.
pub const CALL_STACK_SAMPLING_RATE: u32 = MALLOC_SAMPLING_RATE * 10;

/// Number of stack frames the classifier inspects per walk.
pub const CALL_STACK_INSPECTION_DEPTH: usize = 10;

/// Signal raised after publishing a malloc sample.
pub const MALLOC_SIGNAL: c_int = libc::SIGXCPU;

/// Signal raised after publishing a free sample.
pub const FREE_SIGNAL: c_int = libc::SIGXFSZ;

/// Signal raised after publishing a copy sample.
pub const MEMCPY_SIGNAL: c_int = libc::SIGPROF;

/// Size each signal file is created with, in bytes.
pub const INITIAL_SIGNAL_FILE_SIZE: u64 = 1000;

/// Remaining-headroom threshold below which a signal file doubles.
pub const SIGNAL_FILE_LOW_WATER: usize = 500;

/// Path prefix for the per-process signal files.
///
/// The full paths are `<prefix>-malloc-signal<pid>` and
/// `<prefix>-memcpy-signal<pid>`; the supervisor composes the same names.
pub const SIGNAL_FILE_PREFIX: &str = "/tmp/heapsig";

/// Symbol-name fragments marking a stack frame as foreign-originated.
///
/// Matched case-insensitively against the dynamic symbol each inspected
/// frame resolves to. An allocation whose stack contains any marker is
/// attributed to native-library code rather than to the host interpreter;
/// the default marker is the FFI trampoline the host uses to call out.
pub const FOREIGN_SYMBOL_MARKERS: &[&str] = &["zif_ffi_trampoline"];
