//! Per-thread sampling state and the re-entrancy guard around it.
//!
//! Counters are plain `Cell`s in a const-initialised thread local: reaching
//! them never allocates, so they are safe to touch from inside the
//! interposed allocator itself. The only synchronisation is the process-wide
//! enable gate, flipped off while the lifecycle code rebuilds global state.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide gate. Recording stays off from library load until
/// initialisation completes, during teardown, and while a forked child
/// rebuilds its state.
static RECORDING_ENABLED: AtomicBool = AtomicBool::new(false);

pub(crate) fn set_recording(enabled: bool) {
    RECORDING_ENABLED.store(enabled, Ordering::Release);
}

/// One thread's sampling accumulators.
///
/// All byte counters are 32-bit and wrap, like the accumulators in the
/// supervisor's own tooling that consume them.
pub(crate) struct ThreadCounters {
    /// Re-entrancy guard; false while this thread is inside the record path.
    should_record: Cell<bool>,
    pub(crate) malloc_triggered: Cell<u32>,
    pub(crate) free_triggered: Cell<u32>,
    pub(crate) memcpy_triggered: Cell<u32>,
    pub(crate) host_alloc_bytes: Cell<u32>,
    pub(crate) foreign_alloc_bytes: Cell<u32>,
    pub(crate) malloc_sample: Cell<u32>,
    pub(crate) free_sample: Cell<u32>,
    pub(crate) memcpy_sample: Cell<u32>,
    pub(crate) call_stack_sample: Cell<u32>,
}

impl ThreadCounters {
    pub(crate) const fn new() -> ThreadCounters {
        ThreadCounters {
            should_record: Cell::new(true),
            malloc_triggered: Cell::new(0),
            free_triggered: Cell::new(0),
            memcpy_triggered: Cell::new(0),
            host_alloc_bytes: Cell::new(0),
            foreign_alloc_bytes: Cell::new(0),
            malloc_sample: Cell::new(0),
            free_sample: Cell::new(0),
            memcpy_sample: Cell::new(0),
            call_stack_sample: Cell::new(0),
        }
    }

    /// Add `bytes` to `counter`, wrapping on overflow.
    pub(crate) fn accumulate(counter: &Cell<u32>, bytes: u32) {
        counter.set(counter.get().wrapping_add(bytes));
    }

    /// Zero every accumulator. Used in the forked child's surviving thread.
    pub(crate) fn reset(&self) {
        self.malloc_triggered.set(0);
        self.free_triggered.set(0);
        self.memcpy_triggered.set(0);
        self.host_alloc_bytes.set(0);
        self.foreign_alloc_bytes.set(0);
        self.malloc_sample.set(0);
        self.free_sample.set(0);
        self.memcpy_sample.set(0);
        self.call_stack_sample.set(0);
    }
}

std::thread_local! {
    // Const-initialised and Drop-free: first access from inside an
    // interposed allocation must not itself allocate or register a
    // destructor.
    static COUNTERS: ThreadCounters = const { ThreadCounters::new() };
}

/// Run `f` over the calling thread's counters with the re-entrancy guard
/// held.
///
/// Returns `None` — without running `f` — when recording is globally
/// disabled, when this thread is already inside the record path, or when the
/// thread's storage is being torn down. The guard is released on every exit
/// path, including unwinds out of `f`.
pub(crate) fn with_recording<R>(f: impl FnOnce(&ThreadCounters) -> R) -> Option<R> {
    if !RECORDING_ENABLED.load(Ordering::Acquire) {
        return None;
    }

    COUNTERS
        .try_with(|counters| {
            if !counters.should_record.replace(false) {
                return None;
            }
            let _restore = RestoreOnExit(counters);
            Some(f(counters))
        })
        .ok()
        .flatten()
}

struct RestoreOnExit<'a>(&'a ThreadCounters);

impl Drop for RestoreOnExit<'_> {
    fn drop(&mut self) {
        self.0.should_record.set(true);
    }
}

/// Read the calling thread's counters without taking the guard.
pub(crate) fn peek<R>(f: impl FnOnce(&ThreadCounters) -> R) -> Option<R> {
    COUNTERS.try_with(|counters| f(counters)).ok()
}

/// Zero the calling thread's counters (the forked child's first act).
pub(crate) fn reset_current_thread() {
    let _ = COUNTERS.try_with(ThreadCounters::reset);
}
