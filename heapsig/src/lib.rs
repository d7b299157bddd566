//! The sampling core of an in-process memory profiler for Linux.
//!
//! `heapsig` is the part of a sampling memory profiler that lives *inside*
//! the profiled process. It is fed by interposed allocator and copy entry
//! points (see the companion `heapsig-preload` crate), keeps cheap per-thread
//! byte counters, and — whenever a counter crosses its sampling threshold —
//! appends a text record to a memory-mapped per-process *signal file* and
//! raises a POSIX signal so that a co-resident supervisor process knows new
//! data is available.
//!
//! The crate deliberately contains no supervisor, no aggregation, and no
//! reporting: its whole job is to stay out of the allocator hot path and to
//! publish coarse samples safely from arbitrary threads of an arbitrary host
//! process.
//!
//! A minimal embedding looks like this:
//!
//!     use heapsig::{lifecycle, record, stats};
//!
//!     lifecycle::initialize();
//!     record::allocation(4096);
//!     assert_eq!(stats::current_thread().malloc_sample, 4096);
//!
//! In the intended deployment nothing calls [`record`] directly; the
//! interposed `malloc`/`free`/`realloc`/`calloc` and `memcpy`/`memmove`/
//! `strcpy` overrides do, with the byte quantities the platform allocator
//! reports. The three sampling signals (`SIGXCPU`, `SIGXFSZ`, `SIGPROF` by
//! default, see [`tunables`]) are ignored until the supervisor installs its
//! own handlers, so a process profiled without a supervisor runs unharmed.
//!
//! Three properties shape everything here:
//!
//! -   **Re-entrancy safety.** Publishing a sample formats text and takes a
//!     mutex, either of which may allocate or copy — which would re-enter the
//!     interposed symbols. A per-thread guard makes any nested recording call
//!     a silent no-op.
//! -   **Fork safety.** A forked child re-opens its signal files under its
//!     own pid and zeroes its counters before recording resumes; the parent's
//!     files are never touched from the child.
//! -   **Fatal-on-failure.** Once the signal files are lost there is no safe
//!     way to keep the books, so every platform failure in this crate aborts
//!     the process rather than report an error the interposed ABI could not
//!     propagate anyway.

#![deny(missing_docs)]

use std::io;
use std::process;

pub mod lifecycle;
pub mod record;
pub mod shims;
pub mod signal_file;
pub mod stats;
pub mod tunables;

#[cfg(feature = "hooks")]
pub mod hooks;

mod classifier;
mod counters;

// When the `"hooks"` feature is not enabled, go straight to libc.
#[cfg(not(feature = "hooks"))]
pub(crate) mod sys {
    use libc::c_int;

    pub(crate) unsafe fn raise(signal: c_int) -> c_int {
        libc::raise(signal)
    }
}

// When the `"hooks"` feature is enabled, `sys` functions allow for
// interposed implementations that provide simulated results for testing.
#[cfg(feature = "hooks")]
pub(crate) use hooks::sys;

/// Report a fatal platform failure on stderr and abort the process.
///
/// The interposed ABI has no channel for errors and the runtime cannot
/// outlive its bookkeeping medium, so every fatal path funnels through here.
pub(crate) fn fatal(what: &str, err: io::Error) -> ! {
    eprintln!("heapsig: {what} failed: {err}");
    process::abort();
}
