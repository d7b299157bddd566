//! Load-time initialisation, unload-time teardown, and post-fork recovery.
//!
//! The runtime's global state — the two mapped signal files behind one
//! mutex, and the resolved libc entry points — follows a strict discipline:
//! acquired once before any interposed call can record, released once after
//! the last, and rebuilt from scratch in a forked child before its first
//! record. Recording is gated off for the whole of each transition.

use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, Once, PoisonError};

use log::debug;

use crate::signal_file::SignalFile;
use crate::tunables::{FREE_SIGNAL, MALLOC_SIGNAL, MEMCPY_SIGNAL, SIGNAL_FILE_PREFIX};
use crate::{counters, fatal, shims};

/// The process-global signal files, behind the mutex that serialises
/// appends across threads.
pub(crate) struct Runtime {
    pub(crate) malloc_log: SignalFile,
    pub(crate) memcpy_log: SignalFile,
}

static RUNTIME: Mutex<Option<Runtime>> = Mutex::new(None);
static INIT: Once = Once::new();

/// Path of the allocation/free signal file for process `pid`.
///
/// The supervisor composes the same name on its side.
pub fn malloc_signal_path(pid: libc::pid_t) -> PathBuf {
    PathBuf::from(format!("{SIGNAL_FILE_PREFIX}-malloc-signal{pid}"))
}

/// Path of the copy signal file for process `pid`.
pub fn memcpy_signal_path(pid: libc::pid_t) -> PathBuf {
    PathBuf::from(format!("{SIGNAL_FILE_PREFIX}-memcpy-signal{pid}"))
}

fn open_runtime(pid: libc::pid_t) -> io::Result<Runtime> {
    Ok(Runtime {
        malloc_log: SignalFile::create(malloc_signal_path(pid))?,
        memcpy_log: SignalFile::create(memcpy_signal_path(pid))?,
    })
}

/// Run `f` over the global runtime under the signal-file mutex.
///
/// Returns `None` before initialisation and after teardown.
pub(crate) fn with_runtime<R>(f: impl FnOnce(&mut Runtime) -> R) -> Option<R> {
    let mut guard = RUNTIME.lock().unwrap_or_else(PoisonError::into_inner);
    guard.as_mut().map(f)
}

/// Initialise the runtime. Idempotent; the preload constructor calls this
/// before `main`, embedders and tests may call it directly.
///
/// With recording disabled: create and map both PID-named signal files,
/// install `SIG_IGN` for the three sampling signals so any raised before
/// the supervisor attaches are discarded, and resolve the real libc entry
/// points. Only then does recording open.
pub fn initialize() {
    INIT.call_once(|| {
        counters::set_recording(false);

        // SAFETY: getpid never fails.
        let pid = unsafe { libc::getpid() };
        let runtime = match open_runtime(pid) {
            Ok(runtime) => runtime,
            Err(e) => fatal("creating the signal files", e),
        };

        for signal in [MALLOC_SIGNAL, FREE_SIGNAL, MEMCPY_SIGNAL] {
            // SAFETY: installing SIG_IGN for a standard signal.
            if unsafe { libc::signal(signal, libc::SIG_IGN) } == libc::SIG_ERR {
                fatal("signal(SIG_IGN)", io::Error::last_os_error());
            }
        }

        shims::resolve();

        *RUNTIME.lock().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
        counters::set_recording(true);
        debug!("heapsig initialised for pid {pid}");
    });
}

/// Tear the runtime down: stop recording, unmap and unlink both signal
/// files, close the libc handle. The preload destructor calls this after
/// `main`.
pub fn finalize() {
    counters::set_recording(false);

    let taken = RUNTIME
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(runtime) = taken {
        if let Err(e) = runtime.malloc_log.unlink() {
            fatal("unlinking the malloc signal file", e);
        }
        if let Err(e) = runtime.memcpy_log.unlink() {
            fatal("unlinking the memcpy signal file", e);
        }
        shims::close();
        debug!("heapsig torn down");
    }
}

/// Rebuild per-process state on the child side of a fork.
///
/// The interposed `fork` calls this before returning zero to the child:
/// recording pauses, the surviving thread's counters reset, and fresh
/// signal files open under the child's pid. The mappings inherited from the
/// parent are dropped without unlinking — the parent's files belong to the
/// parent. Symbol resolution and signal dispositions carry over the fork
/// untouched.
pub fn reinitialize_child() {
    counters::set_recording(false);
    counters::reset_current_thread();

    // SAFETY: getpid never fails.
    let pid = unsafe { libc::getpid() };
    let runtime = match open_runtime(pid) {
        Ok(runtime) => runtime,
        Err(e) => fatal("recreating the signal files after fork", e),
    };

    *RUNTIME.lock().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
    counters::set_recording(true);
    debug!("heapsig reinitialised in forked child {pid}");
}
