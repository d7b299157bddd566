//! The sampling front door: accumulate, classify, publish, raise.
//!
//! The interposed entry points call one of the three functions here with a
//! byte quantity; almost every call is two counter additions and a return.
//! When a per-thread accumulator reaches its sampling rate the accumulated
//! bytes are formatted into a record, appended to the matching signal file
//! under the process-wide mutex, and the sample's signal is raised for the
//! supervisor.
//!
//! Every entry is protected by the per-thread re-entrancy guard: the
//! publishing path itself allocates and copies (formatting, the mutex, the
//! mapped write), and those nested calls must vanish rather than recurse.

use std::io::{Cursor, Write};

use crate::counters::{self, ThreadCounters};
use crate::tunables::{
    CALL_STACK_SAMPLING_RATE, FREE_SAMPLING_RATE, FREE_SIGNAL, MALLOC_SAMPLING_RATE,
    MALLOC_SIGNAL, MEMCPY_SAMPLING_RATE, MEMCPY_SIGNAL,
};
use crate::{classifier, fatal, lifecycle, sys};

/// Upper bound on a formatted record, comfortably above the widest fields.
const MAX_RECORD_LEN: usize = 256;

/// Record `usable_bytes` of fresh allocation on the calling thread.
///
/// Silently does nothing when recording is disabled or re-entered.
pub fn allocation(usable_bytes: usize) {
    let _ = counters::with_recording(|c| {
        let bytes = usable_bytes as u32;
        ThreadCounters::accumulate(&c.malloc_sample, bytes);
        ThreadCounters::accumulate(&c.call_stack_sample, bytes);

        if c.call_stack_sample.get() >= CALL_STACK_SAMPLING_RATE {
            classifier::attribute(c, bytes);
            c.call_stack_sample.set(0);
        }

        if c.malloc_sample.get() >= MALLOC_SAMPLING_RATE {
            c.malloc_triggered.set(c.malloc_triggered.get() + 1);
            publish_alloc_sample(c, 'M', c.malloc_sample.get());
            c.malloc_sample.set(0);
            c.host_alloc_bytes.set(0);
            c.foreign_alloc_bytes.set(0);
            raise(MALLOC_SIGNAL);
        }
    });
}

/// Record `usable_bytes` returning to the allocator on the calling thread.
///
/// Silently does nothing when recording is disabled or re-entered.
pub fn deallocation(usable_bytes: usize) {
    let _ = counters::with_recording(|c| {
        let bytes = usable_bytes as u32;
        ThreadCounters::accumulate(&c.free_sample, bytes);

        if c.free_sample.get() >= FREE_SAMPLING_RATE {
            c.free_triggered.set(c.free_triggered.get() + 1);
            publish_alloc_sample(c, 'F', c.free_sample.get());
            c.free_sample.set(0);
            raise(FREE_SIGNAL);
        }
    });
}

/// Record `bytes_copied` moved by one of the copy primitives.
///
/// Silently does nothing when recording is disabled or re-entered.
pub fn copy(bytes_copied: usize) {
    let _ = counters::with_recording(|c| {
        let bytes = bytes_copied as u32;
        ThreadCounters::accumulate(&c.memcpy_sample, bytes);

        if c.memcpy_sample.get() >= MEMCPY_SAMPLING_RATE {
            c.memcpy_triggered.set(c.memcpy_triggered.get() + 1);
            publish_copy_sample(c);
            c.memcpy_sample.set(0);
            raise(MEMCPY_SIGNAL);
        }
    });
}

/// Append `<tid>,<kind>,<seq>,<bytes>,<host-fraction>` to the malloc log.
///
/// `seq` is the combined count of published malloc and free samples, already
/// incremented for the sample being published.
fn publish_alloc_sample(c: &ThreadCounters, kind: char, bytes: u32) {
    let mut host = c.host_alloc_bytes.get();
    let foreign = c.foreign_alloc_bytes.get();
    if host == 0 && foreign == 0 {
        // An uninspected window reads as purely host, never as 0/0.
        host = 1;
    }
    let fraction = f64::from(host) / (f64::from(host) + f64::from(foreign));
    let seq = c.malloc_triggered.get() + c.free_triggered.get();

    let mut buf = [0u8; MAX_RECORD_LEN];
    let mut cursor = Cursor::new(&mut buf[..]);
    if let Err(e) = write!(
        cursor,
        "{},{},{},{},{:.6}\n\n",
        thread_id(),
        kind,
        seq,
        bytes,
        fraction
    ) {
        fatal("formatting an allocation record", e);
    }
    let len = cursor.position() as usize;

    if let Some(result) = lifecycle::with_runtime(|rt| rt.malloc_log.append(&buf[..len])) {
        if let Err(e) = result {
            fatal("appending to the malloc signal file", e);
        }
    }
}

/// Append `<tid>,<seq>,<bytes>` to the memcpy log.
fn publish_copy_sample(c: &ThreadCounters) {
    let mut buf = [0u8; MAX_RECORD_LEN];
    let mut cursor = Cursor::new(&mut buf[..]);
    if let Err(e) = write!(
        cursor,
        "{},{},{}\n\n",
        thread_id(),
        c.memcpy_triggered.get(),
        c.memcpy_sample.get()
    ) {
        fatal("formatting a copy record", e);
    }
    let len = cursor.position() as usize;

    if let Some(result) = lifecycle::with_runtime(|rt| rt.memcpy_log.append(&buf[..len])) {
        if let Err(e) = result {
            fatal("appending to the memcpy signal file", e);
        }
    }
}

fn raise(signal: libc::c_int) {
    // SAFETY: raising a signal at ourselves has no preconditions; the three
    // sampling signals are ignored until the supervisor takes them over.
    if unsafe { sys::raise(signal) } != 0 {
        fatal("raise", std::io::Error::last_os_error());
    }
}

fn thread_id() -> libc::pid_t {
    // SAFETY: gettid never fails.
    unsafe { libc::gettid() }
}
