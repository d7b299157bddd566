//! Read-only diagnostics over the calling thread's sampling state.

use crate::counters;

/// A snapshot of the calling thread's sampling counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Malloc samples this thread has published.
    pub malloc_triggered: u32,
    /// Free samples this thread has published.
    pub free_triggered: u32,
    /// Copy samples this thread has published.
    pub memcpy_triggered: u32,
    /// Bytes attributed to the host interpreter in the current window.
    pub host_alloc_bytes: u32,
    /// Bytes attributed to foreign (native-library) frames in the current
    /// window.
    pub foreign_alloc_bytes: u32,
    /// Bytes accumulated toward the next malloc sample.
    pub malloc_sample: u32,
    /// Bytes accumulated toward the next free sample.
    pub free_sample: u32,
    /// Bytes accumulated toward the next copy sample.
    pub memcpy_sample: u32,
    /// Bytes accumulated toward the next call-stack inspection.
    pub call_stack_sample: u32,
}

/// Capture the calling thread's counters.
///
/// Cheap and lock free; a thread whose storage is already torn down reads
/// as all zeroes.
pub fn current_thread() -> ThreadStats {
    counters::peek(|c| ThreadStats {
        malloc_triggered: c.malloc_triggered.get(),
        free_triggered: c.free_triggered.get(),
        memcpy_triggered: c.memcpy_triggered.get(),
        host_alloc_bytes: c.host_alloc_bytes.get(),
        foreign_alloc_bytes: c.foreign_alloc_bytes.get(),
        malloc_sample: c.malloc_sample.get(),
        free_sample: c.free_sample.get(),
        memcpy_sample: c.memcpy_sample.get(),
        call_stack_sample: c.call_stack_sample.get(),
    })
    .unwrap_or_default()
}
