//! Call-stack attribution of sampled allocations.
//!
//! Once per [`CALL_STACK_SAMPLING_RATE`] allocated bytes the record path
//! walks a few frames of the current stack and decides whether the
//! allocation crossed the host interpreter's FFI boundary. The verdict is
//! coarse on purpose: one substring match against the dynamic symbol each
//! frame resolves to, innermost frame first. Unresolvable frames count as
//! host frames, so a stripped or anonymous stack degrades to "host" rather
//! than to noise.
//!
//! [`CALL_STACK_SAMPLING_RATE`]: crate::tunables::CALL_STACK_SAMPLING_RATE

use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::raw::c_void;
use std::ptr;

use crate::counters::ThreadCounters;
use crate::tunables::{CALL_STACK_INSPECTION_DEPTH, FOREIGN_SYMBOL_MARKERS};

/// Attribute `bytes` of allocation to the host or foreign bucket based on
/// the calling thread's current stack.
///
/// Must run under the record guard: the frame walker may allocate on its
/// first use.
pub(crate) fn attribute(counters: &ThreadCounters, bytes: u32) {
    let mut frames = [ptr::null_mut::<c_void>(); CALL_STACK_INSPECTION_DEPTH];
    let mut depth = 0;
    backtrace::trace(|frame| {
        frames[depth] = frame.ip();
        depth += 1;
        depth < CALL_STACK_INSPECTION_DEPTH
    });

    // The innermost matching frame decides.
    let bucket = if frames[..depth].iter().any(|&ip| frame_is_foreign(ip)) {
        &counters.foreign_alloc_bytes
    } else {
        &counters.host_alloc_bytes
    };
    ThreadCounters::accumulate(bucket, bytes);
}

/// Whether the dynamic symbol containing `ip` carries a foreign marker.
///
/// Best effort: an address `dladdr` cannot place, or a symbol without a
/// name, is not foreign.
fn frame_is_foreign(ip: *mut c_void) -> bool {
    let mut info = MaybeUninit::<libc::Dl_info>::uninit();
    // SAFETY: dladdr only writes `info`, and only on a non-zero return.
    let name = unsafe {
        if libc::dladdr(ip as *const c_void, info.as_mut_ptr()) == 0 {
            return false;
        }
        let info = info.assume_init();
        if info.dli_sname.is_null() {
            return false;
        }
        CStr::from_ptr(info.dli_sname).to_bytes()
    };

    FOREIGN_SYMBOL_MARKERS
        .iter()
        .any(|marker| contains_ignore_ascii_case(name, marker.as_bytes()))
}

/// Case-insensitive ASCII substring search, allocation free.
fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_match_is_case_insensitive() {
        assert!(contains_ignore_ascii_case(
            b"ZIF_FFI_Trampoline_invoke",
            b"zif_ffi_trampoline"
        ));
        assert!(contains_ignore_ascii_case(b"zend_mm_alloc", b"zend"));
        assert!(!contains_ignore_ascii_case(b"malloc", b"zend"));
        assert!(!contains_ignore_ascii_case(b"zen", b"zend"));
        assert!(contains_ignore_ascii_case(b"anything", b""));
    }

    #[test]
    fn a_plain_rust_stack_counts_as_host() {
        let counters = ThreadCounters::new();
        attribute(&counters, 4096);
        assert_eq!(counters.host_alloc_bytes.get(), 4096);
        assert_eq!(counters.foreign_alloc_bytes.get(), 0);
    }

    #[test]
    fn unplaceable_address_is_not_foreign() {
        assert!(!frame_is_foreign(ptr::null_mut()));
    }
}
