//! The real libc entry points behind the interposed copy symbols.
//!
//! An interposed `memcpy` cannot call `memcpy` — that is itself. The
//! lifecycle code resolves the genuine implementations out of the platform C
//! library with `dlopen`/`dlsym` and parks them in lock-free globals; the
//! front-end forwards through the accessors here. Until resolution has
//! happened (a constructor running even earlier than ours, say) the
//! byte-wise [`fallback_copy`] stands in.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::raw::{c_char, c_void};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::fatal;

/// Name the platform C library is loaded under.
const LIBC_SO: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"libc.so.6\0") };

static LIBC_HANDLE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_MEMCPY: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_MEMMOVE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_STRCPY: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_FORK: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

/// Signature of the platform `memcpy` and `memmove`.
pub type CopyFn = unsafe extern "C" fn(*mut c_void, *const c_void, usize) -> *mut c_void;

/// Signature of the platform `strcpy`.
pub type StrcpyFn = unsafe extern "C" fn(*mut c_char, *const c_char) -> *mut c_char;

/// Signature of the platform `fork`.
pub type ForkFn = unsafe extern "C" fn() -> libc::pid_t;

/// Resolve every real entry point out of the platform C library.
///
/// Called once from [`lifecycle::initialize`]; any failure aborts — a copy
/// runtime that cannot copy has nothing left to offer.
///
/// [`lifecycle::initialize`]: crate::lifecycle::initialize
pub fn resolve() {
    // SAFETY: dlopen/dlsym with static NUL-terminated names; the resolved
    // addresses are stored untyped and only transmuted to the signatures
    // the platform documents for them.
    unsafe {
        let handle = libc::dlopen(LIBC_SO.as_ptr(), libc::RTLD_LAZY);
        if handle.is_null() {
            fatal_dl("dlopen(libc)");
        }
        LIBC_HANDLE.store(handle, Ordering::Release);

        REAL_MEMCPY.store(must_resolve(handle, "memcpy\0"), Ordering::Release);
        REAL_MEMMOVE.store(must_resolve(handle, "memmove\0"), Ordering::Release);
        REAL_STRCPY.store(must_resolve(handle, "strcpy\0"), Ordering::Release);
        REAL_FORK.store(must_resolve(handle, "fork\0"), Ordering::Release);
    }
}

unsafe fn must_resolve(handle: *mut c_void, name: &str) -> *mut c_void {
    let symbol = libc::dlsym(handle, name.as_ptr() as *const c_char);
    if symbol.is_null() {
        fatal_dl(name.trim_end_matches('\0'));
    }
    symbol
}

/// Report the pending `dlerror` and abort.
fn fatal_dl(what: &str) -> ! {
    // SAFETY: dlerror returns a thread-local string or null.
    let message = unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            String::from("unknown dl error")
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    };
    fatal(what, io::Error::new(io::ErrorKind::Other, message));
}

/// Close the dynamically loaded C library handle.
pub fn close() {
    let handle = LIBC_HANDLE.swap(ptr::null_mut(), Ordering::AcqRel);
    if handle.is_null() {
        return;
    }
    // SAFETY: the handle came from dlopen and is closed exactly once. The
    // resolved pointers stay valid: the C library itself never unloads.
    if unsafe { libc::dlclose(handle) } != 0 {
        fatal_dl("dlclose(libc)");
    }
}

fn load(slot: &AtomicPtr<c_void>) -> *mut c_void {
    slot.load(Ordering::Acquire)
}

/// The real `memcpy`, once resolved.
pub fn real_memcpy() -> Option<CopyFn> {
    let p = load(&REAL_MEMCPY);
    if p.is_null() {
        return None;
    }
    // SAFETY: the pointer was produced by dlsym for this signature.
    Some(unsafe { mem::transmute::<*mut c_void, CopyFn>(p) })
}

/// The real `memmove`, once resolved.
pub fn real_memmove() -> Option<CopyFn> {
    let p = load(&REAL_MEMMOVE);
    if p.is_null() {
        return None;
    }
    // SAFETY: as for `real_memcpy`.
    Some(unsafe { mem::transmute::<*mut c_void, CopyFn>(p) })
}

/// The real `strcpy`, once resolved.
pub fn real_strcpy() -> Option<StrcpyFn> {
    let p = load(&REAL_STRCPY);
    if p.is_null() {
        return None;
    }
    // SAFETY: as for `real_memcpy`.
    Some(unsafe { mem::transmute::<*mut c_void, StrcpyFn>(p) })
}

/// The real `fork`.
///
/// There is no fallback for `fork`; interposing it before initialisation has
/// resolved the real one is a bug, and aborts.
pub fn real_fork() -> ForkFn {
    let p = load(&REAL_FORK);
    if p.is_null() {
        fatal(
            "fork",
            io::Error::new(io::ErrorKind::Other, "interposed before initialisation"),
        );
    }
    // SAFETY: the pointer was produced by dlsym for this signature.
    unsafe { mem::transmute::<*mut c_void, ForkFn>(p) }
}

/// Byte-wise copy used before the real `memcpy`/`memmove` are resolved.
///
/// Overlap is handled by direction: ascending when the destination starts
/// below the source, descending otherwise.
///
/// # Safety
///
/// Same contract as `memmove`: both ranges of `n` bytes must be valid, and
/// the destination writable.
pub unsafe fn fallback_copy(dst: *mut u8, src: *const u8, n: usize) {
    if (dst as usize) < (src as usize) {
        for i in 0..n {
            *dst.add(i) = *src.add(i);
        }
    } else {
        for i in (0..n).rev() {
            *dst.add(i) = *src.add(i);
        }
    }
}
