//! The `LD_PRELOAD` front-end for the `heapsig` sampling runtime.
//!
//! This crate exports C-ABI replacements for the platform allocator entry
//! points (backed by jemalloc), for the bulk-copy primitives, and for
//! `fork`, feeding the sampling core in [`heapsig`] as a side effect. Each
//! override preserves its platform contract exactly; a caller cannot tell
//! it is being profiled.
//!
//! Build the `cdylib` and preload it into the host process:
//!
//! ```text
//! LD_PRELOAD=target/release/libheapsig_preload.so php script.php
//! ```
//!
//! The crate also builds as an `rlib` so a test binary can link the
//! overrides directly — referencing any symbol from this crate pulls the
//! whole replacement set, and link order does the rest.
//!
//! Allocation and free events record the allocator's *usable* size rather
//! than the requested size. The usable size is what the process actually
//! holds, and it is the only quantity that lets allocate and free
//! accounting balance exactly: `free` can never learn what was once
//! requested, only what the block really occupies.

#![deny(missing_docs)]

use std::ffi::{c_char, c_int, c_void};

use heapsig::{lifecycle, record, shims};
use libc::{pid_t, size_t};
use tikv_jemalloc_sys as allocator;

// The lifecycle must run before any other constructor can allocate through
// the overrides, and tear down only after `main` is done with them.
#[used]
#[link_section = ".init_array"]
static HEAPSIG_INIT: extern "C" fn() = {
    extern "C" fn init() {
        lifecycle::initialize();
    }
    init
};

#[used]
#[link_section = ".fini_array"]
static HEAPSIG_FINI: extern "C" fn() = {
    extern "C" fn fini() {
        lifecycle::finalize();
    }
    fini
};

/// Interposed `malloc`.
///
/// # Safety
///
/// Platform `malloc` contract.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let p = allocator::malloc(size);
    if !p.is_null() {
        record::allocation(allocator::malloc_usable_size(p));
    }
    p
}

/// Interposed `calloc`.
///
/// # Safety
///
/// Platform `calloc` contract.
#[no_mangle]
pub unsafe extern "C" fn calloc(number: size_t, size: size_t) -> *mut c_void {
    let p = allocator::calloc(number, size);
    if !p.is_null() {
        record::allocation(allocator::malloc_usable_size(p));
    }
    p
}

/// Interposed `realloc`.
///
/// Records the usable-size delta: growth as an allocation, shrinkage as a
/// deallocation, an unchanged block as nothing at all.
///
/// # Safety
///
/// Platform `realloc` contract.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let old_size = allocator::malloc_usable_size(ptr);
    let p = allocator::realloc(ptr, size);
    if p.is_null() && size != 0 {
        // Failed resize: the old block is untouched.
        return p;
    }

    let new_size = allocator::malloc_usable_size(p);
    if new_size > old_size {
        record::allocation(new_size - old_size);
    } else if new_size < old_size {
        record::deallocation(old_size - new_size);
    }
    p
}

/// Interposed `free`.
///
/// # Safety
///
/// Platform `free` contract.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    // The size must be read before the pointer dies.
    let size = allocator::malloc_usable_size(ptr);
    allocator::free(ptr);
    record::deallocation(size);
}

/// Interposed `posix_memalign`.
///
/// # Safety
///
/// Platform `posix_memalign` contract.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    out: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let rc = allocator::posix_memalign(out, alignment, size);
    if rc == 0 {
        record::allocation(allocator::malloc_usable_size(*out));
    }
    rc
}

/// Interposed `aligned_alloc`.
///
/// # Safety
///
/// Platform `aligned_alloc` contract.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: size_t, size: size_t) -> *mut c_void {
    let p = allocator::aligned_alloc(alignment, size);
    if !p.is_null() {
        record::allocation(allocator::malloc_usable_size(p));
    }
    p
}

/// Interposed `malloc_usable_size`.
///
/// Blocks handed out here come from jemalloc, so questions about them must
/// go to jemalloc too.
///
/// # Safety
///
/// Platform `malloc_usable_size` contract.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    allocator::malloc_usable_size(ptr)
}

/// Interposed `memcpy`.
///
/// # Safety
///
/// Platform `memcpy` contract.
#[no_mangle]
pub unsafe extern "C" fn memcpy(dest: *mut c_void, src: *const c_void, n: size_t) -> *mut c_void {
    record::copy(n);
    match shims::real_memcpy() {
        Some(real) => real(dest, src, n),
        None => {
            shims::fallback_copy(dest as *mut u8, src as *const u8, n);
            dest
        }
    }
}

/// Interposed `memmove`.
///
/// # Safety
///
/// Platform `memmove` contract.
#[no_mangle]
pub unsafe extern "C" fn memmove(dest: *mut c_void, src: *const c_void, n: size_t) -> *mut c_void {
    record::copy(n);
    match shims::real_memmove() {
        Some(real) => real(dest, src, n),
        None => {
            shims::fallback_copy(dest as *mut u8, src as *const u8, n);
            dest
        }
    }
}

/// Interposed `strcpy`.
///
/// Records the copied length including the terminator.
///
/// # Safety
///
/// Platform `strcpy` contract.
#[no_mangle]
pub unsafe extern "C" fn strcpy(dest: *mut c_char, src: *const c_char) -> *mut c_char {
    let n = libc::strlen(src) + 1;
    record::copy(n);
    match shims::real_strcpy() {
        Some(real) => real(dest, src),
        None => {
            shims::fallback_copy(dest as *mut u8, src as *const u8, n);
            dest
        }
    }
}

/// Interposed `fork`.
///
/// The child rebuilds the runtime — fresh PID-named signal files, zeroed
/// counters — before this returns; the parent is untouched.
///
/// # Safety
///
/// Platform `fork` contract.
#[no_mangle]
pub unsafe extern "C" fn fork() -> pid_t {
    let pid = (shims::real_fork())();
    if pid == 0 {
        lifecycle::reinitialize_child();
    }
    pid
}
