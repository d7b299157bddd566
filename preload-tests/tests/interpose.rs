//! The interposed symbols, exercised for real.
//!
//! Linking `heapsig-preload` as an rlib places its `malloc`, `free`,
//! `memcpy` and friends in this binary ahead of libc, so every allocation
//! the test (or the harness, or the standard library) makes goes through
//! the profiled allocator. The `.init_array` constructor has already run by
//! the time any test executes; the signal files for this process exist
//! before `main`.
//!
//! Scenarios that need exact counter arithmetic run on their own threads:
//! sampling state is per thread, and a fresh thread starts from zero.

use std::fs;
use std::hint::black_box;
use std::path::Path;
use std::thread;

use heapsig::stats::ThreadStats;
use heapsig::{lifecycle, stats};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use regex::Regex;

// Referencing the crate is what links the overrides into this binary.
use heapsig_preload as _;

const MIB: usize = 1024 * 1024;

fn my_tid() -> libc::pid_t {
    // SAFETY: gettid never fails.
    unsafe { libc::gettid() }
}

fn my_pid() -> libc::pid_t {
    // SAFETY: getpid never fails.
    unsafe { libc::getpid() }
}

/// Complete records for thread `tid` in the signal file at `path`.
fn records_for(path: &Path, tid: libc::pid_t) -> Vec<String> {
    let bytes = fs::read(path).expect("signal file is readable");
    let mut chunks: Vec<&[u8]> = bytes.split(|&b| b == b'\n').collect();
    // The final chunk is padding, never a complete record.
    chunks.pop();
    let prefix = format!("{tid},");
    chunks
        .iter()
        .filter(|chunk| !chunk.is_empty() && chunk[0] != 0)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .filter(|line| line.starts_with(&prefix))
        .map(str::to_string)
        .collect()
}

#[test]
fn the_constructor_ran_before_main() {
    assert!(lifecycle::malloc_signal_path(my_pid()).exists());
    assert!(lifecycle::memcpy_signal_path(my_pid()).exists());
}

#[test]
fn usable_size_covers_the_request() {
    unsafe {
        let p = libc::malloc(100);
        assert!(!p.is_null());
        let usable = heapsig_preload::malloc_usable_size(p);
        assert!(usable >= 100);
        libc::free(p);
    }
}

#[test]
fn small_allocations_publish_nothing() {
    let tid = thread::spawn(|| {
        unsafe {
            let p = libc::malloc(512);
            assert!(!p.is_null());
            libc::free(p);
        }
        let s = stats::current_thread();
        assert_eq!(s.malloc_triggered, 0);
        assert_eq!(s.free_triggered, 0);
        assert_eq!(s.memcpy_triggered, 0);
        my_tid()
    })
    .join()
    .unwrap();

    assert!(records_for(&lifecycle::malloc_signal_path(my_pid()), tid).is_empty());
}

#[test]
fn megabyte_allocations_publish_and_appear_in_the_log() {
    let (tid, malloc_triggered, free_triggered) = thread::spawn(|| {
        let a: Vec<u8> = Vec::with_capacity(MIB);
        let b: Vec<u8> = Vec::with_capacity(MIB);
        black_box((&a, &b));

        let s = stats::current_thread();
        // Depending on how the allocator rounds 1 MiB, either the second
        // megabyte crosses the threshold or both do.
        assert!((1..=2).contains(&s.malloc_triggered));
        drop(a);
        drop(b);
        let s = stats::current_thread();
        assert!((1..=2).contains(&s.free_triggered));
        (my_tid(), s.malloc_triggered, s.free_triggered)
    })
    .join()
    .unwrap();

    let record = Regex::new(r"^\d+,([MF]),\d+,\d+,1\.000000$").unwrap();
    let lines = records_for(&lifecycle::malloc_signal_path(my_pid()), tid);
    let mallocs = lines
        .iter()
        .filter(|l| record.captures(l).is_some_and(|c| &c[1] == "M"))
        .count();
    let frees = lines
        .iter()
        .filter(|l| record.captures(l).is_some_and(|c| &c[1] == "F"))
        .count();
    assert_eq!(mallocs, malloc_triggered as usize);
    assert_eq!(frees, free_triggered as usize);
    assert_eq!(lines.len(), mallocs + frees);
}

#[test]
fn copy_primitives_route_through_the_overrides() {
    let tid = thread::spawn(|| {
        // Pre-sized buffers: nothing below may reallocate (a reallocation
        // would copy, and this scenario counts copies).
        let mut src: Vec<u8> = Vec::with_capacity(MIB + 1);
        src.resize(MIB - 1, b'a');
        src.push(0);
        let mut dst: Vec<u8> = vec![0u8; MIB + 1];

        unsafe {
            libc::memcpy(
                dst.as_mut_ptr() as *mut libc::c_void,
                src.as_ptr() as *const libc::c_void,
                MIB,
            );
            libc::memmove(
                dst.as_mut_ptr() as *mut libc::c_void,
                src.as_ptr() as *const libc::c_void,
                MIB,
            );
            // A 1 MiB - 1 string copies its terminator too.
            libc::strcpy(
                dst.as_mut_ptr() as *mut libc::c_char,
                src.as_ptr() as *const libc::c_char,
            );
        }
        assert_eq!(dst[..MIB], src[..MIB]);

        let s = stats::current_thread();
        assert_eq!(s.memcpy_triggered, 1);
        my_tid()
    })
    .join()
    .unwrap();

    let lines = records_for(&lifecycle::memcpy_signal_path(my_pid()), tid);
    assert_eq!(lines.len(), 1);
    let record = Regex::new(r"^\d+,1,(\d+)$").unwrap();
    let bytes: u64 = record.captures(&lines[0]).expect("copy record grammar")[1]
        .parse()
        .unwrap();
    // The accumulated counter at the crossing: two 1 MiB copies, give or
    // take harness noise.
    assert!((2_097_131..3_000_000).contains(&bytes));
}

#[test]
fn free_of_null_is_a_silent_no_op() {
    thread::spawn(|| {
        let before = stats::current_thread();
        unsafe { libc::free(std::ptr::null_mut()) };
        assert_eq!(stats::current_thread(), before);
    })
    .join()
    .unwrap();
}

#[test]
fn realloc_to_the_same_usable_size_records_nothing() {
    thread::spawn(|| unsafe {
        let p = libc::malloc(1000);
        assert!(!p.is_null());
        let usable = heapsig_preload::malloc_usable_size(p);

        let before = stats::current_thread();
        let q = libc::realloc(p, usable);
        assert!(!q.is_null());
        assert_eq!(heapsig_preload::malloc_usable_size(q), usable);
        assert_eq!(stats::current_thread(), before);

        libc::free(q);
    })
    .join()
    .unwrap();
}

#[test]
fn appending_past_the_initial_size_doubles_the_file() {
    let tid = thread::spawn(|| {
        for _ in 0..60 {
            let v: Vec<u8> = Vec::with_capacity(MIB);
            black_box(&v);
        }
        my_tid()
    })
    .join()
    .unwrap();

    // 60 allocation records and 60 free records cannot fit in the initial
    // 1000 bytes; the file must have doubled, and doubling preserves every
    // record.
    let path = lifecycle::malloc_signal_path(my_pid());
    let len = fs::metadata(&path).unwrap().len();
    assert!(len >= 2000);
    assert_eq!(len % 1000, 0);

    let lines = records_for(&path, tid);
    let mallocs = lines.iter().filter(|l| l.contains(",M,")).count();
    let frees = lines.iter().filter(|l| l.contains(",F,")).count();
    assert_eq!(mallocs, 60);
    assert_eq!(frees, 60);
}

#[test]
fn fork_reinitialises_the_child_and_spares_the_parent() {
    // Make the forking thread's counters visibly nonzero first.
    unsafe {
        let p = libc::malloc(100_000);
        assert!(!p.is_null());
        libc::free(p);
    }
    let parent_before = stats::current_thread();
    assert!(parent_before.malloc_sample > 0 || parent_before.malloc_triggered > 0);
    let parent_log = lifecycle::malloc_signal_path(my_pid());

    // SAFETY: the child runs only the checks below and leaves with _exit.
    let pid = unsafe { libc::fork() };
    if pid == 0 {
        let code = child_checks();
        // SAFETY: _exit skips the harness and the destructors, as a forked
        // child must.
        unsafe { libc::_exit(code) };
    }

    assert!(pid > 0);
    let status = waitpid(Pid::from_raw(pid), None).expect("waitpid succeeds");
    assert_eq!(status, WaitStatus::Exited(Pid::from_raw(pid), 0));

    // The parent's counters and signal file are untouched.
    let parent_after = stats::current_thread();
    assert_eq!(parent_after.malloc_triggered, parent_before.malloc_triggered);
    assert_eq!(parent_after.malloc_sample, parent_before.malloc_sample);
    assert!(parent_log.exists());
}

/// Everything the forked child verifies; a nonzero return names the first
/// failed check.
fn child_checks() -> i32 {
    if stats::current_thread() != ThreadStats::default() {
        return 1;
    }
    let child_log = lifecycle::malloc_signal_path(my_pid());
    if !child_log.exists() {
        return 2;
    }

    unsafe {
        let p = libc::malloc(2 * MIB);
        if p.is_null() {
            return 3;
        }
        libc::free(p);
    }
    let s = stats::current_thread();
    if s.malloc_triggered != 1 {
        return 4;
    }
    if s.free_triggered != 1 {
        return 5;
    }
    match fs::read(&child_log) {
        Ok(bytes) if bytes.windows(3).any(|w| w == b",M,") => {}
        _ => return 6,
    }

    // The child exits below main's teardown; leave /tmp tidy by hand.
    let _ = fs::remove_file(&child_log);
    let _ = fs::remove_file(lifecycle::memcpy_signal_path(my_pid()));
    0
}
