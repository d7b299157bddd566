//! End-to-end scenarios for the interposed allocator front-end.
//!
//! The library target exists to anchor the workspace member; the scenarios
//! live in `tests/`, linked against `heapsig-preload` as an rlib so the
//! overrides preempt the platform allocator inside the test binaries
//! themselves.
