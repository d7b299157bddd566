//! Intercepting the runtime's platform calls, for testing.
//!
//! Note: this module is only available when the `"hooks"` feature is
//! enabled.
//!
//! Whether a sampling signal was actually raised is invisible to a test:
//! the dispositions are `SIG_IGN` until a supervisor attaches, and
//! installing a real handler just to count deliveries drags asynchronous
//! signal handling into the test. This module instead lets a test interpose
//! its own implementation of the platform calls the record path performs,
//! observing exactly which were made with which arguments.
//!
//! There are three pieces:
//!
//! - The [`Hooks`] trait has a method for each platform call the record
//!   path performs.
//!
//! - [`set_thread_hooks`] installs a `Box<dyn Hooks>` whose methods the
//!   calling thread uses for all subsequent record-path platform calls.
//!
//! - [`clear_thread_hooks`] restores the thread's original state, so
//!   subsequent calls reach the real platform again.
//!
//! Hooks are per-thread, which matches the sampling state: a test drives
//! one thread's counters and observes that thread's publications without
//! seeing its neighbours'.

use std::cell::RefCell;

use libc::c_int;

std::thread_local! {
    static HOOKS: RefCell<Box<dyn Hooks + 'static>> = RefCell::new(Box::new(RealHooks));
}

/// Direct the record path's platform calls on this thread to `hooks`.
///
/// This affects only the calling thread. Any previously established hooks
/// on the thread are dropped.
///
/// # Safety
///
/// Samples published by state that was initialised earlier still route
/// through the new hooks; suppressing a `raise` the rest of the system
/// expects to happen could make a hash of things.
pub unsafe fn set_thread_hooks(hooks: Box<dyn Hooks + 'static>) {
    HOOKS.with(|per_thread| {
        *per_thread.borrow_mut() = hooks;
    })
}

/// Direct the record path's platform calls on this thread back to the real
/// platform.
///
/// This affects only the calling thread. Any previously established hooks
/// on the thread are dropped.
///
/// # Safety
///
/// As for [`set_thread_hooks`]: values created while hooks were installed
/// suddenly see the real platform.
pub unsafe fn clear_thread_hooks() {
    HOOKS.with(|per_thread| {
        *per_thread.borrow_mut() = Box::new(RealHooks);
    })
}

/// A trait with a method for each platform call the record path performs.
///
/// [`RealHooks`] implements it in terms of the real platform.
pub trait Hooks {
    /// See [`libc::raise`].
    ///
    /// # Safety
    ///
    /// Called with one of the configured sampling signals; implementations
    /// that forward must uphold `raise`'s contract.
    unsafe fn raise(&mut self, signal: c_int) -> c_int;
}

/// An implementation of the [`Hooks`] trait in terms of the real platform
/// calls. Installing it is equivalent to calling [`clear_thread_hooks`].
pub struct RealHooks;

impl Hooks for RealHooks {
    unsafe fn raise(&mut self, signal: c_int) -> c_int {
        libc::raise(signal)
    }
}

/// Wrapper around the platform calls that consults the calling thread's
/// hooks, for use by the record path.
pub(crate) mod sys {
    use libc::c_int;

    use super::HOOKS;

    pub(crate) unsafe fn raise(signal: c_int) -> c_int {
        // A publication during thread teardown can outlive the hooks slot;
        // the real platform call is always available.
        HOOKS
            .try_with(|hooks| hooks.borrow_mut().raise(signal))
            .unwrap_or_else(|_| libc::raise(signal))
    }
}
