//! Per-thread reentry guard for the accounting path.
//!
//! The proxy's own bookkeeping (log growth, snapshot maps, tracing output) allocates
//! through the very functions it intercepts. While a thread holds a [`ReentryGuard`],
//! nested calls skip accounting and go straight to the real allocator.

use std::cell::Cell;

thread_local! {
    // No destructor: registering a TLS destructor may itself allocate.
    static IN_ACCOUNTING: Cell<bool> = const { Cell::new(false) };
}

pub struct ReentryGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ReentryGuard {
    /// Returns `None` when the current thread is already inside the accounting path.
    #[inline]
    pub fn enter() -> Option<ReentryGuard> {
        IN_ACCOUNTING
            .try_with(|flag| {
                if flag.replace(true) {
                    None
                } else {
                    Some(ReentryGuard { _not_send: std::marker::PhantomData })
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = IN_ACCOUNTING.try_with(|flag| flag.set(false));
    }
}

/// Runs `f` with accounting suspended on this thread, if it is not already.
pub fn suspended<R>(f: impl FnOnce() -> R) -> R {
    let _guard = ReentryGuard::enter();
    f()
}
