//! Resolve-once cache for the "next" definition of an intercepted symbol.
//!
//! Every intercepted function owns one [`NextSymbol`] slot. The first call looks the
//! symbol up with `dlsym(RTLD_NEXT, ..)` and caches the result for the rest of the
//! process; a failed lookup is cached as well and never retried.
//!
//! Two threads may race on the first lookup and both call `dlsym`. Both observe the
//! same address, so whichever store lands last is equivalent to the first.

use crate::guard;
use std::cell::Cell;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

const UNRESOLVED: usize = 0;
const FAILED: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no next definition of `{0}` in the symbol search order")]
    NotFound(&'static str),
    #[error("lookup of `{0}` re-entered on the resolving thread")]
    InFlight(&'static str),
}

thread_local! {
    static LOOKUP_IN_FLIGHT: Cell<bool> = const { Cell::new(false) };
}

struct LookupScope;

impl LookupScope {
    fn enter() -> Option<LookupScope> {
        LOOKUP_IN_FLIGHT
            .try_with(|flag| if flag.replace(true) { None } else { Some(LookupScope) })
            .ok()
            .flatten()
    }
}

impl Drop for LookupScope {
    fn drop(&mut self) {
        let _ = LOOKUP_IN_FLIGHT.try_with(|flag| flag.set(false));
    }
}

/// Lazily resolved pointer to the next definition of `symbol`, typed as `F`.
///
/// `F` must be an `unsafe extern "C" fn(..)` pointer type matching the symbol's ABI.
pub struct NextSymbol<F> {
    symbol: &'static str,
    slot: AtomicUsize,
    _signature: PhantomData<F>,
}

impl<F: Copy> NextSymbol<F> {
    /// `symbol` must be NUL-terminated, e.g. `"malloc\0"`.
    pub const fn new(symbol: &'static str) -> Self {
        Self { symbol, slot: AtomicUsize::new(UNRESOLVED), _signature: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.symbol.trim_end_matches('\0')
    }

    /// The cached function, resolving it on first use. `None` if it cannot be located.
    #[inline]
    pub fn get(&self) -> Option<F> {
        self.try_get().ok()
    }

    pub fn try_get(&self) -> Result<F, ResolveError> {
        match self.slot.load(Ordering::Acquire) {
            UNRESOLVED => self.resolve(),
            FAILED => Err(ResolveError::NotFound(self.name())),
            addr => Ok(unsafe { Self::cast(addr) }),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.slot.load(Ordering::Acquire) == FAILED
    }

    #[cold]
    fn resolve(&self) -> Result<F, ResolveError> {
        // The loader may call back into an intercepted function while it searches.
        let Some(_scope) = LookupScope::enter() else {
            return Err(ResolveError::InFlight(self.name()));
        };
        debug_assert!(self.symbol.ends_with('\0'));
        let addr =
            unsafe { libc::dlsym(libc::RTLD_NEXT, self.symbol.as_ptr().cast()) } as *mut c_void;
        if addr.is_null() {
            self.slot.store(FAILED, Ordering::Release);
            let err = ResolveError::NotFound(self.name());
            guard::suspended(|| warn!(%err, "calls will report failure"));
            return Err(err);
        }
        self.slot.store(addr as usize, Ordering::Release);
        Ok(unsafe { Self::cast(addr as usize) })
    }

    unsafe fn cast(addr: usize) -> F {
        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        mem::transmute_copy::<usize, F>(&addr)
    }
}
