//! Start-up protocol for `calloc`.
//!
//! `dlsym` may call `calloc` while it is looking up `calloc`. The lookup therefore
//! happens once, in a load-time initializer, and `calloc` answers from a fixed state:
//!
//! | state       | `calloc` returns                        |
//! |-------------|-----------------------------------------|
//! | not started | null                                    |
//! | in flight   | a fresh slice of the static buffer      |
//! | ready       | the real `calloc`, with accounting      |
//! | failed      | null                                    |

use crate::allocator::{CallocFn, Interposer};
use crate::guard;
use crate::resolve::NextSymbol;
use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr::{self, null_mut};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Size of the static area responses are carved from while the lookup is in flight.
pub const STATIC_BUFFER_SIZE: usize = 8192;
const STATIC_ALIGN: usize = 16;

const NOT_STARTED: u8 = 0;
const IN_FLIGHT: u8 = 1;
const READY: u8 = 2;
const FAILED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NotStarted,
    InFlight,
    Ready,
    Failed,
}

#[repr(C, align(16))]
struct StaticBuffer(UnsafeCell<[u8; STATIC_BUFFER_SIZE]>);

// SAFETY: the buffer is only ever handed out as raw memory; no Rust references escape.
unsafe impl Sync for StaticBuffer {}

pub struct CallocBootstrap {
    state: AtomicU8,
    real: NextSymbol<CallocFn>,
    buffer: StaticBuffer,
    // Bump offset into `buffer`; slices are never reused, so they stay zeroed.
    used: AtomicUsize,
}

static GLOBAL: CallocBootstrap = CallocBootstrap::new("calloc\0");

pub fn global() -> &'static CallocBootstrap {
    &GLOBAL
}

impl CallocBootstrap {
    pub const fn new(symbol: &'static str) -> Self {
        Self {
            state: AtomicU8::new(NOT_STARTED),
            real: NextSymbol::new(symbol),
            buffer: StaticBuffer(UnsafeCell::new([0; STATIC_BUFFER_SIZE])),
            used: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> BootstrapState {
        match self.state.load(Ordering::Acquire) {
            NOT_STARTED => BootstrapState::NotStarted,
            IN_FLIGHT => BootstrapState::InFlight,
            READY => BootstrapState::Ready,
            _ => BootstrapState::Failed,
        }
    }

    /// Resolves the real `calloc`. Only the first call does anything.
    pub fn run(&self) {
        if !self.begin() {
            return;
        }
        let resolved = self.real.try_get();
        self.finish(resolved.is_ok());
        guard::suspended(|| match resolved {
            Ok(_) => debug!("calloc resolved"),
            Err(err) => warn!(%err, "calloc unavailable, zero-allocation will fail"),
        });
    }

    pub(crate) fn begin(&self) -> bool {
        self.state
            .compare_exchange(NOT_STARTED, IN_FLIGHT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish(&self, resolved: bool) {
        self.state.store(if resolved { READY } else { FAILED }, Ordering::Release);
    }

    /// # Safety
    /// Same contract as the platform `calloc`.
    pub unsafe fn calloc(&self, interposer: &Interposer<'_>, nmemb: usize, size: usize) -> *mut c_void {
        match self.state.load(Ordering::Acquire) {
            READY => interposer.calloc(self.real.get(), nmemb, size),
            IN_FLIGHT => self.static_response(nmemb, size),
            _ => null_mut(),
        }
    }

    /// Whether `ptr` points into the static buffer.
    pub fn owns(&self, ptr: *const c_void) -> bool {
        let base = self.buffer.0.get() as usize;
        (base..base + STATIC_BUFFER_SIZE).contains(&(ptr as usize))
    }

    /// Moves a static-buffer block into a block from `alloc`, copying what fits.
    ///
    /// # Safety
    /// `ptr` must satisfy [`Self::owns`].
    pub unsafe fn relocate(
        &self,
        ptr: *mut c_void,
        size: usize,
        alloc: impl FnOnce(usize) -> *mut c_void,
    ) -> *mut c_void {
        let fresh = alloc(size);
        if !fresh.is_null() {
            let offset = ptr as usize - self.buffer.0.get() as usize;
            let len = size.min(STATIC_BUFFER_SIZE - offset);
            ptr::copy_nonoverlapping(ptr.cast::<u8>(), fresh.cast::<u8>(), len);
        }
        fresh
    }

    unsafe fn static_response(&self, nmemb: usize, size: usize) -> *mut c_void {
        let Some(bytes) = nmemb.checked_mul(size) else { return null_mut() };
        let Some(rounded) = bytes.max(1).checked_add(STATIC_ALIGN - 1) else { return null_mut() };
        let rounded = rounded & !(STATIC_ALIGN - 1);
        let claimed = self.used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
            used.checked_add(rounded).filter(|&end| end <= STATIC_BUFFER_SIZE)
        });
        match claimed {
            Ok(offset) => self.buffer.0.get().cast::<u8>().add(offset).cast(),
            Err(_) => null_mut(),
        }
    }
}

/// Load-time initializer in the first `.init_array` slot open to applications.
#[cfg(all(target_os = "linux", not(test)))]
mod initializer {
    #[used]
    #[link_section = ".init_array.00101"]
    static BOOTSTRAP: extern "C" fn() = bootstrap;

    extern "C" fn bootstrap() {
        let _ = crate::AccountingConfig::from_env();
        super::global().run();
    }
}
