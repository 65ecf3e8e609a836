//! Accounting around the platform allocation family.
//!
//! [`Interposer`] does not own any memory. Each operation receives the resolved real
//! function (`None` when resolution failed), calls it with the caller's arguments and
//! then charges the block's usable size to the current thread and the process.

use crate::config;
use crate::descriptor;
use crate::guard::ReentryGuard;
use crate::registry::{self, Registry};
use std::ffi::{c_int, c_void};
use std::ptr::null_mut;

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
pub type ReallocArrayFn = unsafe extern "C" fn(*mut c_void, usize, usize) -> *mut c_void;
pub type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int;
/// `aligned_alloc` and `memalign`.
pub type AlignedAllocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
/// `valloc` and `pvalloc`.
pub type PageAllocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type UsableSizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

pub struct Interposer<'r> {
    registry: &'r Registry,
    usable_size: UsableSizeFn,
}

static GLOBAL: Interposer<'static> = Interposer::new(&registry::GLOBAL, libc::malloc_usable_size);

/// The interposer charging the process-wide registry.
pub fn global() -> &'static Interposer<'static> {
    &GLOBAL
}

impl<'r> Interposer<'r> {
    pub const fn new(registry: &'r Registry, usable_size: UsableSizeFn) -> Self {
        Self { registry, usable_size }
    }

    /// # Safety
    /// `real` must be the platform `malloc` or compatible.
    pub unsafe fn malloc(&self, real: Option<MallocFn>, size: usize) -> *mut c_void {
        let Some(real) = real else { return null_mut() };
        let Some(_guard) = ReentryGuard::enter() else { return real(size) };
        let ptr = real(size);
        self.charge_new("malloc", ptr);
        ptr
    }

    /// # Safety
    /// `real` must be the platform `calloc` or compatible.
    pub unsafe fn calloc(&self, real: Option<CallocFn>, nmemb: usize, size: usize) -> *mut c_void {
        let Some(real) = real else { return null_mut() };
        let Some(_guard) = ReentryGuard::enter() else { return real(nmemb, size) };
        let ptr = real(nmemb, size);
        self.charge_new("calloc", ptr);
        ptr
    }

    /// Only a relocation that lands in a larger usable block is charged, and only the
    /// growth. Shrinking, or resizing in place, records nothing.
    ///
    /// # Safety
    /// `ptr` must be null or a live block from the real allocator.
    pub unsafe fn realloc(
        &self,
        real: Option<ReallocFn>,
        ptr: *mut c_void,
        size: usize,
    ) -> *mut c_void {
        let Some(real) = real else { return null_mut() };
        let Some(_guard) = ReentryGuard::enter() else { return real(ptr, size) };
        if ptr.is_null() {
            let fresh = real(ptr, size);
            self.charge_new("realloc", fresh);
            return fresh;
        }
        // Must be measured first: the old block may be gone afterwards.
        let original = (self.usable_size)(ptr);
        let moved = real(ptr, size);
        self.charge_growth("realloc", ptr, moved, original);
        moved
    }

    /// # Safety
    /// `ptr` must be null or a live block from the real allocator.
    pub unsafe fn reallocarray(
        &self,
        real: Option<ReallocArrayFn>,
        ptr: *mut c_void,
        nmemb: usize,
        size: usize,
    ) -> *mut c_void {
        let Some(real) = real else { return null_mut() };
        let Some(_guard) = ReentryGuard::enter() else { return real(ptr, nmemb, size) };
        if ptr.is_null() {
            let fresh = real(ptr, nmemb, size);
            self.charge_new("reallocarray", fresh);
            return fresh;
        }
        let original = (self.usable_size)(ptr);
        let moved = real(ptr, nmemb, size);
        self.charge_growth("reallocarray", ptr, moved, original);
        moved
    }

    /// Returns `ENOMEM` when the real function could not be resolved.
    ///
    /// # Safety
    /// `memptr` must be valid for writes.
    pub unsafe fn posix_memalign(
        &self,
        real: Option<PosixMemalignFn>,
        memptr: *mut *mut c_void,
        alignment: usize,
        size: usize,
    ) -> c_int {
        let Some(real) = real else { return libc::ENOMEM };
        let Some(_guard) = ReentryGuard::enter() else { return real(memptr, alignment, size) };
        let rc = real(memptr, alignment, size);
        if rc == 0 && !memptr.is_null() {
            self.charge_new("posix_memalign", *memptr);
        }
        rc
    }

    /// # Safety
    /// `real` must be the platform `aligned_alloc` or compatible.
    pub unsafe fn aligned_alloc(
        &self,
        real: Option<AlignedAllocFn>,
        alignment: usize,
        size: usize,
    ) -> *mut c_void {
        self.aligned("aligned_alloc", real, alignment, size)
    }

    /// # Safety
    /// `real` must be the platform `memalign` or compatible.
    pub unsafe fn memalign(
        &self,
        real: Option<AlignedAllocFn>,
        alignment: usize,
        size: usize,
    ) -> *mut c_void {
        self.aligned("memalign", real, alignment, size)
    }

    /// # Safety
    /// `real` must be the platform `valloc` or compatible.
    pub unsafe fn valloc(&self, real: Option<PageAllocFn>, size: usize) -> *mut c_void {
        self.page_aligned("valloc", real, size)
    }

    /// # Safety
    /// `real` must be the platform `pvalloc` or compatible.
    pub unsafe fn pvalloc(&self, real: Option<PageAllocFn>, size: usize) -> *mut c_void {
        self.page_aligned("pvalloc", real, size)
    }

    /// Null is a no-op. Otherwise the block is measured and charged as freed before it
    /// is handed to the real `free`.
    ///
    /// # Safety
    /// `ptr` must be null or a live block from the real allocator.
    pub unsafe fn free(&self, real: Option<FreeFn>, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        let Some(real) = real else { return };
        let Some(_guard) = ReentryGuard::enter() else { return real(ptr) };
        let size = (self.usable_size)(ptr);
        self.record_deallocation(ptr, size);
        real(ptr)
    }

    unsafe fn aligned(
        &self,
        function: &'static str,
        real: Option<AlignedAllocFn>,
        alignment: usize,
        size: usize,
    ) -> *mut c_void {
        let Some(real) = real else { return null_mut() };
        let Some(_guard) = ReentryGuard::enter() else { return real(alignment, size) };
        let ptr = real(alignment, size);
        self.charge_new(function, ptr);
        ptr
    }

    unsafe fn page_aligned(
        &self,
        function: &'static str,
        real: Option<PageAllocFn>,
        size: usize,
    ) -> *mut c_void {
        let Some(real) = real else { return null_mut() };
        let Some(_guard) = ReentryGuard::enter() else { return real(size) };
        let ptr = real(size);
        self.charge_new(function, ptr);
        ptr
    }

    unsafe fn charge_new(&self, function: &'static str, ptr: *mut c_void) {
        if !ptr.is_null() {
            let size = (self.usable_size)(ptr);
            self.record_allocation(function, ptr, size);
        }
    }

    unsafe fn charge_growth(
        &self,
        function: &'static str,
        old: *mut c_void,
        new: *mut c_void,
        original: usize,
    ) {
        if new.is_null() || new == old {
            return;
        }
        let grown = (self.usable_size)(new).saturating_sub(original);
        if grown > 0 {
            self.record_allocation(function, new, grown);
        }
    }

    fn record_allocation(&self, function: &'static str, ptr: *mut c_void, size: usize) {
        descriptor::with_current(|thread| {
            if let Some(thread) = thread {
                thread.record_allocated(size as u64);
            }
        });
        self.registry.add_net_bytes(size as i64);
        if config::event_log_enabled() {
            self.registry.log_allocation(function, ptr as usize);
        }
    }

    fn record_deallocation(&self, ptr: *mut c_void, size: usize) {
        descriptor::with_current(|thread| {
            if let Some(thread) = thread {
                thread.record_deallocated(size as u64);
            }
        });
        self.registry.add_net_bytes(-(size as i64));
        if config::event_log_enabled() {
            self.registry.log_free(ptr as usize);
        }
    }
}
