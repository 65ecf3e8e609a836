//! The exported C surface.
//!
//! The allocation family and `pthread_create` are exported only from non-test
//! builds; a test binary keeps the platform allocator. The reporting functions are
//! always exported so a consumer can find them with `dlsym(RTLD_DEFAULT, ..)`.

use crate::guard;
use crate::registry::{self, Registry};
use std::ffi::c_int;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem::ManuallyDrop;
use std::os::unix::io::FromRawFd;

/// One thread's drained counters, as written by
/// [`malloc_accounting_snapshot_and_reset`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThreadUsageRecord {
    pub thread_id: u64,
    pub allocated: u64,
    pub deallocated: u64,
}

/// Drains `registry` into `out`, writing at most `capacity` records.
///
/// Returns the number of live threads drained, which may exceed `capacity`.
///
/// # Safety
/// `out` must be null or valid for `capacity` writes.
pub unsafe fn snapshot_into(
    registry: &Registry,
    out: *mut ThreadUsageRecord,
    capacity: usize,
) -> usize {
    let mut written = 0;
    registry.drain_each(|thread_id, usage| {
        if !out.is_null() && written < capacity {
            out.add(written).write(ThreadUsageRecord {
                thread_id,
                allocated: usage.allocated,
                deallocated: usage.deallocated,
            });
            written += 1;
        }
    })
}

/// Writes both event logs of `registry` to `fd` without closing it.
pub fn dump_logs_to_fd(registry: &Registry, fd: c_int) -> c_int {
    if fd < 0 {
        return -1;
    }
    guard::suspended(|| {
        // SAFETY: the descriptor stays owned by the caller.
        let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
        let mut out = BufWriter::new(&mut *file);
        match registry.dump_logs(&mut out).and_then(|()| out.flush()) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    })
}

#[no_mangle]
pub extern "C" fn malloc_accounting_net_process_bytes() -> i64 {
    registry::global().net_process_bytes()
}

/// # Safety
/// `out` must be null or valid for `capacity` writes.
#[no_mangle]
pub unsafe extern "C" fn malloc_accounting_snapshot_and_reset(
    out: *mut ThreadUsageRecord,
    capacity: usize,
) -> usize {
    snapshot_into(registry::global(), out, capacity)
}

#[no_mangle]
pub extern "C" fn malloc_accounting_dump_logs(fd: c_int) -> c_int {
    dump_logs_to_fd(registry::global(), fd)
}

/// # Safety
/// Each pointer must be null or valid for a write.
#[no_mangle]
pub unsafe extern "C" fn malloc_accounting_log_lengths(alloc_len: *mut usize, free_len: *mut usize) {
    let registry = registry::global();
    if !alloc_len.is_null() {
        *alloc_len = registry.allocation_log().len();
    }
    if !free_len.is_null() {
        *free_len = registry.free_log().len();
    }
}

#[cfg(all(target_os = "linux", not(test)))]
mod exports {
    use crate::allocator::{
        self, AlignedAllocFn, FreeFn, MallocFn, PageAllocFn, PosixMemalignFn, ReallocArrayFn,
        ReallocFn,
    };
    use crate::bootstrap;
    use crate::registry;
    use crate::resolve::NextSymbol;
    use crate::thread::{self, PthreadCreateFn, StartRoutine};
    use std::ffi::{c_int, c_void};
    use std::ptr::null_mut;

    static REAL_MALLOC: NextSymbol<MallocFn> = NextSymbol::new("malloc\0");
    static REAL_REALLOC: NextSymbol<ReallocFn> = NextSymbol::new("realloc\0");
    static REAL_REALLOCARRAY: NextSymbol<ReallocArrayFn> = NextSymbol::new("reallocarray\0");
    static REAL_POSIX_MEMALIGN: NextSymbol<PosixMemalignFn> =
        NextSymbol::new("posix_memalign\0");
    static REAL_ALIGNED_ALLOC: NextSymbol<AlignedAllocFn> = NextSymbol::new("aligned_alloc\0");
    static REAL_MEMALIGN: NextSymbol<AlignedAllocFn> = NextSymbol::new("memalign\0");
    static REAL_VALLOC: NextSymbol<PageAllocFn> = NextSymbol::new("valloc\0");
    static REAL_PVALLOC: NextSymbol<PageAllocFn> = NextSymbol::new("pvalloc\0");
    static REAL_FREE: NextSymbol<FreeFn> = NextSymbol::new("free\0");
    static REAL_PTHREAD_CREATE: NextSymbol<PthreadCreateFn> = NextSymbol::new("pthread_create\0");

    #[no_mangle]
    pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
        allocator::global().malloc(REAL_MALLOC.get(), size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
        bootstrap::global().calloc(allocator::global(), nmemb, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
        let bootstrap = bootstrap::global();
        if bootstrap.owns(ptr) {
            return bootstrap.relocate(ptr, size, |n| malloc(n));
        }
        allocator::global().realloc(REAL_REALLOC.get(), ptr, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn reallocarray(
        ptr: *mut c_void,
        nmemb: usize,
        size: usize,
    ) -> *mut c_void {
        let bootstrap = bootstrap::global();
        if bootstrap.owns(ptr) {
            let Some(bytes) = nmemb.checked_mul(size) else { return null_mut() };
            return bootstrap.relocate(ptr, bytes, |n| malloc(n));
        }
        allocator::global().reallocarray(REAL_REALLOCARRAY.get(), ptr, nmemb, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn posix_memalign(
        memptr: *mut *mut c_void,
        alignment: usize,
        size: usize,
    ) -> c_int {
        allocator::global().posix_memalign(REAL_POSIX_MEMALIGN.get(), memptr, alignment, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
        allocator::global().aligned_alloc(REAL_ALIGNED_ALLOC.get(), alignment, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
        allocator::global().memalign(REAL_MEMALIGN.get(), alignment, size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
        allocator::global().valloc(REAL_VALLOC.get(), size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
        allocator::global().pvalloc(REAL_PVALLOC.get(), size)
    }

    #[no_mangle]
    pub unsafe extern "C" fn free(ptr: *mut c_void) {
        // Static-buffer blocks were never the real allocator's.
        if bootstrap::global().owns(ptr) {
            return;
        }
        allocator::global().free(REAL_FREE.get(), ptr)
    }

    #[no_mangle]
    pub unsafe extern "C" fn pthread_create(
        native: *mut libc::pthread_t,
        attr: *const libc::pthread_attr_t,
        start_routine: Option<StartRoutine>,
        arg: *mut c_void,
    ) -> c_int {
        thread::spawn(
            REAL_PTHREAD_CREATE.get(),
            registry::global(),
            native,
            attr,
            start_routine,
            arg,
        )
    }
}
