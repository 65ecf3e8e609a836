//! Runs the whole test binary on an accounted allocator, so memory the registry itself
//! hands back to callers is measured the way a preloaded process measures it.

use malloc_accounting_proxy::allocator::Interposer;
use malloc_accounting_proxy::descriptor::OwnedDescriptor;
use malloc_accounting_proxy::Registry;
use std::alloc::{GlobalAlloc, Layout};
use std::ffi::c_void;

// Large enough that neither log fills up during the run.
static REGISTRY: Registry = Registry::with_log_capacity(1 << 20);

struct AccountedAllocator;

unsafe impl GlobalAlloc for AccountedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let interposer = Interposer::new(&REGISTRY, libc::malloc_usable_size);
        if layout.align() <= 16 {
            interposer.malloc(Some(libc::malloc), layout.size()).cast()
        } else {
            interposer.memalign(Some(libc::memalign), layout.align(), layout.size()).cast()
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let interposer = Interposer::new(&REGISTRY, libc::malloc_usable_size);
        interposer.free(Some(libc::free), ptr.cast::<c_void>())
    }
}

#[global_allocator]
static ALLOC: AccountedAllocator = AccountedAllocator;

#[test]
fn snapshot_leaves_net_bytes_unchanged() {
    let threads: Vec<_> = (1..=8).map(|tid| OwnedDescriptor::try_new(tid).unwrap()).collect();
    for t in &threads {
        REGISTRY.register(t.handle());
        t.record_allocated(tid_bytes(t.thread_id()));
    }

    let net_before = REGISTRY.net_process_bytes();
    let frees_before = REGISTRY.free_log().len();
    let allocations_before = REGISTRY.allocation_log().len();
    for _ in 0..10 {
        let snapshot = REGISTRY.snapshot_and_reset();
        assert_eq!(snapshot.len(), threads.len());
        drop(snapshot);
    }
    assert_eq!(REGISTRY.net_process_bytes(), net_before);
    // Every free the snapshots caused has a matching logged allocation.
    let frees = REGISTRY.free_log().len() - frees_before;
    let allocations = REGISTRY.allocation_log().len() - allocations_before;
    assert_eq!(frees, allocations);

    for t in &threads {
        REGISTRY.unregister(t.handle());
    }
}

fn tid_bytes(tid: u64) -> u64 {
    tid * 100
}
