use std::alloc::{self, Layout};
use std::cell::Cell;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative bytes allocated and freed by one thread since the last snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThreadUsage {
    pub allocated: u64,
    pub deallocated: u64,
}

/// Per-thread accounting record.
///
/// Only the owning thread increments the accumulators; the registry reads and resets
/// them during a snapshot.
#[derive(Debug)]
pub struct ThreadDescriptor {
    thread_id: u64,
    allocated: AtomicU64,
    deallocated: AtomicU64,
}

impl ThreadDescriptor {
    pub const fn new(thread_id: u64) -> Self {
        Self { thread_id, allocated: AtomicU64::new(0), deallocated: AtomicU64::new(0) }
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    #[inline]
    pub fn record_allocated(&self, bytes: u64) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_deallocated(&self, bytes: u64) {
        self.deallocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Reads both accumulators and resets them to zero.
    pub fn take(&self) -> ThreadUsage {
        ThreadUsage {
            allocated: self.allocated.swap(0, Ordering::AcqRel),
            deallocated: self.deallocated.swap(0, Ordering::AcqRel),
        }
    }

    /// Reads both accumulators without resetting them.
    pub fn peek(&self) -> ThreadUsage {
        ThreadUsage {
            allocated: self.allocated.load(Ordering::Acquire),
            deallocated: self.deallocated.load(Ordering::Acquire),
        }
    }
}

/// Identity handle of a descriptor, used as the registry's membership key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DescriptorRef(NonNull<ThreadDescriptor>);

// SAFETY: the pointee is only mutated through atomics.
unsafe impl Send for DescriptorRef {}
unsafe impl Sync for DescriptorRef {}

impl DescriptorRef {
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// The descriptor must not have been released.
    pub(crate) unsafe fn get<'a>(self) -> &'a ThreadDescriptor {
        &*self.0.as_ptr()
    }
}

/// Heap-owned descriptor allocated fallibly, so thread start survives out-of-memory.
#[derive(Debug)]
pub struct OwnedDescriptor(NonNull<ThreadDescriptor>);

unsafe impl Send for OwnedDescriptor {}

impl OwnedDescriptor {
    pub fn try_new(thread_id: u64) -> Option<Self> {
        let layout = Layout::new::<ThreadDescriptor>();
        let raw = unsafe { alloc::alloc(layout) }.cast::<ThreadDescriptor>();
        let ptr = NonNull::new(raw)?;
        unsafe { ptr.as_ptr().write(ThreadDescriptor::new(thread_id)) };
        Some(Self(ptr))
    }

    pub fn handle(&self) -> DescriptorRef {
        DescriptorRef(self.0)
    }
}

impl Deref for OwnedDescriptor {
    type Target = ThreadDescriptor;

    fn deref(&self) -> &ThreadDescriptor {
        unsafe { self.0.as_ref() }
    }
}

impl Drop for OwnedDescriptor {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.0.as_ptr());
            alloc::dealloc(self.0.as_ptr().cast(), Layout::new::<ThreadDescriptor>());
        }
    }
}

thread_local! {
    // Owning pointer; set by the thread-start wrapper, taken back before thread end.
    static CURRENT: Cell<*mut ThreadDescriptor> = const { Cell::new(ptr::null_mut()) };
}

/// Hands ownership of `descriptor` to the current thread's slot.
///
/// Returns the descriptor back if the slot is already occupied or unavailable.
pub fn install_current(descriptor: OwnedDescriptor) -> Result<(), OwnedDescriptor> {
    let raw = descriptor.0.as_ptr();
    let installed = CURRENT
        .try_with(|slot| {
            if slot.get().is_null() {
                slot.set(raw);
                true
            } else {
                false
            }
        })
        .unwrap_or(false);
    if installed {
        std::mem::forget(descriptor);
        Ok(())
    } else {
        Err(descriptor)
    }
}

/// Clears the current thread's slot, returning ownership of its descriptor.
pub fn take_current() -> Option<OwnedDescriptor> {
    let raw = CURRENT.try_with(|slot| slot.replace(ptr::null_mut())).unwrap_or(ptr::null_mut());
    NonNull::new(raw).map(OwnedDescriptor)
}

/// Runs `f` with the descriptor of the current thread, if it has one.
#[inline]
pub fn with_current<R>(f: impl FnOnce(Option<&ThreadDescriptor>) -> R) -> R {
    let raw = CURRENT.try_with(Cell::get).unwrap_or(ptr::null_mut());
    // SAFETY: the slot owns the pointee until `take_current` runs on this same thread.
    f(unsafe { raw.as_ref() })
}

#[cfg(target_os = "linux")]
pub fn current_thread_id() -> u64 {
    nix::unistd::gettid().as_raw() as u64
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}
