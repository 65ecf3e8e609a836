//! `pthread_create` interposition.
//!
//! The caller's start routine is wrapped so that each spawned thread owns a
//! [`ThreadDescriptor`](crate::descriptor::ThreadDescriptor) for exactly as long as
//! the routine runs: registered before it starts, removed after it returns.
//!
//! A thread that leaves through `pthread_exit` skips the removal and its descriptor
//! stays registered.

use crate::config;
use crate::descriptor::{self, current_thread_id, DescriptorRef, OwnedDescriptor};
use crate::guard;
use crate::registry::Registry;
use std::alloc::{self, Layout};
use std::ffi::{c_int, c_void};
use std::ptr::NonNull;
use tracing::warn;

pub type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;
pub type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    StartRoutine,
    *mut c_void,
) -> c_int;

struct StartPackage {
    routine: StartRoutine,
    arg: *mut c_void,
    registry: &'static Registry,
}

/// Starts a thread through `real`, wrapping `routine` with descriptor bookkeeping.
///
/// Returns `EAGAIN` if `real` is unresolved or the start package cannot be allocated,
/// otherwise whatever `real` returns.
///
/// # Safety
/// Same contract as `pthread_create`.
pub unsafe fn spawn(
    real: Option<PthreadCreateFn>,
    registry: &'static Registry,
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    routine: Option<StartRoutine>,
    arg: *mut c_void,
) -> c_int {
    let Some(real) = real else { return libc::EAGAIN };
    let Some(routine) = routine else { return libc::EINVAL };
    if !config::thread_tracking_enabled() {
        return real(thread, attr, routine, arg);
    }

    let package = guard::suspended(|| try_box(StartPackage { routine, arg, registry }));
    let Some(package) = package else { return libc::EAGAIN };

    let rc = real(thread, attr, thread_start, package.as_ptr().cast());
    if rc != 0 {
        // The wrapper never ran, so the package is still ours.
        guard::suspended(|| drop(Box::from_raw(package.as_ptr())));
    }
    rc
}

extern "C" fn thread_start(raw: *mut c_void) -> *mut c_void {
    // SAFETY: `spawn` hands over exactly one package per started thread.
    let package = unsafe { Box::from_raw(raw.cast::<StartPackage>()) };
    let scope = ThreadScope::enter(package.registry);
    let result = (package.routine)(package.arg);
    drop(scope);
    guard::suspended(|| drop(package));
    result
}

/// Registration of the current thread's descriptor, undone on drop.
struct ThreadScope {
    registry: &'static Registry,
    descriptor: Option<DescriptorRef>,
}

impl ThreadScope {
    fn enter(registry: &'static Registry) -> ThreadScope {
        let descriptor = guard::suspended(|| {
            let Some(owned) = OwnedDescriptor::try_new(current_thread_id()) else {
                warn!("no memory for a thread descriptor, thread runs untracked");
                return None;
            };
            let handle = owned.handle();
            registry.register(handle);
            match descriptor::install_current(owned) {
                Ok(()) => Some(handle),
                Err(owned) => {
                    registry.unregister(owned.handle());
                    None
                }
            }
        });
        ThreadScope { registry, descriptor }
    }
}

impl Drop for ThreadScope {
    fn drop(&mut self) {
        if let Some(handle) = self.descriptor.take() {
            guard::suspended(|| {
                self.registry.unregister(handle);
                drop(descriptor::take_current());
            });
        }
    }
}

fn try_box<T>(value: T) -> Option<NonNull<T>> {
    let layout = Layout::new::<T>();
    let ptr = NonNull::new(unsafe { alloc::alloc(layout) }.cast::<T>())?;
    unsafe { ptr.as_ptr().write(value) };
    Some(ptr)
}
