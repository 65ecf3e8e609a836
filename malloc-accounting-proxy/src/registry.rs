//! Process-wide accounting state: live thread descriptors, the net byte counter and
//! the bounded allocate/free logs.
//!
//! [`global()`] is a const-initialized static, so it exists before any constructor
//! runs and is never torn down. Tests build private instances with [`Registry::new`].

use crate::descriptor::{DescriptorRef, ThreadUsage};
use crate::event_log::{BoundedLog, EventEntry, EventKind, LOG_CAPACITY};
use crate::guard;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{info, trace};

pub struct Registry {
    threads: Mutex<BTreeMap<usize, DescriptorRef>>,
    net_bytes: AtomicI64,
    allocations: BoundedLog<EventEntry>,
    frees: BoundedLog<EventEntry>,
}

pub(crate) static GLOBAL: Registry = Registry::new();

pub fn global() -> &'static Registry {
    &GLOBAL
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub const fn new() -> Self {
        Self::with_log_capacity(LOG_CAPACITY)
    }

    pub const fn with_log_capacity(capacity: usize) -> Self {
        Self {
            threads: Mutex::new(BTreeMap::new()),
            net_bytes: AtomicI64::new(0),
            allocations: BoundedLog::new(capacity),
            frees: BoundedLog::new(capacity),
        }
    }

    pub fn register(&self, descriptor: DescriptorRef) {
        let tid = unsafe { descriptor.get() }.thread_id();
        self.lock_threads().insert(descriptor.addr(), descriptor);
        trace!(tid, "thread descriptor registered");
    }

    pub fn unregister(&self, descriptor: DescriptorRef) {
        let removed = self.lock_threads().remove(&descriptor.addr()).is_some();
        trace!(removed, "thread descriptor removed");
    }

    pub fn is_registered(&self, descriptor: DescriptorRef) -> bool {
        self.lock_threads().contains_key(&descriptor.addr())
    }

    pub fn live_threads(&self) -> usize {
        self.lock_threads().len()
    }

    #[inline]
    pub fn add_net_bytes(&self, delta: i64) {
        self.net_bytes.fetch_add(delta, Ordering::Relaxed);
    }

    /// Net bytes in use across the whole process. Non-destructive.
    pub fn net_process_bytes(&self) -> i64 {
        self.net_bytes.load(Ordering::Acquire)
    }

    /// Drains every live thread's accumulators, keyed by thread id.
    ///
    /// Destructive: each call returns what accumulated since the previous one. The map
    /// is allocated with accounting active, since the caller frees it with accounting
    /// active too.
    pub fn snapshot_and_reset(&self) -> BTreeMap<u64, ThreadUsage> {
        let mut snapshot = BTreeMap::new();
        self.drain_each(|thread_id, usage| {
            snapshot.insert(thread_id, usage);
        });
        snapshot
    }

    /// Like [`Self::snapshot_and_reset`], but hands each record to `sink` without
    /// building a map. Returns the number of descriptors drained.
    pub fn drain_each(&self, mut sink: impl FnMut(u64, ThreadUsage)) -> usize {
        let threads = self.lock_threads();
        for descriptor in threads.values() {
            // SAFETY: removal takes this lock before a descriptor is released.
            let descriptor = unsafe { descriptor.get() };
            sink(descriptor.thread_id(), descriptor.take());
        }
        threads.len()
    }

    pub fn log_allocation(&self, function: &'static str, address: usize) -> bool {
        self.allocations.push(EventEntry { kind: EventKind::Allocate, function, address })
    }

    pub fn log_free(&self, address: usize) -> bool {
        self.frees.push(EventEntry { kind: EventKind::Free, function: "free", address })
    }

    pub fn allocation_log(&self) -> &BoundedLog<EventEntry> {
        &self.allocations
    }

    pub fn free_log(&self) -> &BoundedLog<EventEntry> {
        &self.frees
    }

    /// Writes both logs to `out` for manual inspection.
    pub fn dump_logs(&self, out: &mut dyn Write) -> io::Result<()> {
        guard::suspended(|| {
            writeln!(out, "allocate addrs: ")?;
            let allocations = self.allocations.write_to(out)?;
            writeln!(out, "free addrs: ")?;
            let frees = self.frees.write_to(out)?;
            info!(allocations, frees, net_bytes = self.net_process_bytes(), "dumped event logs");
            Ok(())
        })
    }

    fn lock_threads(&self) -> std::sync::MutexGuard<'_, BTreeMap<usize, DescriptorRef>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
