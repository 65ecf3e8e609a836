#![deny(
    unused_crate_dependencies,
    unused_extern_crates,
    variant_size_differences
)]
//! Allocation accounting for a preloaded process.
//!
//! Built as a shared object and loaded ahead of the C library, this crate exports the
//! `malloc` family and `pthread_create`, forwards each call to the next definition in
//! the symbol search order, and keeps per-thread and process-wide byte counters.
//! Consumers read them through the `malloc_accounting_*` functions in [`abi`].

pub mod abi;
pub mod allocator;
pub mod bootstrap;
mod config;
pub mod descriptor;
pub mod event_log;
mod guard;
pub mod registry;
pub mod resolve;
pub mod thread;

pub use config::{event_log_enabled, thread_tracking_enabled, AccountingConfig};
pub use descriptor::ThreadUsage;
pub use registry::Registry;

/// Used by benches;
#[cfg(test)]
use criterion as _;
