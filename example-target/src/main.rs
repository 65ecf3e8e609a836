mod report;

use crate::report::AccountingApi;
use anyhow::Context;
use clap::Parser;
use std::sync::{Arc, Barrier};
use tracing::info;
use tracing_subscriber::util::SubscriberInitExt;

/// Allocates from a few worker threads and prints what the preloaded proxy saw.
///
/// Run as `LD_PRELOAD=target/release/libmalloc_accounting_proxy.so example-target`.
#[derive(clap_derive::Parser, Debug)]
#[clap(version = "0.1")]
struct Opts {
    /// Number of worker threads
    #[clap(long, default_value = "4")]
    threads: usize,
    /// Allocations made by each worker
    #[clap(long, default_value = "1000")]
    allocations: usize,
    /// Size of each allocation in bytes
    #[clap(long, default_value = "256")]
    size: usize,
    /// Skip dumping the event logs to stderr
    #[clap(long)]
    no_dump: bool,
}

#[inline(never)]
fn work(allocations: usize, size: usize, barrier: &Barrier) -> usize {
    let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(allocations);
    for i in 0..allocations {
        blocks.push(vec![i as u8; size]);
    }
    // Keep every other block alive until the report has been taken.
    let mut kept = 0;
    blocks.retain(|_| {
        kept += 1;
        kept % 2 == 0
    });
    barrier.wait();
    barrier.wait();
    blocks.len()
}

fn main() -> anyhow::Result<()> {
    let format = tracing_subscriber::fmt::format()
        .with_level(true) // don't include levels in formatted output
        .with_target(true) // don't include targets
        .without_time();
    tracing_subscriber::fmt().event_format(format).with_writer(std::io::stderr).finish().init();
    let opts = Opts::parse();
    info!(?opts);

    let api = AccountingApi::locate()
        .with_context(|| "run with LD_PRELOAD=libmalloc_accounting_proxy.so")?;
    // Drop whatever the runtime allocated during startup.
    let _ = api.snapshot_and_reset();
    let start_bytes = api.net_process_bytes();

    let barrier = Arc::new(Barrier::new(opts.threads + 1));
    let workers = (0..opts.threads)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let (allocations, size) = (opts.allocations, opts.size);
            std::thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || work(allocations, size, &barrier))
                .with_context(|| format!("spawn worker-{} failed", i))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    barrier.wait();
    let usage = api.snapshot_and_reset();
    info!(net_bytes = api.net_process_bytes() - start_bytes, live_threads = usage.len());
    for record in &usage {
        info!(
            thread_id = record.thread_id,
            allocated = record.allocated,
            deallocated = record.deallocated,
            retained = record.allocated as i64 - record.deallocated as i64
        );
    }
    barrier.wait();

    for worker in workers {
        let kept = worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
        info!(kept);
    }
    info!(net_bytes_after_join = api.net_process_bytes() - start_bytes);

    let (alloc_len, free_len) = api.log_lengths();
    info!(alloc_len, free_len);
    if !opts.no_dump {
        api.dump_logs(libc::STDERR_FILENO).with_context(|| "dump_logs failed")?;
    }
    Ok(())
}
