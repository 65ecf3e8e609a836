use anyhow::{bail, Context};
use std::ffi::{c_int, CStr};

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ThreadUsageRecord {
    pub thread_id: u64,
    pub allocated: u64,
    pub deallocated: u64,
}

type NetBytesFn = unsafe extern "C" fn() -> i64;
type SnapshotFn = unsafe extern "C" fn(*mut ThreadUsageRecord, usize) -> usize;
type DumpFn = unsafe extern "C" fn(c_int) -> c_int;
type LogLengthsFn = unsafe extern "C" fn(*mut usize, *mut usize);

/// The reporting functions exported by the preloaded proxy.
pub(crate) struct AccountingApi {
    net_bytes: NetBytesFn,
    snapshot: SnapshotFn,
    dump: DumpFn,
    log_lengths: LogLengthsFn,
}

fn lookup(name: &CStr) -> anyhow::Result<usize> {
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if addr.is_null() {
        bail!("symbol {:?} not found", name);
    }
    Ok(addr as usize)
}

macro_rules! locate {
    ($name:literal, $ty:ty) => {{
        let addr = lookup(CStr::from_bytes_with_nul(concat!($name, "\0").as_bytes())?)
            .with_context(|| format!("{} is not exported", $name))?;
        unsafe { std::mem::transmute::<usize, $ty>(addr) }
    }};
}

impl AccountingApi {
    pub(crate) fn locate() -> anyhow::Result<Self> {
        Ok(Self {
            net_bytes: locate!("malloc_accounting_net_process_bytes", NetBytesFn),
            snapshot: locate!("malloc_accounting_snapshot_and_reset", SnapshotFn),
            dump: locate!("malloc_accounting_dump_logs", DumpFn),
            log_lengths: locate!("malloc_accounting_log_lengths", LogLengthsFn),
        })
    }

    pub(crate) fn net_process_bytes(&self) -> i64 {
        unsafe { (self.net_bytes)() }
    }

    /// Drains every live thread's counters.
    pub(crate) fn snapshot_and_reset(&self) -> Vec<ThreadUsageRecord> {
        let mut records = vec![ThreadUsageRecord::default(); 64];
        let drained = unsafe { (self.snapshot)(records.as_mut_ptr(), records.len()) };
        records.truncate(drained);
        records
    }

    pub(crate) fn dump_logs(&self, fd: c_int) -> anyhow::Result<()> {
        if unsafe { (self.dump)(fd) } != 0 {
            bail!("write to fd {} failed", fd);
        }
        Ok(())
    }

    pub(crate) fn log_lengths(&self) -> (usize, usize) {
        let (mut alloc_len, mut free_len) = (0, 0);
        unsafe { (self.log_lengths)(&mut alloc_len, &mut free_len) };
        (alloc_len, free_len)
    }
}
