use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) static EVENT_LOG_ENABLED: AtomicBool = AtomicBool::new(true);
pub(crate) static THREAD_TRACKING_ENABLED: AtomicBool = AtomicBool::new(true);

const EVENT_LOG_ENV: &[u8] = b"MALLOC_ACCOUNTING_EVENT_LOG\0";
const THREADS_ENV: &[u8] = b"MALLOC_ACCOUNTING_THREADS\0";

#[derive(Default)]
pub struct AccountingConfig {}

impl AccountingConfig {
    /// Append allocate/free events to the bounded logs
    pub fn enable_event_log(self, value: bool) -> Self {
        EVENT_LOG_ENABLED.store(value, Ordering::Relaxed);
        self
    }

    /// Give threads spawned through `pthread_create` their own descriptor
    pub fn enable_thread_tracking(self, value: bool) -> Self {
        THREAD_TRACKING_ENABLED.store(value, Ordering::Relaxed);
        self
    }

    /// Apply `MALLOC_ACCOUNTING_EVENT_LOG` and `MALLOC_ACCOUNTING_THREADS`.
    ///
    /// Uses `getenv` directly; safe to call before the allocator is usable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_flag(EVENT_LOG_ENV) {
            config = config.enable_event_log(value);
        }
        if let Some(value) = env_flag(THREADS_ENV) {
            config = config.enable_thread_tracking(value);
        }
        config
    }
}

pub fn event_log_enabled() -> bool {
    EVENT_LOG_ENABLED.load(Ordering::Relaxed)
}

pub fn thread_tracking_enabled() -> bool {
    THREAD_TRACKING_ENABLED.load(Ordering::Relaxed)
}

fn env_flag(name: &[u8]) -> Option<bool> {
    let value = unsafe { libc::getenv(name.as_ptr().cast()) };
    if value.is_null() {
        return None;
    }
    Some(parse_flag(unsafe { CStr::from_ptr(value) }.to_bytes()))
}

fn parse_flag(value: &[u8]) -> bool {
    !matches!(value, b"0" | b"false" | b"off" | b"no")
}
