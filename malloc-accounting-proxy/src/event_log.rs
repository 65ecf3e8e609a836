use std::fmt;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

/// Entries kept per log before new events are dropped.
pub const LOG_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Allocate,
    Free,
}

/// One logged allocator event: which function produced or released which address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventEntry {
    pub kind: EventKind,
    pub function: &'static str,
    pub address: usize,
}

impl fmt::Display for EventEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EventKind::Allocate => {
                write!(f, "allocate type: {}, addr: {:#x}", self.function, self.address)
            }
            EventKind::Free => write!(f, "free addr: {:#x}", self.address),
        }
    }
}

/// Append-only sequence capped at `capacity`; overflowing pushes are dropped.
///
/// The capacity check and the append happen under one lock.
pub struct BoundedLog<T> {
    capacity: usize,
    entries: Mutex<Vec<T>>,
}

impl<T: Clone> BoundedLog<T> {
    pub const fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(Vec::new()) }
    }

    /// Returns `false` when the entry was dropped because the log is full.
    pub fn push(&self, entry: T) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            return false;
        }
        entries.push(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Writes every entry, one per line.
    ///
    /// Writes from a copy, so a slow or blocking `out` never holds up concurrent pushes.
    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<usize>
    where
        T: fmt::Display,
    {
        let entries = self.to_vec();
        for entry in &entries {
            writeln!(out, "{}", entry)?;
        }
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: usize) -> EventEntry {
        EventEntry { kind: EventKind::Allocate, function: "malloc", address }
    }

    #[test]
    fn drops_entries_past_capacity() {
        let log = BoundedLog::new(3);
        assert!(log.push(entry(1)));
        assert!(log.push(entry(2)));
        assert!(log.push(entry(3)));
        assert!(!log.push(entry(4)));
        assert_eq!(log.len(), 3);
        assert_eq!(log.to_vec().last().map(|e| e.address), Some(3));
    }

    #[test]
    fn full_size_log_holds_exactly_capacity() {
        let log = BoundedLog::new(LOG_CAPACITY);
        let accepted = (0..LOG_CAPACITY + 1).filter(|&i| log.push(entry(i))).count();
        assert_eq!(accepted, LOG_CAPACITY);
        assert_eq!(log.len(), LOG_CAPACITY);
    }

    #[test]
    fn concurrent_pushes_never_exceed_capacity() {
        let log = std::sync::Arc::new(BoundedLog::new(1000));
        let workers: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        log.push(entry(t * 1000 + i));
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(log.len(), 1000);
    }

    #[test]
    fn renders_entries() {
        let alloc = EventEntry { kind: EventKind::Allocate, function: "calloc", address: 0x1000 };
        let free = EventEntry { kind: EventKind::Free, function: "free", address: 0x2a };
        assert_eq!(alloc.to_string(), "allocate type: calloc, addr: 0x1000");
        assert_eq!(free.to_string(), "free addr: 0x2a");

        let log = BoundedLog::new(4);
        log.push(alloc);
        log.push(free);
        let mut out = Vec::new();
        assert_eq!(log.write_to(&mut out).unwrap(), 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "allocate type: calloc, addr: 0x1000\nfree addr: 0x2a\n"
        );
    }

    struct PushingWriter<'a> {
        log: &'a BoundedLog<EventEntry>,
        written: Vec<u8>,
    }

    impl Write for PushingWriter<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            // Would block forever if the dump still held the lock.
            self.log.push(entry(0xdead));
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writer_may_push_while_dumping() {
        let log = BoundedLog::new(16);
        log.push(entry(1));
        log.push(entry(2));
        let mut out = PushingWriter { log: &log, written: Vec::new() };
        assert_eq!(log.write_to(&mut out).unwrap(), 2);
        assert!(log.len() > 2);
        assert!(String::from_utf8(out.written).unwrap().contains("addr: 0x2"));
    }
}
