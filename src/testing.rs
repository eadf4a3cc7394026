//! Helpers for testing parallel formatting without real files.

use anyhow::Result;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::format::RowFormat;

/// A cloneable in-memory sink.
///
/// One clone goes into the formatter as the downstream sink; the others stay
/// with the test to inspect the collected bytes and count flushes.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    flushes: Arc<AtomicUsize>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    /// Number of `flush` calls observed.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Text format that prefixes every row with its absolute row number.
///
/// Exercises first-row forwarding: batches formatted out of order still get
/// globally consistent numbering.
#[derive(Default)]
pub struct NumberedLines {
    next_row: u64,
}

impl<R: std::fmt::Display + Send> RowFormat<R> for NumberedLines {
    fn write_rows(&mut self, out: &mut Vec<u8>, rows: &[R]) -> Result<()> {
        for row in rows {
            out.extend_from_slice(format!("{}: {}\n", self.next_row, row).as_bytes());
            self.next_row += 1;
        }
        Ok(())
    }

    fn set_first_row_number(&mut self, row: u64) {
        self.next_row = row;
    }
}
