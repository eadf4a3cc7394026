//! The inner-formatter seam.
//!
//! A [`RowFormat`] turns row batches into bytes. The parallel core creates a
//! **fresh** formatter per ticket through a [`FormatFactory`] and points it at
//! the slot's private byte buffer, so implementations never need to be
//! thread-safe themselves; they only need to be `Send` so a worker thread can
//! run them.

use anyhow::Result;
use std::sync::Arc;

use crate::stats::Statistics;

/// Creates one formatter per ticket. Called once at construction to query the
/// capability flags, then once per scheduled unit.
pub type FormatFactory<R> = Arc<dyn Fn() -> Box<dyn RowFormat<R>> + Send + Sync>;

/// A serializer from row batches to bytes.
///
/// All methods append to `out` and must leave it in a complete state on
/// return: the parallel core concatenates the buffers of consecutive tickets
/// verbatim, so any internal buffering (e.g. a `csv::Writer`) has to be
/// flushed before the method returns.
///
/// Only [`write_rows`](Self::write_rows) is required. Formats without frame
/// bytes keep the empty defaults, and formats that render totals/extremes the
/// same way as plain rows inherit that behavior.
pub trait RowFormat<R>: Send {
    /// Append the opening bytes of the output frame.
    fn write_prefix(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    /// Append the serialization of one row batch.
    fn write_rows(&mut self, out: &mut Vec<u8>, rows: &[R]) -> Result<()>;

    /// Append a totals batch. Defaults to plain-row rendering.
    fn write_totals(&mut self, out: &mut Vec<u8>, rows: &[R]) -> Result<()> {
        self.write_rows(out, rows)
    }

    /// Append an extremes batch. Defaults to plain-row rendering.
    fn write_extremes(&mut self, out: &mut Vec<u8>, rows: &[R]) -> Result<()> {
        self.write_rows(out, rows)
    }

    /// Append the closing bytes of the output frame.
    fn write_suffix(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    /// Append trailer bytes derived from the final [`Statistics`] snapshot.
    ///
    /// This runs for the last ticket of the stream. Formats that declared
    /// [`totals_in_trailer`](Self::totals_in_trailer) find the totals and
    /// extremes batches in `stats` instead of receiving them as standalone
    /// batches.
    fn finish(&mut self, _out: &mut Vec<u8>, _stats: &Statistics<R>) -> Result<()> {
        Ok(())
    }

    /// Absolute index of the first row of the batch this formatter is about
    /// to serialize. Row-numbering formats need this to stay correct when
    /// batches are formatted out of order.
    fn set_first_row_number(&mut self, _row: u64) {}

    /// Whether [`finish`](Self::finish) can embed an error message from the
    /// statistics snapshot into the output.
    fn supports_error_trailer(&self) -> bool {
        false
    }

    /// Whether totals and extremes are consumed only by
    /// [`finish`](Self::finish). When true, the core routes them into the
    /// statistics aggregate instead of onto the ring.
    fn totals_in_trailer(&self) -> bool {
        false
    }
}
