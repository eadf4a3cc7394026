//! JSON Lines output: one compact JSON value per row, newline-terminated.

use anyhow::{Context, Result};
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::format::{FormatFactory, RowFormat};

/// Serde-backed JSON Lines format.
///
/// Stateless, so batches can be serialized in any order; totals and
/// extremes render like plain rows.
pub struct JsonLines<T> {
    _rows: PhantomData<fn() -> T>,
}

impl<T> JsonLines<T> {
    pub fn new() -> Self {
        Self { _rows: PhantomData }
    }
}

impl<T> Default for JsonLines<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + Send + 'static> JsonLines<T> {
    /// Factory handing the parallel core one fresh format per ticket.
    pub fn factory() -> FormatFactory<T> {
        Arc::new(|| Box::new(Self::new()))
    }
}

impl<T: Serialize + Send> RowFormat<T> for JsonLines<T> {
    fn write_rows(&mut self, out: &mut Vec<u8>, rows: &[T]) -> Result<()> {
        for (i, row) in rows.iter().enumerate() {
            serde_json::to_writer(&mut *out, row)
                .with_context(|| format!("serialize JSONL row #{i} in batch"))?;
            out.push(b'\n');
        }
        Ok(())
    }
}
