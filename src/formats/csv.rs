//! CSV output with an optional header row.
//!
//! The header is emitted by the prefix segment only. Row batches are always
//! serialized headerless, so chunks formatted in parallel never repeat it.

use anyhow::{Context, Result};
use csv::WriterBuilder;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::format::{FormatFactory, RowFormat};

/// Serde-backed CSV format.
pub struct CsvRows<T> {
    header: Option<Vec<String>>,
    _rows: PhantomData<fn() -> T>,
}

impl<T> Clone for CsvRows<T> {
    fn clone(&self) -> Self {
        Self {
            header: self.header.clone(),
            _rows: PhantomData,
        }
    }
}

impl<T> CsvRows<T> {
    /// Headerless CSV.
    pub fn new() -> Self {
        Self {
            header: None,
            _rows: PhantomData,
        }
    }

    /// CSV with the given column names as the first output line.
    pub fn with_header(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            header: Some(columns.into_iter().map(Into::into).collect()),
            _rows: PhantomData,
        }
    }
}

impl<T> Default for CsvRows<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + Send + 'static> CsvRows<T> {
    /// Factory handing the parallel core one fresh format per ticket.
    pub fn factory(template: CsvRows<T>) -> FormatFactory<T> {
        Arc::new(move || Box::new(template.clone()))
    }
}

impl<T: Serialize + Send> RowFormat<T> for CsvRows<T> {
    fn write_prefix(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if let Some(columns) = &self.header {
            let mut writer = WriterBuilder::new().has_headers(false).from_writer(out);
            writer.write_record(columns).context("write CSV header")?;
            writer.flush().context("flush CSV header")?;
        }
        Ok(())
    }

    fn write_rows(&mut self, out: &mut Vec<u8>, rows: &[T]) -> Result<()> {
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(out);
        for (i, row) in rows.iter().enumerate() {
            writer
                .serialize(row)
                .with_context(|| format!("serialize CSV row #{i} in batch"))?;
        }
        writer.flush().context("flush CSV batch")?;
        Ok(())
    }
}
