//! Output byte order must equal submission order, for any worker count.

use anyhow::Result;
use parfmt::testing::{NumberedLines, SharedBuffer};
use parfmt::{FormatFactory, ParallelFormatter, RowFormat};
use std::sync::Arc;

/// Wraps every batch in brackets; no frame bytes.
struct Bracketed;

impl RowFormat<String> for Bracketed {
    fn write_rows(&mut self, out: &mut Vec<u8>, rows: &[String]) -> Result<()> {
        out.push(b'[');
        for row in rows {
            out.extend_from_slice(row.as_bytes());
        }
        out.push(b']');
        Ok(())
    }
}

/// Plain concatenation inside a `<...>` frame.
struct Framed;

impl RowFormat<String> for Framed {
    fn write_prefix(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.push(b'<');
        Ok(())
    }

    fn write_rows(&mut self, out: &mut Vec<u8>, rows: &[String]) -> Result<()> {
        for row in rows {
            out.extend_from_slice(row.as_bytes());
        }
        Ok(())
    }

    fn write_suffix(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.push(b'>');
        Ok(())
    }
}

#[test]
fn batches_stay_in_submission_order() -> Result<()> {
    let sink = SharedBuffer::new();
    let factory: FormatFactory<String> = Arc::new(|| Box::new(Bracketed));
    let mut fmt = ParallelFormatter::new(sink.clone(), factory, 4)?;

    fmt.write_prefix()?;
    for chunk in ["a", "b", "c"] {
        fmt.write_rows(vec![chunk.to_string()])?;
    }
    fmt.write_suffix()?;
    fmt.finish()?;

    assert_eq!(sink.contents(), b"[a][b][c]");
    Ok(())
}

#[test]
fn prefix_and_suffix_frame_the_plain_batches() -> Result<()> {
    let sink = SharedBuffer::new();
    let factory: FormatFactory<String> = Arc::new(|| Box::new(Framed));
    let mut fmt = ParallelFormatter::new(sink.clone(), factory, 4)?;

    fmt.write_prefix()?;
    fmt.write_rows(vec!["x".to_string()])?;
    fmt.write_rows(vec!["y".to_string()])?;
    fmt.write_suffix()?;
    fmt.finish()?;

    assert_eq!(sink.contents(), b"<xy>");
    Ok(())
}

/// Concatenation with no frame bytes at all.
struct Plain;

impl RowFormat<String> for Plain {
    fn write_rows(&mut self, out: &mut Vec<u8>, rows: &[String]) -> Result<()> {
        for row in rows {
            out.extend_from_slice(row.as_bytes());
        }
        Ok(())
    }
}

#[test]
fn thousand_ordinals_in_order_for_any_worker_count() -> Result<()> {
    let expected: String = (0..1000).map(|i| i.to_string()).collect();

    for workers in [1, 2, 8] {
        let sink = SharedBuffer::new();
        let factory: FormatFactory<String> = Arc::new(|| Box::new(Plain));
        let mut fmt = ParallelFormatter::new(sink.clone(), factory, workers)?;

        fmt.write_prefix()?;
        for i in 0..1000 {
            fmt.write_rows(vec![i.to_string()])?;
        }
        fmt.write_suffix()?;
        fmt.finish()?;

        assert_eq!(sink.contents(), expected.as_bytes(), "workers = {workers}");
    }
    Ok(())
}

#[test]
fn tickets_stay_within_the_ring_window() -> Result<()> {
    let sink = SharedBuffer::new();
    let factory: FormatFactory<String> = Arc::new(|| Box::new(Bracketed));
    let mut fmt = ParallelFormatter::new(sink, factory, 2)?;
    let ring = fmt.ring_slots();

    fmt.write_prefix()?;
    for i in 0..500 {
        fmt.write_rows(vec![i.to_string()])?;
        let (collector, writer) = fmt.tickets();
        assert!(collector <= writer, "collector ran ahead of the writer");
        assert!(
            writer <= collector + ring,
            "writer ran more than a full ring ahead"
        );
    }
    fmt.write_suffix()?;
    fmt.finish()?;
    Ok(())
}

#[test]
fn row_numbers_are_global_across_parallel_batches() -> Result<()> {
    let sink = SharedBuffer::new();
    let factory: FormatFactory<String> = Arc::new(|| Box::new(NumberedLines::default()));
    let mut fmt = ParallelFormatter::new(sink.clone(), factory, 8)?;

    let mut expected = String::new();
    let mut next_row = 0u64;
    fmt.write_prefix()?;
    for batch in 0..100 {
        let rows: Vec<String> = (0..(batch % 7 + 1)).map(|i| format!("r{batch}.{i}")).collect();
        for row in &rows {
            expected.push_str(&format!("{next_row}: {row}\n"));
            next_row += 1;
        }
        fmt.write_rows(rows)?;
    }
    fmt.write_suffix()?;
    fmt.finish()?;

    assert_eq!(fmt.rows_consumed(), next_row);
    assert_eq!(fmt.rows_collected(), next_row);
    assert_eq!(sink.contents(), expected.as_bytes());
    Ok(())
}
