#![cfg(all(feature = "io-jsonl", feature = "io-csv"))]

//! The bundled formats produce byte-identical output under parallelism.

use anyhow::Result;
use parfmt::formats::{CsvRows, JsonLines};
use parfmt::testing::SharedBuffer;
use parfmt::ParallelFormatter;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Event {
    id: u64,
    name: String,
    score: i64,
}

fn events(n: u64) -> Vec<Event> {
    (0..n)
        .map(|i| Event {
            id: i,
            name: format!("event-{i}"),
            score: (i as i64) * 3 - 40,
        })
        .collect()
}

#[test]
fn jsonl_parallel_equals_sequential() -> Result<()> {
    let data = events(500);

    let mut sequential = Vec::new();
    for event in &data {
        serde_json::to_writer(&mut sequential, event)?;
        sequential.push(b'\n');
    }

    for workers in [1, 2, 8] {
        let sink = SharedBuffer::new();
        let mut fmt = ParallelFormatter::new(sink.clone(), JsonLines::factory(), workers)?;
        fmt.write_prefix()?;
        for batch in data.chunks(7) {
            fmt.write_rows(batch.to_vec())?;
        }
        fmt.write_suffix()?;
        fmt.finish()?;

        assert_eq!(sink.contents(), sequential, "workers = {workers}");
    }
    Ok(())
}

#[test]
fn csv_header_appears_exactly_once() -> Result<()> {
    let data = events(200);

    let sink = SharedBuffer::new();
    let template = CsvRows::with_header(["id", "name", "score"]);
    let mut fmt = ParallelFormatter::new(sink.clone(), CsvRows::factory(template), 8)?;

    fmt.write_prefix()?;
    for batch in data.chunks(13) {
        fmt.write_rows(batch.to_vec())?;
    }
    fmt.write_suffix()?;
    fmt.finish()?;

    let contents = sink.contents();
    let text = String::from_utf8(contents.clone())?;
    assert_eq!(text.matches("id,name,score").count(), 1);
    assert!(text.starts_with("id,name,score\n"));

    // Round-trip through a CSV reader preserves the rows and their order.
    let mut reader = csv::Reader::from_reader(contents.as_slice());
    let parsed: Vec<Event> = reader.deserialize().collect::<csv::Result<_>>()?;
    assert_eq!(parsed, data);
    Ok(())
}

#[test]
fn file_sink_round_trips() -> Result<()> {
    let data = events(100);
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("events.jsonl");

    {
        let sink = BufWriter::new(File::create(&path)?);
        let mut fmt = ParallelFormatter::new(sink, JsonLines::factory(), 4)?;
        for batch in data.chunks(9) {
            fmt.write_rows(batch.to_vec())?;
        }
        fmt.finish()?;
    }

    let mut text = String::new();
    File::open(&path)?.read_to_string(&mut text)?;
    let parsed: Vec<Event> = text
        .lines()
        .map(|line| serde_json::from_str(line).map_err(Into::into))
        .collect::<Result<_>>()?;
    assert_eq!(parsed, data);
    Ok(())
}
