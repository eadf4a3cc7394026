//! Concrete row formats, each usable as the inner formatter of the parallel
//! core and byte-identical to its sequential rendering.
//!
//! Each format lives behind its own feature flag:
//!
//! - [`jsonl`]: newline-delimited JSON (feature `io-jsonl`)
//! - [`csv`]: comma-separated values with optional header (feature `io-csv`)

#[cfg(feature = "io-csv")]
pub mod csv;
#[cfg(feature = "io-jsonl")]
pub mod jsonl;

#[cfg(feature = "io-csv")]
pub use self::csv::CsvRows;
#[cfg(feature = "io-jsonl")]
pub use self::jsonl::JsonLines;
