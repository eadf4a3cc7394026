//! Order-preserving parallel output formatting.
//!
//! Serializing tabular data is CPU-bound and embarrassingly parallel per
//! batch, but the output stream has to look like a single-threaded formatter
//! produced it. [`ParallelFormatter`] squares that: row batches are handed
//! to a worker pool as they arrive, each batch is serialized by a fresh
//! [`RowFormat`] into a private buffer, and a dedicated collector thread
//! appends the buffers to the downstream sink in exactly the order the
//! batches were submitted.
//!
//! ```
//! use parfmt::{formats::JsonLines, testing::SharedBuffer, ParallelFormatter};
//!
//! # fn main() -> anyhow::Result<()> {
//! let sink = SharedBuffer::new();
//! let mut fmt = ParallelFormatter::new(sink.clone(), JsonLines::<u64>::factory(), 4)?;
//! fmt.write_prefix()?;
//! for batch in (0..100u64).collect::<Vec<_>>().chunks(10) {
//!     fmt.write_rows(batch.to_vec())?;
//! }
//! fmt.write_suffix()?;
//! fmt.finish()?;
//!
//! let sequential: String = (0..100).map(|i| format!("{i}\n")).collect();
//! assert_eq!(sink.contents(), sequential.as_bytes());
//! # Ok(())
//! # }
//! ```

pub mod format;
pub mod formats;
pub mod parallel;
pub mod pool;
pub mod stats;
pub mod testing;

pub use format::{FormatFactory, RowFormat};
pub use parallel::{NotImplemented, ParallelFormatter};
pub use pool::TaskPool;
pub use stats::Statistics;
