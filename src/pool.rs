//! Worker-pool seam.
//!
//! The core only needs one operation from its pool: submit a task or report
//! that submission was refused. The default implementation is a dedicated
//! rayon pool sized to `max_workers`, but anything implementing [`TaskPool`]
//! can be plugged in, including pools that refuse work, which is how the
//! submission-failure path stays testable.

use anyhow::{Context, Result};
use rayon::ThreadPoolBuilder;

/// A boxed unit of formatting work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Minimal scheduling interface the parallel core requires.
pub trait TaskPool: Send + Sync {
    /// Submit `task` for execution, or return an error if the pool refuses.
    ///
    /// The pool owes the task nothing beyond eventually running it: no
    /// priorities, no cancellation. Tasks coordinate with the core through
    /// shared state.
    fn schedule(&self, task: Task) -> Result<()>;
}

impl TaskPool for rayon::ThreadPool {
    fn schedule(&self, task: Task) -> Result<()> {
        self.spawn(task);
        Ok(())
    }
}

/// Build the default rayon pool with `threads` named worker threads.
pub fn build_pool(threads: usize) -> Result<rayon::ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("parfmt-worker-{i}"))
        .build()
        .context("build formatter worker pool")
}
