//! Order-preserving parallel formatting core.
//!
//! Row batches submitted by a single producer are serialized by tasks on a
//! worker pool, each into a private byte buffer, and a dedicated collector
//! thread appends those buffers to the downstream sink in submission order.
//! The concatenated output is byte-identical to what a sequential formatter
//! would have produced.
//!
//! The moving parts:
//!
//! - a fixed ring of slots, one in-flight batch each, indexed by a
//!   monotonically increasing ticket modulo the ring size;
//! - the producer path ([`ParallelFormatter::write_rows`] and friends),
//!   which claims the next slot, publishes the batch and schedules a
//!   formatter task;
//! - the formatter tasks, which serialize one slot each and never touch the
//!   sink;
//! - the collector thread, the only writer to the sink, which drains slots
//!   strictly in ticket order and recycles them.
//!
//! The producer and the collector block on separate condition variables:
//! the producer waits for its target slot to become free, the collector for
//! its target slot to become ready. The two must stay separate; a single
//! condvar wakes the wrong side.
//!
//! Errors from any background thread are captured once, poison the
//! instance, unblock every waiter, and surface exactly once at the next
//! producer call or at [`ParallelFormatter::finish`].

use anyhow::{anyhow, Context, Result};
use log::{debug, trace};
use std::fmt;
use std::io::Write;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::format::FormatFactory;
use crate::pool::{build_pool, TaskPool};
use crate::stats::Statistics;

/// Upper bound on the ring, so pathological worker counts stay bounded.
const MAX_RING_SLOTS: usize = 1024;

/// Error payload for operations the parallel formatter deliberately does not
/// support. Recoverable with `anyhow::Error::downcast_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotImplemented(pub &'static str);

impl fmt::Display for NotImplemented {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not implemented for parallel formatting", self.0)
    }
}

impl std::error::Error for NotImplemented {}

/// Which inner-formatter method a scheduled unit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Prefix,
    Rows,
    Totals,
    Extremes,
    Suffix,
    Finish,
}

/// Slot handoff states. Transitions are strictly
/// `Free -> Formatting -> Ready -> Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum SlotStatus {
    Free = 0,
    Formatting = 1,
    Ready = 2,
}

/// One ring cell. The atomic status is the cross-thread handoff; whoever
/// moved it last owns the payload, and the per-slot mutex carries the
/// publication barrier for it.
struct Slot<R> {
    status: AtomicU8,
    data: Mutex<SlotData<R>>,
}

struct SlotData<R> {
    kind: UnitKind,
    rows: Vec<R>,
    /// Scratch buffer for the formatted segment, reused across uses of the
    /// slot; capacity only grows.
    bytes: Vec<u8>,
    rows_num: usize,
}

impl<R> Slot<R> {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(SlotStatus::Free as u8),
            data: Mutex::new(SlotData {
                kind: UnitKind::Prefix,
                rows: Vec::new(),
                bytes: Vec::new(),
                rows_num: 0,
            }),
        }
    }
}

/// State shared between the producer handle, the formatter tasks and the
/// collector thread.
struct Inner<R> {
    slots: Box<[Slot<R>]>,
    factory: FormatFactory<R>,
    sink: Mutex<Box<dyn Write + Send>>,

    /// Guards the condvar protocols. The predicates themselves are atomics;
    /// waiters re-check them under this lock and notifiers take it before
    /// notifying, so no wakeup can slip between a check and a wait.
    gate: Mutex<()>,
    /// Wakes the producer (and teardown) when a slot frees or workers drain.
    writer_cv: Condvar,
    /// Wakes the collector when its target slot becomes ready.
    collector_cv: Condvar,

    /// Signalled once the collector thread has exited its loop.
    done: Mutex<bool>,
    done_cv: Condvar,

    emergency_stop: AtomicBool,
    need_flush: AtomicBool,
    collector_ticket: AtomicUsize,
    /// Formatter tasks scheduled but not yet finished.
    in_flight: AtomicUsize,

    error_recorded: AtomicBool,
    error: Mutex<Option<anyhow::Error>>,
    statistics: Mutex<Statistics<R>>,

    rows_collected: AtomicU64,
    collected_prefix: AtomicBool,
    collected_suffix: AtomicBool,
    collected_finish: AtomicBool,
}

impl<R> Inner<R> {
    /// First error wins; every later error is swallowed. Always poisons the
    /// instance and unblocks both sides.
    fn record_background_error(&self, error: anyhow::Error) {
        if !self.error_recorded.swap(true, Ordering::AcqRel) {
            *self.error.lock().unwrap() = Some(error);
        }
        self.emergency_stop.store(true, Ordering::Release);
        let _gate = self.gate.lock().unwrap();
        self.writer_cv.notify_all();
        self.collector_cv.notify_all();
    }
}

/// Order-preserving parallel formatter.
///
/// Owns the worker pool and the collector thread. The caller is the single
/// producer; `write_*` calls must not race each other. Dropping the
/// formatter tears everything down whether or not [`finish`](Self::finish)
/// ran.
pub struct ParallelFormatter<R: Send + 'static> {
    inner: Arc<Inner<R>>,
    pool: Arc<dyn TaskPool>,
    collector: Option<JoinHandle<()>>,

    /// Next ticket to assign. Producer-owned; dense and gap-free.
    writer_ticket: usize,
    rows_consumed: u64,

    totals_in_trailer: bool,
    supports_error_trailer: bool,
    started_prefix: bool,
    started_suffix: bool,
    totals_written: bool,
    finished: bool,
}

impl<R: Send + 'static> ParallelFormatter<R> {
    /// Create a formatter writing to `sink`, serializing with formatters from
    /// `factory`, on a dedicated pool of `max_workers` threads (0 means the
    /// number of CPUs).
    pub fn new<W>(sink: W, factory: FormatFactory<R>, max_workers: usize) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let workers = effective_workers(max_workers);
        let pool = Arc::new(build_pool(workers)?);
        Self::with_pool(sink, factory, pool, workers)
    }

    /// Like [`new`](Self::new), but scheduling formatter tasks on a
    /// caller-supplied pool. `max_workers` still sizes the ring.
    pub fn with_pool<W>(
        sink: W,
        factory: FormatFactory<R>,
        pool: Arc<dyn TaskPool>,
        max_workers: usize,
    ) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        let workers = effective_workers(max_workers);

        // Query the capability flags once, from a throwaway instance.
        let probe = factory();
        let totals_in_trailer = probe.totals_in_trailer();
        let supports_error_trailer = probe.supports_error_trailer();
        drop(probe);

        // One slot per worker, plus one for the producer to fill and one for
        // the collector to hold.
        let ring = workers.saturating_add(2).min(MAX_RING_SLOTS);
        let slots: Box<[Slot<R>]> = (0..ring).map(|_| Slot::new()).collect();

        let inner = Arc::new(Inner {
            slots,
            factory,
            sink: Mutex::new(Box::new(sink)),
            gate: Mutex::new(()),
            writer_cv: Condvar::new(),
            collector_cv: Condvar::new(),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            emergency_stop: AtomicBool::new(false),
            need_flush: AtomicBool::new(false),
            collector_ticket: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            error_recorded: AtomicBool::new(false),
            error: Mutex::new(None),
            statistics: Mutex::new(Statistics::default()),
            rows_collected: AtomicU64::new(0),
            collected_prefix: AtomicBool::new(false),
            collected_suffix: AtomicBool::new(false),
            collected_finish: AtomicBool::new(false),
        });

        debug!("parallel formatter: {workers} workers, ring of {ring} slots");

        let collector = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("parfmt-collector".into())
                .spawn(move || collector_thread(inner))
                .context("spawn collector thread")?
        };

        Ok(Self {
            inner,
            pool,
            collector: Some(collector),
            writer_ticket: 0,
            rows_consumed: 0,
            totals_in_trailer,
            supports_error_trailer,
            started_prefix: false,
            started_suffix: false,
            totals_written: false,
            finished: false,
        })
    }

    /// Enqueue the opening frame bytes.
    pub fn write_prefix(&mut self) -> Result<()> {
        self.add_unit(Vec::new(), UnitKind::Prefix, true)?;
        self.started_prefix = true;
        Ok(())
    }

    /// Enqueue one batch of rows.
    pub fn write_rows(&mut self, rows: Vec<R>) -> Result<()> {
        self.add_unit(rows, UnitKind::Rows, true)
    }

    /// Enqueue a totals batch, or park it in the statistics aggregate when
    /// the format consumes totals only in its trailer.
    pub fn write_totals(&mut self, rows: Vec<R>) -> Result<()> {
        if self.totals_in_trailer {
            self.inner.statistics.lock().unwrap().totals = Some(rows);
            Ok(())
        } else {
            self.add_unit(rows, UnitKind::Totals, true)?;
            self.totals_written = true;
            Ok(())
        }
    }

    /// Enqueue an extremes batch, or park it in the statistics aggregate
    /// when the format consumes extremes only in its trailer.
    pub fn write_extremes(&mut self, rows: Vec<R>) -> Result<()> {
        if self.totals_in_trailer {
            self.inner.statistics.lock().unwrap().extremes = Some(rows);
            Ok(())
        } else {
            self.add_unit(rows, UnitKind::Extremes, true)
        }
    }

    /// Enqueue the closing frame bytes.
    pub fn write_suffix(&mut self) -> Result<()> {
        self.add_unit(Vec::new(), UnitKind::Suffix, true)?;
        self.started_suffix = true;
        Ok(())
    }

    /// Request a best-effort sink flush: the collector flushes after the
    /// next segment it appends. [`finish`](Self::finish) always flushes.
    pub fn flush(&self) {
        self.inner.need_flush.store(true, Ordering::Release);
    }

    /// Inject the missing frame tickets, enqueue the final trailer ticket,
    /// wait for the collector to drain everything, and rethrow the first
    /// background error if one occurred.
    ///
    /// Idempotent: the first call reports the outcome, later calls return
    /// `Ok(())`.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let result = self.finish_inner();
        self.finished = true;
        result
    }

    /// Cooperative cancellation: poison the instance, unblock all waiters,
    /// drain worker tasks and join the collector. The sink is left with
    /// whatever prefix of the output was already collected.
    pub fn cancel(&mut self) {
        self.finish_and_wait();
    }

    /// Store a pre-serialized error message for formats that embed errors in
    /// their trailer. Does not interact with background-error propagation.
    pub fn set_error_message(&self, message: impl Into<String>) {
        self.inner.statistics.lock().unwrap().error_message = Some(message.into());
    }

    /// Record how many rows the source read before a LIMIT was applied.
    pub fn set_rows_before_limit(&self, rows: u64) {
        self.inner.statistics.lock().unwrap().rows_before_limit = Some(rows);
    }

    /// Record how many rows the source read before aggregation.
    pub fn set_rows_before_aggregation(&self, rows: u64) {
        self.inner.statistics.lock().unwrap().rows_before_aggregation = Some(rows);
    }

    /// Restarting an output stream is unsupported; always fails with
    /// [`NotImplemented`].
    pub fn reset(&mut self) -> Result<()> {
        Err(anyhow::Error::new(NotImplemented(
            "resetting the output stream",
        )))
    }

    /// Whether the configured format can embed an error message in its
    /// trailer bytes.
    pub fn supports_error_trailer(&self) -> bool {
        self.supports_error_trailer
    }

    /// Whether a totals batch was emitted as its own output segment.
    pub fn totals_written(&self) -> bool {
        self.totals_written
    }

    /// Rows accepted from the producer so far.
    pub fn rows_consumed(&self) -> u64 {
        self.rows_consumed
    }

    /// Rows whose formatted bytes reached the sink so far.
    pub fn rows_collected(&self) -> u64 {
        self.inner.rows_collected.load(Ordering::Acquire)
    }

    /// Diagnostic view of the ring counters, `(collector, writer)`. The
    /// collector ticket never exceeds the writer ticket, and the writer
    /// ticket never runs more than [`ring_slots`](Self::ring_slots) ahead.
    pub fn tickets(&self) -> (usize, usize) {
        (
            self.inner.collector_ticket.load(Ordering::Acquire),
            self.writer_ticket,
        )
    }

    /// Number of slots in the ring.
    pub fn ring_slots(&self) -> usize {
        self.inner.slots.len()
    }

    /// Accept a unit, claim the next ring slot and schedule a formatter
    /// task for it. Blocks while the target slot is still in flight.
    fn add_unit(&mut self, rows: Vec<R>, kind: UnitKind, may_throw: bool) -> Result<()> {
        debug_assert!(!self.finished, "no units may be added after finish()");

        let inner = &self.inner;
        let ticket = self.writer_ticket;
        let slot = &inner.slots[ticket % inner.slots.len()];

        {
            let mut gate = inner.gate.lock().unwrap();
            while slot.status.load(Ordering::Acquire) != SlotStatus::Free as u8
                && !inner.emergency_stop.load(Ordering::Acquire)
            {
                gate = inner.writer_cv.wait(gate).unwrap();
            }
        }
        if inner.emergency_stop.load(Ordering::Acquire) {
            if may_throw {
                return self.rethrow_background();
            }
            return Ok(());
        }

        let first_row = self.rows_consumed;
        let rows_num = rows.len();
        {
            let mut data = slot.data.lock().unwrap();
            data.rows_num = rows_num;
            data.rows = rows;
            data.kind = kind;
        }
        self.rows_consumed += rows_num as u64;
        slot.status.store(SlotStatus::Formatting as u8, Ordering::Release);
        self.writer_ticket += 1;

        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let task_state = Arc::clone(inner);
        let scheduled = self.pool.schedule(Box::new(move || {
            formatter_task(&task_state, ticket, first_row);
        }));
        if let Err(error) = scheduled {
            inner.in_flight.fetch_sub(1, Ordering::AcqRel);
            inner.record_background_error(error.context("schedule formatter task"));
            return self.rethrow_background();
        }
        Ok(())
    }

    /// Surface the captured background error exactly once.
    fn rethrow_background(&mut self) -> Result<()> {
        match self.inner.error.lock().unwrap().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn finish_inner(&mut self) -> Result<()> {
        // Empty outputs still get a well-formed frame.
        if !self.started_prefix {
            self.add_unit(Vec::new(), UnitKind::Prefix, true)?;
            self.started_prefix = true;
        }
        if !self.started_suffix {
            self.add_unit(Vec::new(), UnitKind::Suffix, true)?;
            self.started_suffix = true;
        }
        self.add_unit(Vec::new(), UnitKind::Finish, true)?;

        {
            let mut done = self.inner.done.lock().unwrap();
            while !*done {
                done = self.inner.done_cv.wait(done).unwrap();
            }
        }

        self.rethrow_background()?;

        debug_assert!(
            self.inner.emergency_stop.load(Ordering::Acquire)
                || (self.inner.collected_prefix.load(Ordering::Acquire)
                    && self.inner.collected_suffix.load(Ordering::Acquire)
                    && self.inner.collected_finish.load(Ordering::Acquire)),
            "collector exited cleanly without draining the frame tickets"
        );

        self.inner
            .sink
            .lock()
            .unwrap()
            .flush()
            .context("flush output sink")?;
        Ok(())
    }

    /// Teardown: poison, unblock everyone, drain workers, join the
    /// collector. Infallible; errors during teardown are swallowed.
    fn finish_and_wait(&mut self) {
        let inner = &self.inner;
        inner.emergency_stop.store(true, Ordering::Release);
        {
            let _gate = inner.gate.lock().unwrap();
            inner.writer_cv.notify_all();
            inner.collector_cv.notify_all();
        }
        {
            let mut gate = inner.gate.lock().unwrap();
            while inner.in_flight.load(Ordering::Acquire) > 0 {
                gate = inner.writer_cv.wait(gate).unwrap();
            }
        }
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
    }
}

impl<R: Send + 'static> Drop for ParallelFormatter<R> {
    fn drop(&mut self) {
        self.finish_and_wait();
    }
}

fn effective_workers(max_workers: usize) -> usize {
    if max_workers == 0 {
        num_cpus::get()
    } else {
        max_workers
    }
}

/// One scheduled unit: serialize a single slot, publish it as ready, or
/// capture the failure. Never touches the sink.
fn formatter_task<R: Send + 'static>(inner: &Arc<Inner<R>>, ticket: usize, first_row: u64) {
    if !inner.emergency_stop.load(Ordering::Acquire) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| format_slot(inner, ticket, first_row)));
        match outcome {
            Ok(Ok(())) => {
                let slot = &inner.slots[ticket % inner.slots.len()];
                slot.status.store(SlotStatus::Ready as u8, Ordering::Release);
                let _gate = inner.gate.lock().unwrap();
                inner.collector_cv.notify_all();
            }
            Ok(Err(error)) => inner.record_background_error(error),
            Err(payload) => {
                inner.record_background_error(anyhow!(
                    "formatter task panicked: {}",
                    panic_message(payload.as_ref())
                ));
            }
        }
    }
    inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    let _gate = inner.gate.lock().unwrap();
    inner.writer_cv.notify_all();
}

fn format_slot<R: Send>(inner: &Inner<R>, ticket: usize, first_row: u64) -> Result<()> {
    let slot = &inner.slots[ticket % inner.slots.len()];
    let mut data = slot.data.lock().unwrap();
    let data = &mut *data;

    // Reset length, keep capacity.
    data.bytes.clear();

    let mut format = (inner.factory)();
    format.set_first_row_number(first_row);

    match data.kind {
        UnitKind::Prefix => format.write_prefix(&mut data.bytes)?,
        UnitKind::Rows => {
            let rows = mem::take(&mut data.rows);
            format.write_rows(&mut data.bytes, &rows)?;
        }
        UnitKind::Totals => {
            let rows = mem::take(&mut data.rows);
            format.write_totals(&mut data.bytes, &rows)?;
        }
        UnitKind::Extremes => {
            let rows = mem::take(&mut data.rows);
            format.write_extremes(&mut data.bytes, &rows)?;
        }
        UnitKind::Suffix => format.write_suffix(&mut data.bytes)?,
        UnitKind::Finish => {
            let snapshot = mem::take(&mut *inner.statistics.lock().unwrap());
            format.finish(&mut data.bytes, &snapshot)?;
        }
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

fn collector_thread<R: Send>(inner: Arc<Inner<R>>) {
    if let Err(error) = run_collector(&inner) {
        inner.record_background_error(error);
    } else {
        trace!(
            "collector finished after {} rows",
            inner.rows_collected.load(Ordering::Acquire)
        );
    }
    let mut done = inner.done.lock().unwrap();
    *done = true;
    inner.done_cv.notify_all();
}

/// The single consumer: drain slots in ticket order into the sink.
fn run_collector<R: Send>(inner: &Inner<R>) -> Result<()> {
    let ring = inner.slots.len();
    loop {
        let ticket = inner.collector_ticket.load(Ordering::Acquire);
        let slot = &inner.slots[ticket % ring];

        {
            let mut gate = inner.gate.lock().unwrap();
            while slot.status.load(Ordering::Acquire) != SlotStatus::Ready as u8
                && !inner.emergency_stop.load(Ordering::Acquire)
            {
                gate = inner.collector_cv.wait(gate).unwrap();
            }
        }
        // Bail even if the current slot is ready; post-cancel output is
        // discarded.
        if inner.emergency_stop.load(Ordering::Acquire) {
            return Ok(());
        }

        let kind;
        {
            let data = slot.data.lock().unwrap();
            kind = data.kind;

            let mut sink = inner.sink.lock().unwrap();
            sink.write_all(&data.bytes)
                .with_context(|| format!("write formatted segment for ticket {ticket}"))?;
            inner
                .rows_collected
                .fetch_add(data.rows_num as u64, Ordering::AcqRel);

            match kind {
                UnitKind::Prefix => inner.collected_prefix.store(true, Ordering::Release),
                UnitKind::Suffix => inner.collected_suffix.store(true, Ordering::Release),
                UnitKind::Finish => inner.collected_finish.store(true, Ordering::Release),
                _ => {}
            }

            if inner.need_flush.swap(false, Ordering::AcqRel) {
                sink.flush().context("flush output sink")?;
            }
        }

        if kind == UnitKind::Finish {
            return Ok(());
        }

        slot.status.store(SlotStatus::Free as u8, Ordering::Release);
        {
            let _gate = inner.gate.lock().unwrap();
            inner.writer_cv.notify_all();
        }
        inner.collector_ticket.fetch_add(1, Ordering::AcqRel);
    }
}
