//! Thread lifecycle glue
//!
//! Maps each thread id to its [`LogWriter`] so the drain path, which only
//! knows the thread id, can find the right destination. Entries are inserted on
//! thread start and retired on thread end, always by the owning thread itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::DrainSink;
use crate::error::{TraceError, TraceResult};
use crate::record::MemRef;
use crate::writer::{LogWriter, WriterFactory, WriterStats};
use crate::{ThreadId, TracerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    NotStarted,
    Active,
    Ended,
}

enum Slot {
    // Only the owning thread locks its writer, so the mutex is uncontended
    Active(Arc<Mutex<LogWriter>>),
    Ended,
}

#[derive(Default)]
struct Totals {
    threads_started: AtomicU64,
    threads_ended: AtomicU64,
    records_written: AtomicU64,
    records_discarded: AtomicU64,
    drains: AtomicU64,
    bytes_written: AtomicU64,
}

/// Thread table keyed by host thread id.
///
/// Entries are never removed: an ended thread keeps an `Ended` marker for the
/// rest of the session, so the table holds one small entry per thread ever
/// started and a reused id cannot be started again.
pub struct ThreadRegistry {
    factory: Box<dyn WriterFactory>,
    slots: DashMap<ThreadId, Slot>,
    totals: Totals,
}

impl ThreadRegistry {
    pub fn new(factory: impl WriterFactory + 'static) -> Self {
        Self::with_boxed_factory(Box::new(factory))
    }

    pub fn with_boxed_factory(factory: Box<dyn WriterFactory>) -> Self {
        Self {
            factory,
            slots: DashMap::new(),
            totals: Totals::default(),
        }
    }

    pub fn state(&self, tid: ThreadId) -> ThreadState {
        match self.slots.get(&tid).as_deref() {
            None => ThreadState::NotStarted,
            Some(Slot::Active(_)) => ThreadState::Active,
            Some(Slot::Ended) => ThreadState::Ended,
        }
    }

    /// NotStarted -> Active: create the thread's writer
    pub fn on_thread_start(&self, tid: ThreadId) -> TraceResult<()> {
        let state = self.state(tid);
        if state != ThreadState::NotStarted {
            return Err(TraceError::ThreadLifecycle { tid, state });
        }

        // Opened before the entry is visible; a failed open leaves no trace
        let writer = self.factory.create(tid)?;
        debug!(tid = %tid, destination = writer.destination(), "Thread started");
        self.slots
            .insert(tid, Slot::Active(Arc::new(Mutex::new(writer))));
        self.totals.threads_started.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Active -> Ended: close and release the thread's writer
    pub fn on_thread_fini(&self, tid: ThreadId) -> TraceResult<WriterStats> {
        let writer = {
            let mut slot = self
                .slots
                .get_mut(&tid)
                .ok_or(TraceError::ThreadLifecycle {
                    tid,
                    state: ThreadState::NotStarted,
                })?;
            match std::mem::replace(slot.value_mut(), Slot::Ended) {
                Slot::Active(writer) => writer,
                Slot::Ended => {
                    return Err(TraceError::ThreadLifecycle {
                        tid,
                        state: ThreadState::Ended,
                    })
                }
            }
        };

        let stats = writer.lock().close();
        // Fold in whatever was written even if the final flush failed
        let written = writer.lock().stats();
        self.absorb(written);
        self.totals.threads_ended.fetch_add(1, Ordering::Relaxed);
        debug!(
            tid = %tid,
            records = written.records_written,
            drains = written.drains,
            "Thread ended"
        );
        stats
    }

    pub fn stats(&self) -> TracerStats {
        let totals = &self.totals;
        TracerStats {
            threads_started: totals.threads_started.load(Ordering::Relaxed),
            threads_ended: totals.threads_ended.load(Ordering::Relaxed),
            records_written: totals.records_written.load(Ordering::Relaxed),
            records_discarded: totals.records_discarded.load(Ordering::Relaxed),
            drains: totals.drains.load(Ordering::Relaxed),
            bytes_written: totals.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Threads currently Active
    pub fn active_threads(&self) -> Vec<ThreadId> {
        let mut active: Vec<_> = self
            .slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Active(_)))
            .map(|entry| *entry.key())
            .collect();
        active.sort();
        active
    }

    fn absorb(&self, stats: WriterStats) {
        let totals = &self.totals;
        totals
            .records_written
            .fetch_add(stats.records_written, Ordering::Relaxed);
        totals
            .records_discarded
            .fetch_add(stats.records_discarded, Ordering::Relaxed);
        totals.drains.fetch_add(stats.drains, Ordering::Relaxed);
        totals
            .bytes_written
            .fetch_add(stats.bytes_written, Ordering::Relaxed);
    }
}

impl DrainSink for ThreadRegistry {
    fn drain(&self, tid: ThreadId, records: &[MemRef]) -> TraceResult<()> {
        // Clone the handle out so the shard guard is released before writing
        let writer = match self.slots.get(&tid).as_deref() {
            Some(Slot::Active(writer)) => Arc::clone(writer),
            Some(Slot::Ended) => {
                return Err(TraceError::ThreadLifecycle {
                    tid,
                    state: ThreadState::Ended,
                })
            }
            None => {
                return Err(TraceError::ThreadLifecycle {
                    tid,
                    state: ThreadState::NotStarted,
                })
            }
        };
        let mut writer = writer.lock();
        writer.drain(records)
    }
}
