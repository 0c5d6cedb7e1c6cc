//! Capture buffer pool
//!
//! Each thread gets N fixed-capacity buffers. Appends go to the open buffer;
//! when it reaches capacity it is handed to the [`DrainSink`] synchronously on
//! the producing thread, reset, and the next buffer becomes the open one.
//! Nothing is queued, so the footprint is bounded by `N * capacity` records per
//! thread no matter how long the observed program runs.

use std::sync::Arc;

use tracing::trace;

use crate::error::{TraceError, TraceResult};
use crate::record::MemRef;
use crate::ThreadId;

pub const PAGE_SIZE: usize = 4096;

/// Receiver of full capture buffers.
///
/// Called on the producing thread. The slice is only borrowed for the duration
/// of the call; the buffer is reused as soon as the call returns.
pub trait DrainSink: Send + Sync {
    fn drain(&self, tid: ThreadId, records: &[MemRef]) -> TraceResult<()>;
}

/// Buffer geometry shared by every thread of a session
#[derive(Clone)]
pub struct BufferPool {
    capacity: usize,
    buffers_per_thread: usize,
    sink: Arc<dyn DrainSink>,
}

impl BufferPool {
    /// Define the pool: `page_count` pages per buffer, `buffers_per_thread`
    /// buffers per thread, records of `record_size` bytes.
    pub fn define(
        record_size: usize,
        page_count: usize,
        buffers_per_thread: usize,
        sink: Arc<dyn DrainSink>,
    ) -> TraceResult<Self> {
        if record_size == 0 {
            return Err(TraceError::pool("record size is zero"));
        }
        if buffers_per_thread < 2 {
            return Err(TraceError::pool(format!(
                "{buffers_per_thread} buffer(s) per thread, need at least 2"
            )));
        }

        let bytes = page_count
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| TraceError::pool(format!("{page_count} pages overflow")))?;
        let capacity = bytes / record_size;
        if capacity == 0 {
            return Err(TraceError::pool(format!(
                "{page_count} page(s) hold no {record_size}-byte records"
            )));
        }
        bytes
            .checked_mul(buffers_per_thread)
            .filter(|total| *total <= isize::MAX as usize)
            .ok_or_else(|| TraceError::pool("per-thread footprint overflows"))?;

        Ok(Self {
            capacity,
            buffers_per_thread,
            sink,
        })
    }

    /// Records per buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffers_per_thread(&self) -> usize {
        self.buffers_per_thread
    }

    /// Allocate the buffers of one thread up front
    pub fn allocate(&self, tid: ThreadId) -> TraceResult<ThreadBuffers> {
        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(self.buffers_per_thread)
            .map_err(TraceError::pool)?;
        for _ in 0..self.buffers_per_thread {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(self.capacity)
                .map_err(|err| TraceError::pool(format!("thread {tid}: {err}")))?;
            buffers.push(buffer);
        }

        Ok(ThreadBuffers {
            tid,
            buffers: buffers.into_boxed_slice(),
            open: 0,
            capacity: self.capacity,
            drains: 0,
            sink: Arc::clone(&self.sink),
        })
    }
}

/// The buffers of one thread. Owned by that thread, never shared.
pub struct ThreadBuffers {
    tid: ThreadId,
    buffers: Box<[Vec<MemRef>]>,
    open: usize,
    capacity: usize,
    drains: u64,
    sink: Arc<dyn DrainSink>,
}

impl ThreadBuffers {
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// Append one record to the open buffer, draining it when full
    #[inline]
    pub fn append(&mut self, record: MemRef) -> TraceResult<()> {
        let buffer = &mut self.buffers[self.open];
        // Capacity was reserved up front and the buffer drains at capacity,
        // so this push never reallocates.
        buffer.push(record);
        if buffer.len() == self.capacity {
            self.hand_off()
        } else {
            Ok(())
        }
    }

    /// Drain the open buffer if it holds any records
    pub fn flush(&mut self) -> TraceResult<()> {
        if self.buffers[self.open].is_empty() {
            return Ok(());
        }
        self.hand_off()
    }

    /// Records waiting in the open buffer
    pub fn pending(&self) -> usize {
        self.buffers[self.open].len()
    }

    pub fn drains(&self) -> u64 {
        self.drains
    }

    #[cold]
    fn hand_off(&mut self) -> TraceResult<()> {
        let full = self.open;
        self.open = (self.open + 1) % self.buffers.len();
        self.drains += 1;

        trace!(
            tid = %self.tid,
            records = self.buffers[full].len(),
            slot = full,
            "Draining capture buffer"
        );
        let result = self.sink.drain(self.tid, &self.buffers[full]);
        self.buffers[full].clear();
        result
    }
}
