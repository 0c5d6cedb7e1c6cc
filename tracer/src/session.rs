//! Tracing session
//!
//! [`TraceSession`] is created once and passed by reference to whatever drives
//! the observed program. It replaces process-wide handles: the pool, the
//! policy and the thread registry all live here.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{info, warn};

use crate::buffer::{BufferPool, DrainSink, ThreadBuffers};
use crate::clock::MonotonicClock;
use crate::config::TraceConfig;
use crate::error::TraceResult;
use crate::lifecycle::{ThreadRegistry, ThreadState};
use crate::policy::{InstructionView, InstrumentationPolicy, InstrumentationSite};
use crate::record::MemRef;
use crate::writer::{FileWriterFactory, WriterFactory, WriterStats};
use crate::{ProcessId, ThreadId, TracerStats};

pub struct TraceSession {
    config: TraceConfig,
    clock: MonotonicClock,
    policy: InstrumentationPolicy,
    pool: BufferPool,
    registry: Arc<ThreadRegistry>,
}

impl TraceSession {
    /// Start a session writing `<base>.<pid>.<tid>` files for this process
    pub fn start(config: TraceConfig) -> TraceResult<Self> {
        let factory = FileWriterFactory::new(config.output_base_name.clone(), ProcessId::current());
        Self::with_factory(config, factory)
    }

    pub fn with_factory(
        config: TraceConfig,
        factory: impl WriterFactory + 'static,
    ) -> TraceResult<Self> {
        config.validate()?;

        let clock = MonotonicClock::new();
        let registry = Arc::new(ThreadRegistry::new(factory));
        let sink: Arc<dyn DrainSink> = registry.clone();
        let pool = BufferPool::define(
            MemRef::SIZE,
            config.buffer_pages,
            config.buffers_per_thread,
            sink,
        )?;
        let policy = InstrumentationPolicy::new(config.timestamp_mode, clock);

        info!(
            base_name = %config.output_base_name.display(),
            records_per_buffer = pool.capacity(),
            buffers_per_thread = pool.buffers_per_thread(),
            timestamp_mode = ?config.timestamp_mode,
            "Trace session started"
        );

        Ok(Self {
            config,
            clock,
            policy,
            pool,
            registry,
        })
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    /// Records per capture buffer
    pub fn buffer_capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    /// Decide the capture actions for one static instruction
    pub fn instrument<I: InstructionView + ?Sized>(&self, ins: &I) -> Option<InstrumentationSite> {
        self.policy.instrument(ins)
    }

    /// Thread-start notification. The returned handle is the only way to
    /// capture on `tid`, so nothing can be recorded before this point.
    pub fn thread_start(&self, tid: ThreadId) -> TraceResult<ThreadCapture> {
        self.registry.on_thread_start(tid)?;
        match self.pool.allocate(tid) {
            Ok(buffers) => Ok(ThreadCapture {
                buffers,
                clock: self.clock,
                _not_send: PhantomData,
            }),
            Err(err) => {
                // Leave no half-started thread behind
                if let Err(close_err) = self.registry.on_thread_fini(tid) {
                    warn!(
                        tid = %tid,
                        error = %close_err,
                        "Failed to close destination after buffer allocation failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Thread-end notification: drain the final partial buffer, then close
    /// the thread's destination.
    pub fn thread_fini(&self, mut capture: ThreadCapture) -> TraceResult<WriterStats> {
        let tid = capture.tid();
        let flushed = capture.buffers.flush();
        drop(capture);
        let closed = self.registry.on_thread_fini(tid);
        flushed?;
        closed
    }

    pub fn thread_state(&self, tid: ThreadId) -> ThreadState {
        self.registry.state(tid)
    }

    pub fn stats(&self) -> TracerStats {
        self.registry.stats()
    }

    /// End the session and report totals
    pub fn finish(self) -> TracerStats {
        let active = self.registry.active_threads();
        if !active.is_empty() {
            warn!(
                threads = ?active,
                "Session finished with threads still active; their last partial buffers are lost"
            );
        }

        let stats = self.registry.stats();
        info!(
            threads = stats.threads_ended,
            records = stats.records_written,
            discarded = stats.records_discarded,
            drains = stats.drains,
            bytes = stats.bytes_written,
            "Trace session finished"
        );
        stats
    }
}

/// Capture state of one active thread.
///
/// Neither `Clone` nor `Send`: the handle stays on the thread that received
/// the start notification, which is what keeps each thread's records in its
/// own file.
pub struct ThreadCapture {
    buffers: ThreadBuffers,
    clock: MonotonicClock,
    _not_send: PhantomData<*const ()>,
}

impl ThreadCapture {
    pub fn tid(&self) -> ThreadId {
        self.buffers.tid()
    }

    /// Run the capture actions of `site` for one execution of its
    /// instruction. `resolve_ea` maps an operand index to the effective
    /// address the host computed for it.
    #[inline]
    pub fn execute<F>(&mut self, site: &InstrumentationSite, mut resolve_ea: F) -> TraceResult<()>
    where
        F: FnMut(u32) -> u64,
    {
        for action in &site.actions {
            let ea = resolve_ea(action.operand);
            self.buffers.append(action.fire(site.pc, ea, &self.clock))?;
        }
        Ok(())
    }

    /// Append an already-built record
    #[inline]
    pub fn record(&mut self, record: MemRef) -> TraceResult<()> {
        self.buffers.append(record)
    }

    /// Records not yet drained
    pub fn pending(&self) -> usize {
        self.buffers.pending()
    }
}
