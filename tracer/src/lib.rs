//! memtrace - per-thread memory-access capture pipeline
//!
//! Every instrumented memory access appends one [`MemRef`] to the calling
//! thread's open capture buffer. Full buffers are drained synchronously, on the
//! same thread, into that thread's [`LogWriter`], which persists the valid
//! records as text lines in its own file.
//!
//! Design Principles:
//! - No shared mutable state on the append path
//! - Synchronous drain hand-off, so nothing queues and nothing is dropped
//! - Trait seams where the host instrumentation engine plugs in
//!
//! The host engine is modelled by [`InstructionView`] (operand enumeration) and
//! the thread notifications on [`TraceSession`]. [`host::ReplayHost`] is an
//! in-process implementation used by the `memtrace` binary and by tests.

use std::fmt;

pub mod app;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod policy;
pub mod record;
pub mod session;
pub mod writer;

pub use buffer::{BufferPool, DrainSink, ThreadBuffers, PAGE_SIZE};
pub use clock::MonotonicClock;
pub use config::{TimestampMode, TraceConfig};
pub use error::{TraceError, TraceResult};
pub use lifecycle::{ThreadRegistry, ThreadState};
pub use policy::{
    CaptureAction, InstructionView, InstrumentationPolicy, InstrumentationSite, MemoryOperand,
    OperandDirection, TimestampSource,
};
pub use record::{AccessKind, FieldOffsets, MemRef};
pub use session::{ThreadCapture, TraceSession};
pub use writer::{FileWriterFactory, LogWriter, WriterFactory, WriterStats};

// ============================================================================
// Core Types
// ============================================================================

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// Identity of the process this code runs in
    pub fn current() -> Self {
        ProcessId(std::process::id())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier, as assigned by the host engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-wide statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TracerStats {
    pub threads_started: u64,
    pub threads_ended: u64,
    pub records_written: u64,
    pub records_discarded: u64,
    pub drains: u64,
    pub bytes_written: u64,
}

impl TracerStats {
    /// Threads that started and have not ended yet
    pub fn active_threads(&self) -> u64 {
        self.threads_started.saturating_sub(self.threads_ended)
    }
}
