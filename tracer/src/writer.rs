//! Per-thread log writer
//!
//! A [`LogWriter`] owns exactly one destination for the lifetime of its thread.
//! Each drain serializes the valid records of one capture buffer as text lines
//! and flushes, so a completed drain is durable even if the process later dies
//! without reaching thread end.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::error::{TraceError, TraceResult};
use crate::record::MemRef;
use crate::{ProcessId, ThreadId};

/// Counters kept by one writer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub records_written: u64,
    pub records_discarded: u64,
    pub drains: u64,
    pub bytes_written: u64,
}

pub struct LogWriter {
    tid: ThreadId,
    destination: String,
    out: Box<dyn Write + Send>,
    line: String,
    stats: WriterStats,
    closed: bool,
}

impl LogWriter {
    /// Create (truncating) the file at `path`
    pub fn open(path: &Path, tid: ThreadId) -> TraceResult<Self> {
        let file = File::create(path).map_err(|err| TraceError::open(path, err))?;
        debug!(tid = %tid, path = %path.display(), "Opened trace destination");
        Ok(Self::from_writer(
            path.display().to_string(),
            tid,
            BufWriter::new(file),
        ))
    }

    /// Wrap an arbitrary byte sink; `destination` names it in diagnostics
    pub fn from_writer(
        destination: impl Into<String>,
        tid: ThreadId,
        out: impl Write + Send + 'static,
    ) -> Self {
        Self {
            tid,
            destination: destination.into(),
            out: Box::new(out),
            line: String::with_capacity(64),
            stats: WriterStats::default(),
            closed: false,
        }
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Serialize one drained buffer, dropping records with a zero effective address
    pub fn drain(&mut self, records: &[MemRef]) -> TraceResult<()> {
        if self.closed {
            return Err(TraceError::DestinationClosed(self.destination.clone()));
        }

        let mut written = 0u64;
        for record in records.iter().filter(|record| record.is_valid()) {
            self.line.clear();
            // Writing into a String cannot fail
            let _ = writeln!(self.line, "{record}");
            self.out
                .write_all(self.line.as_bytes())
                .map_err(|err| TraceError::write(&self.destination, err))?;
            self.stats.bytes_written += self.line.len() as u64;
            written += 1;
        }
        self.out
            .flush()
            .map_err(|err| TraceError::write(&self.destination, err))?;

        let discarded = records.len() as u64 - written;
        self.stats.records_written += written;
        self.stats.records_discarded += discarded;
        self.stats.drains += 1;
        trace!(
            tid = %self.tid,
            written,
            discarded,
            "Drained buffer to {}",
            self.destination
        );
        Ok(())
    }

    /// Flush and close; later drains fail with `DestinationClosed`
    pub fn close(&mut self) -> TraceResult<WriterStats> {
        if self.closed {
            return Ok(self.stats);
        }
        self.closed = true;
        self.out
            .flush()
            .map_err(|err| TraceError::write(&self.destination, err))?;
        // Release the underlying handle now rather than when the writer drops
        self.out = Box::new(std::io::sink());
        debug!(
            tid = %self.tid,
            records = self.stats.records_written,
            discarded = self.stats.records_discarded,
            "Closed trace destination {}",
            self.destination
        );
        Ok(self.stats)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.out.flush() {
                warn!(
                    tid = %self.tid,
                    error = %err,
                    "Failed to flush {} on drop",
                    self.destination
                );
            }
        }
    }
}

/// Creates the writer of a newly started thread
pub trait WriterFactory: Send + Sync {
    fn create(&self, tid: ThreadId) -> TraceResult<LogWriter>;
}

/// Writes each thread to `<base>.<pid>.<tid>`
#[derive(Debug, Clone)]
pub struct FileWriterFactory {
    base_name: PathBuf,
    pid: ProcessId,
}

impl FileWriterFactory {
    pub fn new(base_name: impl Into<PathBuf>, pid: ProcessId) -> Self {
        Self {
            base_name: base_name.into(),
            pid,
        }
    }

    pub fn path_for(&self, tid: ThreadId) -> PathBuf {
        let mut name = self.base_name.clone().into_os_string();
        name.push(format!(".{}.{}", self.pid, tid));
        PathBuf::from(name)
    }
}

impl WriterFactory for FileWriterFactory {
    fn create(&self, tid: ThreadId) -> TraceResult<LogWriter> {
        LogWriter::open(&self.path_for(tid), tid)
    }
}
