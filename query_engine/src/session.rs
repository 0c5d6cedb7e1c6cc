//! Discovery of every thread file written under one base name

use std::fs;
use std::path::{Path, PathBuf};

use memtrace::{ProcessId, ThreadId};
use tracing::debug;

use crate::error::{QueryError, QueryResult};
use crate::reader::{TraceFileName, TraceFileReader};

/// One thread's trace file
pub struct ThreadTrace {
    pub pid: ProcessId,
    pub tid: ThreadId,
    pub reader: TraceFileReader,
}

/// All thread files sharing a base name, sorted by (pid, tid)
pub struct SessionReader {
    base: PathBuf,
    threads: Vec<ThreadTrace>,
}

impl SessionReader {
    /// Open every `<base>.<pid>.<tid>` file next to `base`
    pub fn open(base: &Path) -> QueryResult<Self> {
        let base_name = base
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| QueryError::NotFound(base.to_path_buf()))?;
        let dir = match base.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let entries = fs::read_dir(dir).map_err(|err| QueryError::io(dir, err))?;
        let mut threads = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| QueryError::io(dir, err))?;
            let Some(name) = TraceFileName::parse(&entry.file_name()) else {
                continue;
            };
            if name.base != base_name {
                continue;
            }
            let reader = TraceFileReader::open(&entry.path())?;
            threads.push(ThreadTrace {
                pid: name.pid,
                tid: name.tid,
                reader,
            });
        }

        if threads.is_empty() {
            return Err(QueryError::NotFound(base.to_path_buf()));
        }
        threads.sort_by_key(|thread| (thread.pid, thread.tid));
        debug!(base = %base.display(), threads = threads.len(), "Opened trace session");

        Ok(Self {
            base: base.to_path_buf(),
            threads,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn threads(&self) -> &[ThreadTrace] {
        &self.threads
    }

    pub fn thread(&self, pid: ProcessId, tid: ThreadId) -> Option<&ThreadTrace> {
        self.threads
            .iter()
            .find(|thread| thread.pid == pid && thread.tid == tid)
    }

    /// Distinct processes that wrote under this base name
    pub fn processes(&self) -> Vec<ProcessId> {
        let mut pids: Vec<_> = self.threads.iter().map(|thread| thread.pid).collect();
        pids.dedup();
        pids
    }
}
