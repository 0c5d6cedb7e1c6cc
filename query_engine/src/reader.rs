//! Memory-mapped reader for one thread's trace file

use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use memtrace::{MemRef, ProcessId, ThreadId};

use crate::error::{LineError, QueryError, QueryResult};
use crate::line::parse_line;

/// `<base>.<pid>.<tid>` split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFileName {
    pub base: String,
    pub pid: ProcessId,
    pub tid: ThreadId,
}

impl TraceFileName {
    pub fn parse(file_name: &OsStr) -> Option<Self> {
        let name = file_name.to_str()?;
        let (rest, tid) = name.rsplit_once('.')?;
        let (base, pid) = rest.rsplit_once('.')?;
        if base.is_empty() {
            return None;
        }
        Some(Self {
            base: base.to_owned(),
            pid: ProcessId(pid.parse().ok()?),
            tid: ThreadId(tid.parse().ok()?),
        })
    }
}

pub struct TraceFileReader {
    path: PathBuf,
    // Zero-length files cannot be mapped
    mmap: Option<Mmap>,
}

impl TraceFileReader {
    pub fn open(path: &Path) -> QueryResult<Self> {
        let file = File::open(path).map_err(|err| QueryError::io(path, err))?;
        let len = file
            .metadata()
            .map_err(|err| QueryError::io(path, err))?
            .len();

        let mmap = if len == 0 {
            None
        } else {
            // SAFETY: trace files are only appended by their writer thread,
            // which has finished by the time they are read back
            Some(unsafe { Mmap::map(&file) }.map_err(|err| QueryError::io(path, err))?)
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Records in file order
    pub fn iter(&self) -> RecordIter<'_> {
        RecordIter {
            path: &self.path,
            remaining: self.bytes(),
            line: 0,
        }
    }

    /// All records, failing on the first malformed line
    pub fn records(&self) -> QueryResult<Vec<MemRef>> {
        self.iter().collect()
    }

    /// Timestamps of the first and last record
    pub fn time_range(&self) -> QueryResult<Option<(u64, u64)>> {
        let mut iter = self.iter();
        let Some(first) = iter.next().transpose()? else {
            return Ok(None);
        };
        let last = match self.last_line() {
            Some((line, text)) => parse_text(&self.path, line, text)?,
            None => first,
        };
        Ok(Some((first.timestamp, last.timestamp)))
    }

    // Scan backwards instead of parsing the whole file
    fn last_line(&self) -> Option<(usize, &[u8])> {
        let bytes = self.bytes();
        let trimmed = bytes.strip_suffix(b"\n").unwrap_or(bytes);
        if trimmed.is_empty() {
            return None;
        }
        let start = trimmed
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |pos| pos + 1);
        let line = count_newlines(&bytes[..start]) + 1;
        Some((line, &trimmed[start..]))
    }
}

fn count_newlines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| **b == b'\n').count()
}

fn parse_text(path: &Path, line: usize, text: &[u8]) -> QueryResult<MemRef> {
    let parse_error = |source: LineError| QueryError::Parse {
        path: path.to_path_buf(),
        line,
        source,
    };
    let text = std::str::from_utf8(text).map_err(|_| parse_error(LineError::NotUtf8))?;
    parse_line(text).map_err(parse_error)
}

/// Iterator over the records of one trace file
pub struct RecordIter<'a> {
    path: &'a Path,
    remaining: &'a [u8],
    line: usize,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = QueryResult<MemRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let (text, rest) = match self.remaining.iter().position(|b| *b == b'\n') {
            Some(pos) => (&self.remaining[..pos], &self.remaining[pos + 1..]),
            None => (self.remaining, &[][..]),
        };
        self.remaining = rest;
        self.line += 1;
        Some(parse_text(self.path, self.line, text))
    }
}
