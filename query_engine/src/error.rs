use std::{io, path::PathBuf};

use thiserror::Error;

/// Why a single trace line failed to parse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("expected 4 comma-separated fields, got {0}")]
    FieldCount(usize),
    #[error("invalid hex {field}: {value:?}")]
    InvalidHex { field: &'static str, value: String },
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),
    #[error("unknown access kind: {0:?}")]
    UnknownKind(String),
    #[error("line is not valid UTF-8")]
    NotUtf8,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path:?} line {line}: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: LineError,
    },
    #[error("no trace files found for {0:?}")]
    NotFound(PathBuf),
}

pub type QueryResult<T> = Result<T, QueryError>;

impl QueryError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
