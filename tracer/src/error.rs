use std::{fmt, io, path::PathBuf};

use thiserror::Error;

use crate::{lifecycle::ThreadState, ThreadId};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("could not allocate capture buffers: {0}")]
    PoolAllocation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not open output file {path:?}: {source}")]
    OpenDestination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("write to {destination} failed: {source}")]
    WriteDestination {
        destination: String,
        #[source]
        source: io::Error,
    },

    #[error("destination {0} is already closed")]
    DestinationClosed(String),

    #[error("thread {tid} is {state:?}")]
    ThreadLifecycle { tid: ThreadId, state: ThreadState },
}

pub type TraceResult<T> = Result<T, TraceError>;

impl TraceError {
    pub fn pool(details: impl fmt::Display) -> Self {
        Self::PoolAllocation(details.to_string())
    }

    pub fn config(details: impl fmt::Display) -> Self {
        Self::InvalidConfig(details.to_string())
    }

    pub fn open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::OpenDestination {
            path: path.into(),
            source,
        }
    }

    pub fn write(destination: impl fmt::Display, source: io::Error) -> Self {
        Self::WriteDestination {
            destination: destination.to_string(),
            source,
        }
    }
}
