//! Read-back of memtrace output
//!
//! Each traced thread leaves one text file named `<base>.<pid>.<tid>` holding
//! one `pc_hex,timestamp,kind,ea_hex` line per recorded access, in the order the
//! thread executed them. This crate parses those files back into
//! [`memtrace::MemRef`] values.

pub mod error;
pub mod line;
pub mod reader;
pub mod session;

pub use error::{LineError, QueryError, QueryResult};
pub use line::parse_line;
pub use reader::{RecordIter, TraceFileName, TraceFileReader};
pub use session::{SessionReader, ThreadTrace};
