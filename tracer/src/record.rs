//! Event record layout
//!
//! One [`MemRef`] describes one memory access. The layout is fixed so a host
//! engine that fills records field-by-field can do so through
//! [`MemRef::FIELD_OFFSETS`].

use std::fmt;
use std::mem::{offset_of, size_of};

/// Direction of a single memory access
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read = b'R',
    Write = b'W',
}

impl AccessKind {
    /// Single-character tag used in trace files
    pub const fn tag(self) -> char {
        self as u8 as char
    }

    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'R' => Some(AccessKind::Read),
            'W' => Some(AccessKind::Write),
            _ => None,
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// One captured memory access - 32 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub pc: u64,           // Address of the accessing instruction
    pub ea: u64,           // Effective address (0 = unresolved)
    pub kind: AccessKind,  // 'R' or 'W'
    pub timestamp: u64,    // Monotonic nanoseconds since session start
}

// Compile-time size check
const _: () = assert!(size_of::<MemRef>() == 32);

/// Byte offsets of each [`MemRef`] field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldOffsets {
    pub pc: usize,
    pub ea: usize,
    pub kind: usize,
    pub timestamp: usize,
}

impl MemRef {
    pub const SIZE: usize = size_of::<MemRef>();

    pub const FIELD_OFFSETS: FieldOffsets = FieldOffsets {
        pc: offset_of!(MemRef, pc),
        ea: offset_of!(MemRef, ea),
        kind: offset_of!(MemRef, kind),
        timestamp: offset_of!(MemRef, timestamp),
    };

    pub const fn new(pc: u64, ea: u64, kind: AccessKind, timestamp: u64) -> Self {
        MemRef {
            pc,
            ea,
            kind,
            timestamp,
        }
    }

    /// Records with an unresolved effective address are dropped at drain time
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.ea != 0
    }
}

/// Trace line form: `pc_hex,timestamp_decimal,kind,ea_hex`
impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x},{},{},{:x}", self.pc, self.timestamp, self.kind, self.ea)
    }
}
