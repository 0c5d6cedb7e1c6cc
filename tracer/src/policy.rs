//! Instrumentation policy
//!
//! Runs once per static instruction. Decides which capture actions the host
//! attaches in front of the instruction; never touches trace data itself.

use crate::clock::MonotonicClock;
use crate::config::TimestampMode;
use crate::record::{AccessKind, MemRef};

/// Read/write direction of a memory operand, as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandDirection {
    Read,
    Write,
    ReadWrite,
}

impl OperandDirection {
    pub fn is_read(self) -> bool {
        matches!(self, OperandDirection::Read | OperandDirection::ReadWrite)
    }

    pub fn is_written(self) -> bool {
        matches!(self, OperandDirection::Write | OperandDirection::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    /// Host index of the operand, used to resolve its effective address
    pub index: u32,
    pub direction: OperandDirection,
}

impl MemoryOperand {
    pub const fn new(index: u32, direction: OperandDirection) -> Self {
        Self { index, direction }
    }
}

/// The host engine's view of one decoded instruction
pub trait InstructionView {
    fn address(&self) -> u64;

    /// Conventional load/store style memory operand(s)
    fn is_standard_memop(&self) -> bool;

    /// Vector, gather or scatter memory operand(s)
    fn has_memory_vector(&self) -> bool;

    fn memory_operands(&self) -> &[MemoryOperand];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    /// Sample the clock when the action fires
    AtAccess,
    /// Value sampled once at instrumentation time
    Fixed(u64),
}

/// One record-append injected before an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureAction {
    pub operand: u32,
    pub kind: AccessKind,
    pub timestamp: TimestampSource,
}

impl CaptureAction {
    /// Build the record for one execution. Unconditional: a zero `ea` is
    /// recorded as-is and filtered at drain time.
    #[inline]
    pub fn fire(&self, pc: u64, ea: u64, clock: &MonotonicClock) -> MemRef {
        let timestamp = match self.timestamp {
            TimestampSource::AtAccess => clock.now_ns(),
            TimestampSource::Fixed(value) => value,
        };
        MemRef::new(pc, ea, self.kind, timestamp)
    }
}

/// Capture actions attached to one static instruction, fixed once decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationSite {
    pub pc: u64,
    pub actions: Vec<CaptureAction>,
}

#[derive(Debug, Clone, Copy)]
pub struct InstrumentationPolicy {
    mode: TimestampMode,
    clock: MonotonicClock,
}

impl InstrumentationPolicy {
    pub fn new(mode: TimestampMode, clock: MonotonicClock) -> Self {
        Self { mode, clock }
    }

    pub fn timestamp_mode(&self) -> TimestampMode {
        self.mode
    }

    /// Decide the capture actions for `ins`.
    ///
    /// Returns `None` for instructions with neither a standard nor a vector
    /// memory operand; those are left uninstrumented. An operand that is both
    /// read and written gets a Read action followed by a Write action.
    pub fn instrument<I: InstructionView + ?Sized>(&self, ins: &I) -> Option<InstrumentationSite> {
        if !ins.is_standard_memop() && !ins.has_memory_vector() {
            return None;
        }

        let operands = ins.memory_operands();
        let mut actions = Vec::with_capacity(operands.len() * 2);
        for operand in operands {
            // Fixed timestamps are sampled per operand, like the site itself
            let timestamp = match self.mode {
                TimestampMode::AtAccess => TimestampSource::AtAccess,
                TimestampMode::AtInstrumentation => TimestampSource::Fixed(self.clock.now_ns()),
            };
            if operand.direction.is_read() {
                actions.push(CaptureAction {
                    operand: operand.index,
                    kind: AccessKind::Read,
                    timestamp,
                });
            }
            if operand.direction.is_written() {
                actions.push(CaptureAction {
                    operand: operand.index,
                    kind: AccessKind::Write,
                    timestamp,
                });
            }
        }

        Some(InstrumentationSite {
            pc: ins.address(),
            actions,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    struct Ins {
        address: u64,
        standard: bool,
        vector: bool,
        operands: Vec<MemoryOperand>,
    }

    impl InstructionView for Ins {
        fn address(&self) -> u64 {
            self.address
        }

        fn is_standard_memop(&self) -> bool {
            self.standard
        }

        fn has_memory_vector(&self) -> bool {
            self.vector
        }

        fn memory_operands(&self) -> &[MemoryOperand] {
            &self.operands
        }
    }

    fn standard(operands: Vec<MemoryOperand>) -> Ins {
        Ins {
            address: 0x400000,
            standard: true,
            vector: false,
            operands,
        }
    }

    fn policy(mode: TimestampMode) -> InstrumentationPolicy {
        InstrumentationPolicy::new(mode, MonotonicClock::new())
    }

    #[test]
    fn instrument__read_operand__then_single_read_action() {
        let site = policy(TimestampMode::AtAccess)
            .instrument(&standard(vec![MemoryOperand::new(0, OperandDirection::Read)]))
            .unwrap();

        assert_eq!(site.pc, 0x400000);
        assert_eq!(
            site.actions,
            vec![CaptureAction {
                operand: 0,
                kind: AccessKind::Read,
                timestamp: TimestampSource::AtAccess,
            }]
        );
    }

    #[test]
    fn instrument__read_write_operand__then_read_then_write() {
        let site = policy(TimestampMode::AtAccess)
            .instrument(&standard(vec![MemoryOperand::new(
                1,
                OperandDirection::ReadWrite,
            )]))
            .unwrap();

        let kinds: Vec<_> = site.actions.iter().map(|a| (a.operand, a.kind)).collect();
        assert_eq!(kinds, vec![(1, AccessKind::Read), (1, AccessKind::Write)]);
    }

    #[test]
    fn instrument__several_operands__then_actions_in_operand_order() {
        let site = policy(TimestampMode::AtAccess)
            .instrument(&standard(vec![
                MemoryOperand::new(0, OperandDirection::Write),
                MemoryOperand::new(1, OperandDirection::Read),
            ]))
            .unwrap();

        let kinds: Vec<_> = site.actions.iter().map(|a| (a.operand, a.kind)).collect();
        assert_eq!(kinds, vec![(0, AccessKind::Write), (1, AccessKind::Read)]);
    }

    #[test]
    fn instrument__no_memory_operand_shape__then_skipped() {
        let ins = Ins {
            address: 0x400010,
            standard: false,
            vector: false,
            operands: vec![MemoryOperand::new(0, OperandDirection::Read)],
        };
        assert!(policy(TimestampMode::AtAccess).instrument(&ins).is_none());
    }

    #[test]
    fn instrument__vector_operand__then_instrumented() {
        let ins = Ins {
            address: 0x400020,
            standard: false,
            vector: true,
            operands: vec![MemoryOperand::new(0, OperandDirection::Read)],
        };
        let site = policy(TimestampMode::AtAccess).instrument(&ins).unwrap();
        assert_eq!(site.actions.len(), 1);
    }

    #[test]
    fn instrument__at_instrumentation_mode__then_fixed_timestamp_reused() {
        let clock = MonotonicClock::new();
        let site = InstrumentationPolicy::new(TimestampMode::AtInstrumentation, clock)
            .instrument(&standard(vec![MemoryOperand::new(
                0,
                OperandDirection::ReadWrite,
            )]))
            .unwrap();

        let TimestampSource::Fixed(fixed) = site.actions[0].timestamp else {
            panic!("expected fixed timestamp");
        };
        assert_eq!(site.actions[1].timestamp, TimestampSource::Fixed(fixed));

        let first = site.actions[0].fire(site.pc, 0x1000, &clock);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let second = site.actions[0].fire(site.pc, 0x1000, &clock);
        assert_eq!(first.timestamp, fixed);
        assert_eq!(second.timestamp, fixed);
    }

    #[test]
    fn capture_action__fire_at_access__then_fresh_timestamp_per_execution() {
        let clock = MonotonicClock::new();
        let action = CaptureAction {
            operand: 0,
            kind: AccessKind::Write,
            timestamp: TimestampSource::AtAccess,
        };

        let first = action.fire(0x400004, 0x1008, &clock);
        std::thread::sleep(std::time::Duration::from_millis(1));
        let second = action.fire(0x400004, 0x1008, &clock);

        assert_eq!(first.kind, AccessKind::Write);
        assert_eq!((first.pc, first.ea), (0x400004, 0x1008));
        assert!(second.timestamp > first.timestamp);
    }

    #[test]
    fn capture_action__zero_effective_address__then_still_recorded() {
        let action = CaptureAction {
            operand: 0,
            kind: AccessKind::Read,
            timestamp: TimestampSource::Fixed(5),
        };
        let record = action.fire(0x400000, 0, &MonotonicClock::new());
        assert_eq!(record, MemRef::new(0x400000, 0, AccessKind::Read, 5));
    }
}
