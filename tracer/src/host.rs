//! In-process replay host
//!
//! Plays the part of the instrumentation engine for a synthetic program: it
//! instruments each static instruction at most once, runs one OS thread per
//! script, sends the start notification before a thread's first execution and
//! the end notification after its last, and resolves effective addresses from
//! the script.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::error::{TraceError, TraceResult};
use crate::policy::{InstructionView, InstrumentationSite, MemoryOperand, OperandDirection};
use crate::session::TraceSession;
use crate::ThreadId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticInstruction {
    pub address: u64,
    pub standard_memop: bool,
    pub memory_vector: bool,
    pub operands: Vec<MemoryOperand>,
}

impl SyntheticInstruction {
    pub fn load(address: u64) -> Self {
        Self::standard(address, vec![MemoryOperand::new(0, OperandDirection::Read)])
    }

    pub fn store(address: u64) -> Self {
        Self::standard(address, vec![MemoryOperand::new(0, OperandDirection::Write)])
    }

    /// e.g. `add [mem], reg`
    pub fn read_modify_write(address: u64) -> Self {
        Self::standard(
            address,
            vec![MemoryOperand::new(0, OperandDirection::ReadWrite)],
        )
    }

    /// Gather load with one operand per lane
    pub fn gather(address: u64, lanes: u32) -> Self {
        Self {
            address,
            standard_memop: false,
            memory_vector: true,
            operands: (0..lanes)
                .map(|lane| MemoryOperand::new(lane, OperandDirection::Read))
                .collect(),
        }
    }

    /// Register-only instruction
    pub fn alu(address: u64) -> Self {
        Self {
            address,
            standard_memop: false,
            memory_vector: false,
            operands: Vec::new(),
        }
    }

    fn standard(address: u64, operands: Vec<MemoryOperand>) -> Self {
        Self {
            address,
            standard_memop: true,
            memory_vector: false,
            operands,
        }
    }
}

impl InstructionView for SyntheticInstruction {
    fn address(&self) -> u64 {
        self.address
    }

    fn is_standard_memop(&self) -> bool {
        self.standard_memop
    }

    fn has_memory_vector(&self) -> bool {
        self.memory_vector
    }

    fn memory_operands(&self) -> &[MemoryOperand] {
        &self.operands
    }
}

/// One dynamic execution: which static instruction ran and the effective
/// address of each of its memory operands, by operand index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub instruction: usize,
    pub effective_addresses: Vec<u64>,
}

impl Execution {
    pub fn new(instruction: usize, effective_addresses: Vec<u64>) -> Self {
        Self {
            instruction,
            effective_addresses,
        }
    }
}

/// Executions of one thread, in program order.
///
/// Either an explicit list or a generator called once per step index; a
/// generated script never holds more than the step being replayed.
#[derive(Clone)]
pub struct ThreadScript {
    len: usize,
    steps: Steps,
}

#[derive(Clone)]
enum Steps {
    Listed(Vec<Execution>),
    Generated(Arc<dyn Fn(usize) -> Execution + Send + Sync>),
}

impl ThreadScript {
    pub fn new(steps: Vec<Execution>) -> Self {
        Self {
            len: steps.len(),
            steps: Steps::Listed(steps),
        }
    }

    /// `len` steps, step `i` produced by `step(i)` when it is replayed
    pub fn generated<F>(len: usize, step: F) -> Self
    where
        F: Fn(usize) -> Execution + Send + Sync + 'static,
    {
        Self {
            len,
            steps: Steps::Generated(Arc::new(step)),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn step(&self, index: usize) -> Option<Cow<'_, Execution>> {
        if index >= self.len {
            return None;
        }
        match &self.steps {
            Steps::Listed(steps) => steps.get(index).map(Cow::Borrowed),
            Steps::Generated(step) => Some(Cow::Owned(step(index))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Cow<'_, Execution>> + '_ {
        (0..self.len).filter_map(move |index| self.step(index))
    }
}

impl fmt::Debug for ThreadScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.steps {
            Steps::Listed(_) => "listed",
            Steps::Generated(_) => "generated",
        };
        f.debug_struct("ThreadScript")
            .field("len", &self.len)
            .field("steps", &kind)
            .finish()
    }
}

pub struct ReplayHost {
    program: Vec<SyntheticInstruction>,
    // None marks an instruction the policy chose not to instrument
    sites: RwLock<HashMap<usize, Option<Arc<InstrumentationSite>>>>,
    stop: Arc<AtomicBool>,
}

impl ReplayHost {
    pub fn new(program: Vec<SyntheticInstruction>) -> Self {
        Self {
            program,
            sites: RwLock::new(HashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an external stop flag (e.g. set from a Ctrl+C handler)
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn program(&self) -> &[SyntheticInstruction] {
        &self.program
    }

    /// Static instructions seen so far, instrumented or not
    pub fn observed_instructions(&self) -> usize {
        self.sites.read().len()
    }

    /// Run every script on its own thread; script `i` runs as `ThreadId(i)`.
    ///
    /// The first fatal error stops all threads; each still drains and closes
    /// its destination before the error is returned.
    pub fn run(&self, session: &TraceSession, scripts: &[ThreadScript]) -> TraceResult<()> {
        let outcome = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = scripts
                .iter()
                .enumerate()
                .map(|(index, script)| {
                    let tid = ThreadId(index as u32);
                    scope.spawn(move |_| self.run_thread(session, tid, script))
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect::<Vec<_>>()
        });

        let results = match outcome {
            Ok(results) => results,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        results.into_iter().collect()
    }

    fn run_thread(
        &self,
        session: &TraceSession,
        tid: ThreadId,
        script: &ThreadScript,
    ) -> TraceResult<()> {
        let mut capture = session.thread_start(tid).map_err(|err| {
            self.stop.store(true, Ordering::SeqCst);
            err
        })?;

        let mut executed = 0usize;
        let mut result = Ok(());
        for step in script.iter() {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            if let Some(site) = self.site_for(session, step.instruction) {
                // Unresolvable operands record a zero address, dropped at drain
                result = capture.execute(&site, |operand| {
                    step.effective_addresses
                        .get(operand as usize)
                        .copied()
                        .unwrap_or(0)
                });
                if result.is_err() {
                    break;
                }
            }
            executed += 1;
        }

        if let Err(err) = &result {
            error!(tid = %tid, error = %err, "Capture failed, stopping all threads");
            self.stop.store(true, Ordering::SeqCst);
        }
        let fini = session.thread_fini(capture);
        debug!(tid = %tid, executed, total = script.len(), "Replay thread done");
        result.and(fini.map(|_| ()))
    }

    /// Instrument `index` on first sight; later lookups reuse the decision
    fn site_for(&self, session: &TraceSession, index: usize) -> Option<Arc<InstrumentationSite>> {
        if let Some(site) = self.sites.read().get(&index) {
            return site.clone();
        }

        let mut sites = self.sites.write();
        sites
            .entry(index)
            .or_insert_with(|| {
                self.program
                    .get(index)
                    .and_then(|ins| session.instrument(ins))
                    .map(Arc::new)
            })
            .clone()
    }
}

/// Array-copy kernel: `dst[i] = src[i]; counter += 1;` with a loop branch.
///
/// Each thread copies its own arrays; all threads share the counter. Steps
/// are generated on demand, so the iteration count does not bound memory.
pub fn stream_copy(
    threads: usize,
    iterations: usize,
) -> TraceResult<(Vec<SyntheticInstruction>, Vec<ThreadScript>)> {
    const COUNTER: u64 = 0x6000_0000;
    const STEPS_PER_ITERATION: usize = 4;

    let len = iterations.checked_mul(STEPS_PER_ITERATION).ok_or_else(|| {
        TraceError::config(format!("{iterations} iterations overflow the step count"))
    })?;

    let program = vec![
        SyntheticInstruction::load(0x400000),
        SyntheticInstruction::store(0x400004),
        SyntheticInstruction::read_modify_write(0x400008),
        SyntheticInstruction::alu(0x40000c),
    ];

    let scripts = (0..threads as u64)
        .map(|t| {
            let window = t.wrapping_mul(0x0100_0000);
            let src = 0x1000_0000u64.wrapping_add(window);
            let dst = 0x2000_0000u64.wrapping_add(window);
            ThreadScript::generated(len, move |step| {
                let offset = ((step / STEPS_PER_ITERATION) as u64).wrapping_mul(8);
                match step % STEPS_PER_ITERATION {
                    0 => Execution::new(0, vec![src.wrapping_add(offset)]),
                    1 => Execution::new(1, vec![dst.wrapping_add(offset)]),
                    2 => Execution::new(2, vec![COUNTER]),
                    _ => Execution::new(3, Vec::new()),
                }
            })
        })
        .collect();

    Ok((program, scripts))
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::config::TraceConfig;
    use crate::ProcessId;
    use tempfile::TempDir;

    fn session(dir: &TempDir) -> TraceSession {
        TraceSession::start(TraceConfig {
            output_base_name: dir.path().join("buffer.out"),
            buffer_pages: 1,
            ..Default::default()
        })
        .unwrap()
    }

    fn lines(dir: &TempDir, tid: u32) -> Vec<String> {
        let path = dir
            .path()
            .join(format!("buffer.out.{}.{}", ProcessId::current(), tid));
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn stream_copy__shape__then_four_steps_per_iteration() {
        let (program, scripts) = stream_copy(3, 10).unwrap();
        assert_eq!(program.len(), 4);
        assert_eq!(scripts.len(), 3);
        assert!(scripts.iter().all(|s| s.len() == 40));
    }

    #[test]
    fn stream_copy__huge_iteration_count__then_steps_generated_on_demand() {
        let iterations = 1usize << 40;
        let (_, scripts) = stream_copy(2, iterations).unwrap();
        let script = &scripts[1];

        assert_eq!(script.len(), iterations * 4);
        let last = iterations as u64 - 1;
        let load = script.step(script.len() - 4).unwrap();
        assert_eq!(load.instruction, 0);
        assert_eq!(load.effective_addresses, vec![0x1100_0000 + last * 8]);
        let branch = script.step(script.len() - 1).unwrap();
        assert_eq!(branch.instruction, 3);
        assert!(script.step(script.len()).is_none());
    }

    #[test]
    fn stream_copy__step_count_overflows__then_invalid_config() {
        let err = stream_copy(1, usize::MAX / 2 + 1).err().unwrap();
        assert!(matches!(err, TraceError::InvalidConfig(_)));
    }

    #[test]
    fn replay_host__huge_script_stopped__then_ends_without_replaying() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let (program, scripts) = stream_copy(1, 1 << 40).unwrap();
        let host = ReplayHost::new(program).with_stop_flag(Arc::new(AtomicBool::new(true)));

        host.run(&session, &scripts).unwrap();

        assert_eq!(session.stats().threads_ended, 1);
        assert!(lines(&dir, 0).is_empty());
    }

    #[test]
    fn replay_host__stream_copy__then_four_records_per_iteration() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let (program, scripts) = stream_copy(2, 100).unwrap();
        let host = ReplayHost::new(program);

        host.run(&session, &scripts).unwrap();

        for tid in 0..2 {
            let lines = lines(&dir, tid);
            // load + store + read and write of the counter; the ALU op is skipped
            assert_eq!(lines.len(), 400);
            assert!(lines[0].starts_with("400000,"));
            assert!(lines[2].starts_with("400008,") && lines[2].contains(",R,"));
            assert!(lines[3].starts_with("400008,") && lines[3].contains(",W,"));
        }
        assert_eq!(host.observed_instructions(), 4);
        assert_eq!(session.stats().threads_ended, 2);
    }

    #[test]
    fn replay_host__same_instruction_many_times__then_instrumented_once() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let host = ReplayHost::new(vec![SyntheticInstruction::load(0x400000)]);

        let first = host.site_for(&session, 0).unwrap();
        let second = host.site_for(&session, 0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(host.site_for(&session, 7).is_none());
        assert_eq!(host.observed_instructions(), 2);
    }

    #[test]
    fn replay_host__gather__then_one_record_per_lane() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let host = ReplayHost::new(vec![SyntheticInstruction::gather(0x400100, 4)]);
        let script = ThreadScript::new(vec![Execution::new(0, vec![0x10, 0x20, 0x30, 0x40])]);

        host.run(&session, &[script]).unwrap();

        let eas: Vec<String> = lines(&dir, 0)
            .iter()
            .map(|line| line.rsplit(',').next().unwrap().to_owned())
            .collect();
        assert_eq!(eas, vec!["10", "20", "30", "40"]);
    }

    #[test]
    fn replay_host__unresolved_operand__then_record_dropped() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let host = ReplayHost::new(vec![SyntheticInstruction::load(0x400000)]);
        let script = ThreadScript::new(vec![
            Execution::new(0, Vec::new()),
            Execution::new(0, vec![0x1234]),
        ]);

        host.run(&session, &[script]).unwrap();

        let lines = lines(&dir, 0);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(",R,1234"));
        assert_eq!(session.stats().records_discarded, 1);
    }

    #[test]
    fn replay_host__stop_flag_set__then_threads_end_cleanly() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir);
        let (program, scripts) = stream_copy(2, 50).unwrap();
        let stop = Arc::new(AtomicBool::new(true));
        let host = ReplayHost::new(program).with_stop_flag(stop);

        host.run(&session, &scripts).unwrap();

        let stats = session.stats();
        assert_eq!(stats.threads_started, 2);
        assert_eq!(stats.threads_ended, 2);
        assert_eq!(stats.records_written, 0);
        assert!(lines(&dir, 0).is_empty());
    }

    #[test]
    fn replay_host__destination_unavailable__then_error_returned() {
        let dir = TempDir::new().unwrap();
        let session = TraceSession::start(TraceConfig {
            output_base_name: dir.path().join("missing").join("buffer.out"),
            ..Default::default()
        })
        .unwrap();
        let (program, scripts) = stream_copy(1, 1).unwrap();

        let err = ReplayHost::new(program).run(&session, &scripts).unwrap_err();
        assert!(matches!(err, TraceError::OpenDestination { .. }));
    }
}
