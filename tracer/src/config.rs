use std::path::PathBuf;

use clap::ValueEnum;

use crate::error::{TraceError, TraceResult};

/// When the timestamp of a capture action is sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TimestampMode {
    /// Read the clock on every executed access
    #[default]
    AtAccess,
    /// Read the clock once when the instruction is instrumented.
    ///
    /// Sites are shared by every thread, so a thread started after a site was
    /// built records timestamps older than its own start notification.
    AtInstrumentation,
}

/// Tracer configuration
#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Base name of per-thread output files (`<base>.<pid>.<tid>`)
    pub output_base_name: PathBuf,
    /// Pages per capture buffer
    pub buffer_pages: usize,
    /// Capture buffers per thread
    pub buffers_per_thread: usize,
    pub timestamp_mode: TimestampMode,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            output_base_name: PathBuf::from("buffer.out"),
            buffer_pages: 1024,     // 4MB per buffer
            buffers_per_thread: 2,  // one draining, one filling
            timestamp_mode: TimestampMode::AtAccess,
        }
    }
}

impl TraceConfig {
    pub fn validate(&self) -> TraceResult<()> {
        if self.output_base_name.as_os_str().is_empty() {
            return Err(TraceError::config("output file base name is empty"));
        }
        if self.buffer_pages == 0 {
            return Err(TraceError::config("buffer pages must be at least 1"));
        }
        if self.buffers_per_thread < 2 {
            return Err(TraceError::config(format!(
                "at least 2 buffers per thread are required, got {}",
                self.buffers_per_thread
            )));
        }
        Ok(())
    }
}
