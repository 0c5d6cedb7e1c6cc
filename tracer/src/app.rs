use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    config::{TimestampMode, TraceConfig},
    host::{self, ReplayHost},
    session::TraceSession,
    TracerStats,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "memtrace",
    author,
    version,
    about = "Record every memory access of a replayed workload, one trace file per thread",
    long_about = None
)]
pub struct Args {
    /// Base name of the per-thread output files (<base>.<pid>.<tid>)
    #[arg(short = 'o', long, value_name = "PATH", default_value = "buffer.out")]
    pub output_file_base_name: PathBuf,

    /// Pages (4 KiB) per capture buffer
    #[arg(long, default_value_t = 1024)]
    pub buffer_pages: usize,

    /// Capture buffers per thread
    #[arg(long, default_value_t = 2)]
    pub buffers_per_thread: usize,

    /// When each record's timestamp is sampled
    #[arg(long, value_enum, default_value_t = TimestampMode::AtAccess)]
    pub timestamp_mode: TimestampMode,

    /// Threads of the replayed workload
    #[arg(long, default_value_t = 2)]
    pub threads: usize,

    /// Loop iterations per thread
    #[arg(long, default_value_t = 100_000)]
    pub iterations: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub trace: TraceConfig,
    pub threads: usize,
    pub iterations: usize,
}

impl From<Args> for AppConfig {
    fn from(value: Args) -> Self {
        Self {
            trace: TraceConfig {
                output_base_name: value.output_file_base_name,
                buffer_pages: value.buffer_pages,
                buffers_per_thread: value.buffers_per_thread,
                timestamp_mode: value.timestamp_mode,
            },
            threads: value.threads,
            iterations: value.iterations,
        }
    }
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// Install a Ctrl+C handler that raises the returned flag
pub fn stop_on_ctrl_c() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, stopping replay");
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}

pub fn run(config: AppConfig, stop: Arc<AtomicBool>) -> Result<TracerStats> {
    if config.threads == 0 {
        anyhow::bail!("--threads must be at least 1");
    }

    let (program, scripts) = host::stream_copy(config.threads, config.iterations)
        .context("invalid replay workload")?;
    let session = TraceSession::start(config.trace.clone())
        .context("failed to start trace session")?;

    let host = ReplayHost::new(program).with_stop_flag(stop);

    info!(
        threads = config.threads,
        iterations = config.iterations,
        "Replaying stream-copy workload"
    );
    let started = Instant::now();
    host.run(&session, &scripts).context("tracing aborted")?;
    let elapsed = started.elapsed();

    let stats = session.finish();
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        records = stats.records_written,
        "Replay complete"
    );
    Ok(stats)
}
