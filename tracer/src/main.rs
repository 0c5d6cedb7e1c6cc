use anyhow::Result;
use clap::Parser;
use memtrace::app::{self, AppConfig, Args};

fn main() -> Result<()> {
    let args = Args::parse();
    app::init_tracing();
    let config = AppConfig::from(args);
    let stop = app::stop_on_ctrl_c()?;
    app::run(config, stop)?;
    Ok(())
}
