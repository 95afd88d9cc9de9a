//! `stackcd run` — start the scheduler.

use anyhow::{Context, Result};
use clap::Args;

use stackcd_daemon::RunOptions;

use super::ConfigArgs;

/// Arguments for `stackcd run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Log what would be deployed instead of calling docker.
    #[arg(long)]
    pub dry_run: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let (config, path) = self.config.load()?;
        let options = RunOptions {
            dry_run: self.dry_run,
            json_logs: self.json_logs,
        };
        stackcd_daemon::start_blocking(config, &path, options).context("scheduler stopped with an error")
    }
}
