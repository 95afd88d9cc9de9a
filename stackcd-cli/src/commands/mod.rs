pub mod check;
pub mod run;
pub mod stacks;
pub mod validate;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use stackcd_core::{config, Config};

/// `--config`, shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Configuration file [default: $STACKCD_CONFIG or ~/.stackcd/config.yaml].
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => config::default_config_path().context("could not determine config path"),
        }
    }

    /// Load and validate; returns the config with the path it came from.
    pub fn load(&self) -> Result<(Config, PathBuf)> {
        let path = self.path()?;
        let config = config::load_at(&path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        Ok((config, path))
    }
}
