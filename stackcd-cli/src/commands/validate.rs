//! `stackcd validate` — load the config and report what it defines.
//!
//! Unknown stack keys are warnings, not errors.

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use super::ConfigArgs;

/// Arguments for `stackcd validate`.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

impl ValidateArgs {
    pub fn run(self) -> Result<()> {
        let (config, path) = self.config.load()?;
        for unknown in config.unknown_keys() {
            println!("{} {unknown}", "⚠".yellow().bold());
        }
        println!(
            "{} {} is valid ({} repos, {} stacks)",
            "✓".green().bold(),
            path.display(),
            config.repos.len(),
            config.stacks.len()
        );
        Ok(())
    }
}
