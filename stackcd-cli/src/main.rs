//! stackcd — GitOps sync and reconcile for swarm stacks.
//!
//! # Usage
//!
//! ```text
//! stackcd run [--config <path>] [--dry-run] [--json-logs]
//! stackcd check <stack> [--config <path>] [--no-rotate]
//! stackcd stacks [--config <path>]
//! stackcd validate [--config <path>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{check::CheckArgs, run::RunArgs, stacks::StacksArgs, validate::ValidateArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "stackcd",
    version,
    about = "Keep swarm stacks in sync with their git repositories",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile every configured stack on a schedule until ctrl-c.
    Run(RunArgs),

    /// Run one reconcile cycle for a stack and print the result. Deploys nothing.
    Check(CheckArgs),

    /// List configured stacks.
    Stacks(StacksArgs),

    /// Load and validate the configuration file.
    Validate(ValidateArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Check(args) => args.run(),
        Commands::Stacks(args) => args.run(),
        Commands::Validate(args) => args.run(),
    }
}
