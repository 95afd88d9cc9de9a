//! `stackcd check` — one reconcile cycle for one stack, printed, never deployed.

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use stackcd_core::types::StackName;
use stackcd_sync::{ResolvedStack, RotationStatus, SopsDecryptor, Stack, StackRepo};

use super::ConfigArgs;

/// Arguments for `stackcd check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Name of the stack to check.
    pub stack: String,

    #[command(flatten)]
    pub config: ConfigArgs,

    /// Skip secret/config rotation.
    #[arg(long)]
    pub no_rotate: bool,
}

impl CheckArgs {
    pub fn run(self) -> Result<()> {
        stackcd_daemon::init_tracing(false);
        let (config, path) = self.config.load()?;

        let name = StackName::from(self.stack.as_str());
        for unknown in config.unknown_keys().iter().filter(|u| u.stack == name) {
            eprintln!("{} {unknown}", "⚠".yellow().bold());
        }
        let Some(stack_config) = config.stacks.get(&name) else {
            let known: Vec<_> = config.stacks.keys().map(|k| k.0.as_str()).collect();
            bail!(
                "unknown stack '{name}'; configured stacks: {}",
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            );
        };
        let repo_config = config
            .repos
            .get(&stack_config.repo)
            .with_context(|| format!("stack '{name}' references unknown repo '{}'", stack_config.repo))?;
        let credential = repo_config
            .credential()
            .with_context(|| format!("failed to load credential for repo '{}'", stack_config.repo))?;

        let repo = StackRepo::clone_or_open(
            stack_config.repo.clone(),
            config.repo_path(&path, &stack_config.repo),
            repo_config.url.clone(),
            credential,
        )
        .with_context(|| format!("failed to prepare repo '{}'", stack_config.repo))?;

        let stack = Stack::from_config(name.clone(), stack_config, Arc::new(repo))
            .with_decryptor(Arc::new(SopsDecryptor::new(&config.sops_binary)))
            .with_rotation(config.auto_rotate && !self.no_rotate);
        let resolved = stack
            .reconcile()
            .with_context(|| format!("check failed for stack '{name}'"))?;

        print_resolved(&resolved)
    }
}

fn print_resolved(resolved: &ResolvedStack) -> Result<()> {
    println!("{} stack '{}' resolved", "✓".green().bold(), resolved.stack);
    field("ref:", &resolved.reference);
    field("revision:", &resolved.revision);
    field("compose:", resolved.compose_path.display());

    let services = resolved
        .definition
        .service_names()
        .context("failed to read services")?;
    field("services:", list_or_none(&services));

    let secrets: Vec<String> = resolved
        .secret_files
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    field("secrets:", list_or_none(&secrets));

    let staged: Vec<String> = resolved
        .staged
        .iter()
        .map(|object| format!("{} {}", object.kind, object.name))
        .chain(
            resolved
                .env_files
                .iter()
                .map(|env| format!("env_file {} ({})", env.file.display(), env.service)),
        )
        .collect();
    field("staged:", list_or_none(&staged));

    if resolved.rotated.is_empty() {
        field("objects:", "none");
    } else {
        println!("  {}", "objects:".bold());
        for object in &resolved.rotated {
            let status = match object.status {
                RotationStatus::Rotated => "rotated".yellow(),
                RotationStatus::Unchanged => "unchanged".bright_black(),
            };
            println!(
                "    {} {} -> {} ({status})",
                object.kind, object.name, object.versioned_name
            );
        }
    }
    Ok(())
}

fn field(label: &str, value: impl fmt::Display) {
    println!("  {} {value}", format!("{label:<10}").bold());
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
