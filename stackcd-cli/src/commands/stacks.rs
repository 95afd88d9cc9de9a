//! `stackcd stacks` — table of configured stacks.

use anyhow::Result;
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use stackcd_core::types::{StackConfig, StackName};

use super::ConfigArgs;

/// Arguments for `stackcd stacks`.
#[derive(Args, Debug)]
pub struct StacksArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Tabled)]
struct StackRow {
    #[tabled(rename = "stack")]
    stack: String,
    #[tabled(rename = "repo")]
    repo: String,
    #[tabled(rename = "ref")]
    reference: String,
    #[tabled(rename = "compose file")]
    compose_file: String,
    #[tabled(rename = "deployed as")]
    deployed_as: String,
}

impl StacksArgs {
    pub fn run(self) -> Result<()> {
        let (config, _) = self.config.load()?;
        if config.stacks.is_empty() {
            println!("No stacks configured.");
            return Ok(());
        }

        let rows: Vec<StackRow> = config
            .stacks
            .iter()
            .map(|(name, stack)| row(name, stack))
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn row(name: &StackName, stack: &StackConfig) -> StackRow {
    // Tag wins when both are set.
    let reference = if stack.tag.is_empty() {
        format!("branch {}", stack.branch)
    } else {
        format!("tag {}", stack.tag)
    };
    StackRow {
        stack: name.to_string(),
        repo: stack.repo.to_string(),
        reference,
        compose_file: stack.compose_file.display().to_string(),
        deployed_as: format!(
            "{}{}",
            stack.options.name_prefix.as_deref().unwrap_or_default(),
            name
        ),
    }
}
