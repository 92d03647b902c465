//! Remove a sandbox and release its ports.
//!
//! Without `--force` the operator must type the sandbox id to confirm.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::io::{self, BufRead, Write};

use super::FleetContext;
use crate::error::FleetError;

pub(crate) async fn run(ctx: &FleetContext, id: &str, force: bool) -> Result<()> {
    let controller = ctx.controller()?;
    let sandbox = controller
        .registry()?
        .get(id)
        .cloned()
        .ok_or_else(|| FleetError::not_found(id))?;

    if !force {
        print!(
            "{} This deletes the containers and volumes of {} (ports {}-{}).\n  Type the sandbox id to confirm: ",
            "⚠".yellow(),
            id.cyan().bold(),
            sandbox.base_port,
            sandbox.base_port + 6
        );
        io::stdout().flush().context("Failed to flush stdout")?;

        let answer = read_answer(io::stdin().lock())?;
        if !confirmed(&answer, id) {
            println!("{} Removal cancelled.", "ℹ".blue());
            bail!("Removal of {id} was not confirmed");
        }
    }

    let removed = controller.remove(id).await?;
    println!(
        "{} Removed sandbox {} and released ports {}-{}",
        "✓".green(),
        removed.id.cyan(),
        removed.base_port,
        removed.base_port + 6
    );
    println!(
        "  Project files kept at {}",
        removed.project_path.display().to_string().dimmed()
    );
    Ok(())
}

fn read_answer(mut input: impl BufRead) -> Result<String> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("Failed to read confirmation")?;
    Ok(line)
}

/// The operator typed exactly the sandbox id.
fn confirmed(answer: &str, id: &str) -> bool {
    answer.trim() == id
}
