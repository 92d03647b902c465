//! Start a stopped sandbox.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use super::FleetContext;
use crate::registry::Sandbox;

pub(crate) async fn run(ctx: &FleetContext, id: &str) -> Result<()> {
    let controller = ctx.controller()?;
    let before = controller.registry()?.get(id).map(|s| s.status);
    let sandbox = controller.start(id).await?;
    print!("{}", format_started(&sandbox, before == Some(sandbox.status)));
    Ok(())
}

fn format_started(sandbox: &Sandbox, unchanged: bool) -> String {
    let mut out = String::new();
    if unchanged {
        writeln!(
            &mut out,
            "{} Sandbox {} is already running",
            "ℹ".blue(),
            sandbox.id.cyan()
        )
        .unwrap();
    } else {
        writeln!(
            &mut out,
            "{} Started sandbox {} (app on localhost:{})",
            "✓".green(),
            sandbox.id.cyan(),
            sandbox.base_port
        )
        .unwrap();
    }
    out
}
