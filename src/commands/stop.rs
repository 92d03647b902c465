//! Stop a running sandbox, keeping its containers and volumes.

use anyhow::Result;
use colored::Colorize;

use super::FleetContext;

pub(crate) async fn run(ctx: &FleetContext, id: &str) -> Result<()> {
    let controller = ctx.controller()?;
    let before = controller.registry()?.get(id).map(|s| s.status);
    let sandbox = controller.stop(id).await?;

    if before == Some(sandbox.status) {
        println!("{} Sandbox {} is already stopped", "ℹ".blue(), id.cyan());
    } else {
        println!("{} Stopped sandbox {}", "✓".green(), id.cyan());
        println!(
            "  Run {} to free its containers and volumes",
            "sandbox-fleet cleanup".green()
        );
    }
    Ok(())
}
