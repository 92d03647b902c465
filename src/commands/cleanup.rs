//! Free the containers and volumes of stopped sandboxes.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use super::FleetContext;
use crate::fleet::{self, CleanupReport};

pub(crate) async fn run(ctx: &FleetContext, purge: bool) -> Result<()> {
    let controller = ctx.controller()?;
    let report = fleet::cleanup(&controller, purge).await?;
    print!("{}", format_report(&report, purge));
    Ok(())
}

fn format_report(report: &CleanupReport, purge: bool) -> String {
    let mut out = String::new();

    if report.torn_down.is_empty() && report.pruned.total() == 0 && report.warnings.is_empty() {
        writeln!(&mut out, "\n{} Nothing to clean up.", "ℹ".blue()).unwrap();
        return out;
    }

    if !report.torn_down.is_empty() {
        writeln!(&mut out, "\n{} Cleaned stopped sandboxes:", "✓".green()).unwrap();
        for id in &report.torn_down {
            let note = if report.purged.contains(id) {
                "registry entry deleted"
            } else {
                "kept in registry"
            };
            writeln!(&mut out, "  {} {} ({})", "✗".red(), id, note.dimmed()).unwrap();
        }
        if !purge {
            writeln!(
                &mut out,
                "  Use {} to also delete their registry entries and ports",
                "cleanup --purge".green()
            )
            .unwrap();
        }
    }

    let pruned = &report.pruned;
    if pruned.total() > 0 {
        writeln!(&mut out, "\n{} Removed orphaned resources:", "✓".green()).unwrap();
        for name in pruned
            .containers
            .iter()
            .chain(&pruned.volumes)
            .chain(&pruned.networks)
        {
            writeln!(&mut out, "  {} {}", "✗".red(), name.dimmed()).unwrap();
        }
    }

    if !report.warnings.is_empty() {
        writeln!(&mut out, "\n{} Warnings:", "⚠".yellow()).unwrap();
        for warning in &report.warnings {
            writeln!(&mut out, "  {warning}").unwrap();
        }
    }

    out
}
