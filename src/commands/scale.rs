//! Create a numbered batch of sandboxes.

use anyhow::{bail, Result};
use colored::Colorize;
use std::fmt::Write;

use super::FleetContext;
use crate::fleet::{self, ScaleReport, ScaleRequest};
use crate::registry::{IsolationLevel, SandboxType};

pub(crate) async fn run(
    ctx: &FleetContext,
    count: usize,
    prefix: &str,
    sandbox_type: Option<&str>,
    isolation: Option<&str>,
) -> Result<()> {
    let request = ScaleRequest {
        count,
        prefix: prefix.to_string(),
        sandbox_type: sandbox_type.map_or(Ok(SandboxType::Nodejs), str::parse)?,
        isolation_level: isolation.map_or(Ok(IsolationLevel::default()), str::parse)?,
    };
    let controller = ctx.controller()?;

    println!(
        "{} Creating {} {} sandboxes with prefix {}...",
        "ℹ".blue(),
        count.to_string().cyan(),
        request.sandbox_type,
        prefix.cyan()
    );

    let report = fleet::scale(&controller, &request, ctx.config.fleet.scale_delay()).await?;
    print!("{}", format_report(&report, count));

    if let Some(failure) = report.failure {
        bail!("Scale stopped at {}: {}", failure.id, failure.error);
    }
    Ok(())
}

fn format_report(report: &ScaleReport, requested: usize) -> String {
    let mut out = String::new();

    for sandbox in &report.created {
        writeln!(
            &mut out,
            "  {} {:<16} ports {}-{}",
            "✓".green(),
            sandbox.id,
            sandbox.base_port,
            sandbox.base_port + 6
        )
        .unwrap();
    }
    if let Some(failure) = &report.failure {
        writeln!(
            &mut out,
            "  {} {:<16} {}",
            "✗".red(),
            failure.id,
            failure.error.to_string().red()
        )
        .unwrap();
    }

    let summary = format!("{} of {} sandboxes created", report.created.len(), requested);
    if report.failure.is_some() {
        writeln!(&mut out, "\n{} {}", "⚠".yellow(), summary).unwrap();
        writeln!(
            &mut out,
            "  Sandboxes already created were kept; see {}",
            "sandbox-fleet list".green()
        )
        .unwrap();
    } else {
        writeln!(&mut out, "\n{} {}", "✓".green().bold(), summary).unwrap();
    }

    out
}
