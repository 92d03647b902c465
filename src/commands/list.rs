//! Show every registered sandbox.

use anyhow::Result;
use colored::{ColoredString, Colorize};
use std::fmt::Write;

use super::FleetContext;
use crate::fleet::{self, SandboxSummary};
use crate::registry::SandboxStatus;

pub(crate) fn run(ctx: &FleetContext) -> Result<()> {
    let controller = ctx.controller()?;
    let rows = fleet::list(&controller)?;
    print!("{}", format_list(&rows, ctx.config.fleet.max_sandboxes));
    Ok(())
}

pub(crate) fn status_label(status: SandboxStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        SandboxStatus::Running => text.green(),
        SandboxStatus::Stopped => text.yellow(),
        SandboxStatus::Creating => text.blue(),
        SandboxStatus::Failed | SandboxStatus::Removed => text.red(),
    }
}

pub(crate) fn format_list(rows: &[SandboxSummary], max: usize) -> String {
    let mut out = String::new();

    if rows.is_empty() {
        writeln!(&mut out, "\n{} No sandboxes registered.", "ℹ".blue()).unwrap();
        writeln!(
            &mut out,
            "  Run {} to create one.",
            "sandbox-fleet create <id>".green()
        )
        .unwrap();
        return out;
    }

    let id_width = rows.iter().map(|r| r.id.len()).max().unwrap_or(0).max(2);

    writeln!(
        &mut out,
        "\n{:<id_width$}  {:<8}  {:<11}  {:<9}  {}",
        "ID".bold(),
        "TYPE".bold(),
        "PORTS".bold(),
        "STATUS".bold(),
        "CREATED".bold()
    )
    .unwrap();
    for row in rows {
        writeln!(
            &mut out,
            "{:<id_width$}  {:<8}  {:<11}  {:<9}  {}",
            row.id,
            row.sandbox_type.to_string(),
            format!("{}-{}", row.base_port, row.base_port + 6),
            status_label(row.status),
            row.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
        )
        .unwrap();
    }
    writeln!(
        &mut out,
        "\n{} of {} sandboxes",
        rows.len().to_string().cyan(),
        max
    )
    .unwrap();

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SandboxType;
    use chrono::Utc;

    fn row(id: &str, base_port: u16, status: SandboxStatus) -> SandboxSummary {
        SandboxSummary {
            id: id.to_string(),
            project_name: id.to_string(),
            sandbox_type: SandboxType::Nodejs,
            base_port,
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_format_list_empty() {
        let output = format_list(&[], 20);
        assert!(output.contains("No sandboxes registered"));
    }

    #[test]
    fn test_format_list_rows() {
        let rows = vec![
            row("test-001", 50100, SandboxStatus::Running),
            row("web-app", 50110, SandboxStatus::Stopped),
        ];
        let output = format_list(&rows, 20);

        assert!(output.contains("test-001"));
        assert!(output.contains("50100-50106"));
        assert!(output.contains("web-app"));
        assert!(output.contains("stopped"));
        assert!(output.contains("of 20 sandboxes"));
    }
}
