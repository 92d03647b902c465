//! Show one sandbox: registry record, ports, containers and resource usage.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;

use super::list::status_label;
use super::{format_ports, FleetContext};
use crate::lifecycle::SandboxInfo;

pub(crate) async fn run(ctx: &FleetContext, id: &str) -> Result<()> {
    let controller = ctx.controller()?;
    let info = controller.info(id).await?;
    print!("{}", format_info(&info));
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn mebibytes(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

pub(crate) fn format_info(info: &SandboxInfo) -> String {
    let sandbox = &info.sandbox;
    let creds = &info.descriptor.credentials;
    let mut out = String::new();

    writeln!(&mut out, "\n{}", "━".repeat(50).dimmed()).unwrap();
    writeln!(&mut out, "{}", format!("   Sandbox {}", sandbox.id).yellow().bold()).unwrap();
    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();

    writeln!(&mut out, "  Status:     {}", status_label(sandbox.status)).unwrap();
    writeln!(&mut out, "  Project:    {}", sandbox.project_name.cyan()).unwrap();
    writeln!(
        &mut out,
        "  Type:       {}",
        sandbox.sandbox_type.to_string().cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Isolation:  {}",
        sandbox.isolation_level.to_string().cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Path:       {}",
        sandbox.project_path.display().to_string().cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Created:    {}",
        sandbox
            .created_at
            .format("%Y-%m-%d %H:%M:%S UTC")
            .to_string()
            .cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Database:   {} (user {})",
        creds.database_name.cyan(),
        creds.database_user.cyan()
    )
    .unwrap();

    writeln!(&mut out, "\nPorts:").unwrap();
    out.push_str(&format_ports(&info.descriptor.ports));

    writeln!(&mut out, "\nContainers:").unwrap();
    match (&info.runtime, &info.runtime_error) {
        (Some(runtime), _) if runtime.containers.is_empty() => {
            writeln!(&mut out, "  {} none", "ℹ".blue()).unwrap();
        }
        (Some(runtime), _) => {
            for container in &runtime.containers {
                let marker = if container.is_ready() {
                    "✓".green()
                } else {
                    "✗".red()
                };
                let usage = info
                    .usage
                    .iter()
                    .find(|u| u.container == container.name)
                    .map(|u| {
                        format!(
                            "  cpu {:.1}%  mem {:.0}/{:.0} MiB",
                            u.cpu_percent,
                            mebibytes(u.memory_bytes),
                            mebibytes(u.memory_limit_bytes)
                        )
                    })
                    .unwrap_or_default();
                writeln!(
                    &mut out,
                    "  {} {:<24} {}{}",
                    marker,
                    container.name,
                    container.status.dimmed(),
                    usage
                )
                .unwrap();
            }
            let health = if runtime.healthy {
                "healthy".green()
            } else {
                "degraded".yellow()
            };
            writeln!(&mut out, "  Health:     {health}").unwrap();
        }
        (None, error) => {
            writeln!(
                &mut out,
                "  {} runtime unavailable: {}",
                "⊘".yellow(),
                error.as_deref().unwrap_or("unknown error")
            )
            .unwrap();
        }
    }
    writeln!(&mut out, "{}", "━".repeat(50).dimmed()).unwrap();

    out
}
