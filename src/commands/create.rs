//! Create one sandbox.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;

use super::{format_ports, FleetContext};
use crate::environment::ServicePorts;
use crate::error::FleetError;
use crate::lifecycle::CreateRequest;
use crate::registry::Sandbox;

pub(crate) async fn run(
    ctx: &FleetContext,
    id: &str,
    project: Option<&str>,
    sandbox_type: Option<&str>,
    isolation: Option<&str>,
) -> Result<()> {
    let request = CreateRequest::parse(id, project, sandbox_type, isolation)?;
    let controller = ctx.controller()?;

    println!(
        "{} Creating sandbox {}...",
        "ℹ".blue(),
        request.id.cyan().bold()
    );

    match controller.create(&request).await {
        Ok(sandbox) => {
            print!(
                "{}",
                format_created(&sandbox, &ctx.paths.env_file(&sandbox.id))
            );
            Ok(())
        }
        Err(e) => {
            print!("{}", format_failure(id, &e));
            Err(e.into())
        }
    }
}

/// Success summary with ports and the env file location.
pub(crate) fn format_created(sandbox: &Sandbox, env_file: &Path) -> String {
    let mut out = String::new();

    writeln!(
        &mut out,
        "\n{} Sandbox {} is running",
        "✓".green().bold(),
        sandbox.id.cyan().bold()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Type:       {} ({} isolation)",
        sandbox.sandbox_type.to_string().cyan(),
        sandbox.isolation_level
    )
    .unwrap();
    writeln!(
        &mut out,
        "  Project:    {}",
        sandbox.project_path.display().to_string().cyan()
    )
    .unwrap();
    writeln!(&mut out, "\nPorts:").unwrap();
    out.push_str(&format_ports(&ServicePorts::from_base(sandbox.base_port)));
    writeln!(
        &mut out,
        "\nCredentials and connection URLs: {}",
        env_file.display().to_string().dimmed()
    )
    .unwrap();

    out
}

/// Follow-up for a create that left a `failed` record behind.
pub(crate) fn format_failure(id: &str, error: &FleetError) -> String {
    let mut out = String::new();
    if error.is_start_timeout() || matches!(error, FleetError::Adapter(_)) {
        writeln!(
            &mut out,
            "\n{} Sandbox {} was left in status {} for inspection.",
            "✗".red(),
            id.cyan(),
            "failed".red()
        )
        .unwrap();
        writeln!(
            &mut out,
            "  Inspect with {}, then remove with {}",
            format!("sandbox-fleet logs {id}").green(),
            format!("sandbox-fleet remove {id}").green()
        )
        .unwrap();
    }
    out
}
