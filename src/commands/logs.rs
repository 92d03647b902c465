//! Stream container logs of a sandbox.

use anyhow::Result;
use colored::Colorize;
use futures_util::StreamExt;

use super::FleetContext;
use crate::environment::ServiceKind;
use crate::runtime::{LogLine, LogOptions};

pub(crate) async fn run(
    ctx: &FleetContext,
    id: &str,
    service: Option<&str>,
    follow: bool,
    tail: Option<u64>,
) -> Result<()> {
    let service: Option<ServiceKind> = service.map(str::parse).transpose()?;
    let controller = ctx.controller()?;

    let mut stream = controller
        .logs(id, service, LogOptions { follow, tail })
        .await?;

    while let Some(line) = stream.next().await {
        let line = line?;
        let text = format_line(&line, service.is_none());
        if line.stderr {
            eprint!("{text}");
        } else {
            print!("{text}");
        }
    }
    Ok(())
}

/// Prefix with the service name when several services are interleaved.
fn format_line(line: &LogLine, prefixed: bool) -> String {
    let mut text = if prefixed {
        format!("{} {}", format!("{:<6}|", line.service).dimmed(), line.message)
    } else {
        line.message.clone()
    };
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}
