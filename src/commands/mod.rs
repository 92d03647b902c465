//! CLI command implementations.
//!
//! Each submodule implements one sandbox-fleet command with pure
//! formatting separated from IO for testability.

pub mod cleanup;
pub mod create;
pub mod info;
pub mod init;
pub mod list;
pub mod logs;
pub mod remove;
pub mod scale;
pub mod start;
pub mod stop;

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, FleetPaths};
use crate::environment::ServicePorts;
use crate::error::FleetError;
use crate::lifecycle::LifecycleController;
use crate::ports::TcpProbe;
use crate::runtime::DockerRuntime;

/// Configuration and paths for one invocation.
pub(crate) struct FleetContext {
    pub config: Config,
    pub paths: FleetPaths,
}

impl FleetContext {
    pub fn new(home: &Path, config: Config) -> Result<Self> {
        let paths = FleetPaths::new(home, &config)?;
        Ok(Self { config, paths })
    }

    /// Controller backed by the local Docker daemon and real port probing.
    pub fn controller(&self) -> Result<LifecycleController> {
        let runtime = DockerRuntime::connect(self.config.isolation.clone())
            .context("Failed to connect to Docker")?;
        Ok(LifecycleController::new(
            &self.config,
            self.paths.clone(),
            Arc::new(runtime),
            Arc::new(TcpProbe),
        ))
    }
}

/// Port lines shared by `create` and `info`.
pub(crate) fn format_ports(ports: &ServicePorts) -> String {
    let mut out = String::new();
    for (label, port) in ports.labelled() {
        writeln!(
            &mut out,
            "  {:<10} {}",
            format!("{label}:"),
            format!("localhost:{port}").cyan()
        )
        .unwrap();
    }
    out
}

/// What the operator can do about a failed command, if anything obvious.
pub(crate) fn format_hint(error: &FleetError) -> Option<String> {
    let hint = if error.is_not_found() {
        format!("Run {} to see registered sandboxes", "sandbox-fleet list".green())
    } else if error.is_duplicate() {
        format!(
            "Pick another id or inspect the existing one with {}",
            "sandbox-fleet info <id>".green()
        )
    } else if error.is_capacity_exceeded() {
        format!(
            "Remove unused sandboxes or raise {} in fleet.toml",
            "max_sandboxes".cyan()
        )
    } else if error.is_validation() {
        format!("Run {} for accepted values", "sandbox-fleet help <command>".green())
    } else if let FleetError::InvalidTransition { id, .. } = error {
        format!(
            "Check the status with {}",
            format!("sandbox-fleet info {id}").green()
        )
    } else if let FleetError::RegistryConflict { .. } = error {
        "Another sandbox-fleet command is running; retry when it finishes".to_string()
    } else {
        return None;
    };
    Some(format!("{} {hint}", "ℹ".blue()))
}
