//! Initialize a fleet home directory.
//!
//! Writes the default `fleet.toml`, creates the working directories and an
//! empty registry, then makes a best-effort attempt at the shared network.
//! The file-writing core takes closures for IO so it can be tested without
//! touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{Config, FleetPaths};
use crate::registry::RegistryStore;
use crate::runtime::{ContainerRuntime, DockerRuntime, RuntimeError};

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

/// Runs the init command against `home`.
pub(crate) async fn run(home: &Path, force: bool) -> Result<()> {
    info!("Initializing sandbox fleet in {}", home.display());

    fs::create_dir_all(home)
        .with_context(|| format!("Failed to create directory: {}", home.display()))?;

    let config_file = home.join("fleet.toml");
    let content = Config::render_default()?;
    let config_result = write_config(
        &config_file,
        &content,
        force,
        Path::exists,
        |path, content| {
            fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    let config = Config::load(home)?;
    let paths = FleetPaths::new(home, &config)?;
    for dir in [&paths.env_dir, &paths.logs_dir, &paths.projects_dir] {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let store = RegistryStore::new(
        &paths,
        config.fleet.max_sandboxes,
        config.startup.lock_timeout(),
    );
    let registry_created = store.initialize()?;

    let network = ensure_network(&config).await;
    if let Err(e) = &network {
        warn!("Could not set up network {}: {}", config.fleet.network, e);
    }

    let report = InitReport {
        home: home.to_path_buf(),
        config: config_result,
        registry_created,
        network_name: config.fleet.network.clone(),
        network,
    };
    print!("{}", format_results(&report));

    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

/// Result of attempting to write a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    /// File was created.
    Created,
    /// File was overwritten.
    Overwritten,
    /// File was skipped (already exists).
    Skipped,
}

#[derive(Debug)]
struct InitReport {
    home: PathBuf,
    config: WriteResult,
    registry_created: bool,
    network_name: String,
    network: Result<(), RuntimeError>,
}

// -----------------------------------------------------------------------------
// Helper functions
// -----------------------------------------------------------------------------

/// Write `content` to `path` unless it exists and `force` is off.
fn write_config<E, W>(
    path: &Path,
    content: &str,
    force: bool,
    exists: E,
    mut write_file: W,
) -> Result<WriteResult>
where
    E: Fn(&Path) -> bool,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let existed = exists(path);
    if existed && !force {
        return Ok(WriteResult::Skipped);
    }

    write_file(path, content)?;
    Ok(if existed {
        WriteResult::Overwritten
    } else {
        WriteResult::Created
    })
}

async fn ensure_network(config: &Config) -> Result<(), RuntimeError> {
    let runtime = DockerRuntime::connect(config.isolation.clone())?;
    runtime.ensure_network(&config.fleet.network).await
}

/// Formats init results for display with colored output.
fn format_results(report: &InitReport) -> String {
    let mut out = String::new();

    writeln!(
        &mut out,
        "\n{} Sandbox fleet initialized in {}\n",
        "✓".green().bold(),
        report.home.display().to_string().cyan()
    )
    .unwrap();

    match report.config {
        WriteResult::Created => {
            writeln!(&mut out, "  {} - fleet configuration", "fleet.toml".cyan()).unwrap();
        }
        WriteResult::Overwritten => {
            writeln!(&mut out, "  {} fleet.toml (overwritten)", "↻".blue()).unwrap();
        }
        WriteResult::Skipped => {
            writeln!(
                &mut out,
                "  {} fleet.toml (already exists, use --force to overwrite)",
                "⊘".yellow()
            )
            .unwrap();
        }
    }

    if report.registry_created {
        writeln!(&mut out, "  {} - empty sandbox registry", "registry.json".cyan()).unwrap();
    } else {
        writeln!(&mut out, "  {} registry.json (kept existing)", "ℹ".blue()).unwrap();
    }

    match &report.network {
        Ok(()) => {
            writeln!(
                &mut out,
                "  {} network {} ready",
                "✓".green(),
                report.network_name.cyan()
            )
            .unwrap();
        }
        Err(e) if e.is_docker_unavailable() => {
            writeln!(
                &mut out,
                "  {} Docker is not reachable; network {} will be created on first use",
                "⊘".yellow(),
                report.network_name
            )
            .unwrap();
        }
        Err(e) => {
            writeln!(&mut out, "  {} network setup failed: {}", "✗".red(), e).unwrap();
        }
    }

    writeln!(&mut out, "\n{}", "Next steps:".yellow().bold()).unwrap();
    writeln!(
        &mut out,
        "  1. Review {} for images, ports and limits",
        "fleet.toml".cyan()
    )
    .unwrap();
    writeln!(
        &mut out,
        "  2. Run {} to create your first sandbox",
        "sandbox-fleet create <id>".green()
    )
    .unwrap();

    out
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
