//! sandbox-fleet: manage a fleet of containerized development sandboxes.
//!
//! Each sandbox gets a block of host ports, its own database, cache and
//! editor containers, and a record in a lock-guarded registry under the
//! fleet home directory.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod environment;
mod error;
mod fleet;
mod lifecycle;
mod ports;
mod registry;
mod runtime;

use commands::FleetContext;
use config::{Config, LogFormat};
use error::FleetError;

#[derive(Parser)]
#[command(name = "sandbox-fleet")]
#[command(
    author,
    version,
    about = "Create and manage isolated multi-service development sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Fleet home directory (default: ./.sandbox-fleet)
    #[arg(long, global = true, env = "SANDBOX_FLEET_HOME")]
    home: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format (overrides fleet.toml)
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the fleet home: config, registry and network
    Init {
        /// Overwrite an existing fleet.toml
        #[arg(short, long)]
        force: bool,
    },

    /// Create a sandbox and wait for it to come up
    Create {
        /// Sandbox id (letters, digits, '-' and '_')
        id: String,

        /// Project name (defaults to the id)
        project: Option<String>,

        /// Sandbox type: nodejs, python, react or api
        #[arg(value_name = "TYPE")]
        sandbox_type: Option<String>,

        /// Isolation level: low, medium or high
        isolation: Option<String>,
    },

    /// List registered sandboxes
    List,

    /// Start a stopped sandbox
    Start {
        /// Sandbox id
        id: String,
    },

    /// Stop a running sandbox
    Stop {
        /// Sandbox id
        id: String,
    },

    /// Remove a sandbox, its containers and volumes
    Remove {
        /// Sandbox id
        id: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Show a sandbox's ports, containers and resource usage
    Info {
        /// Sandbox id
        id: String,
    },

    /// Create several numbered sandboxes one after another
    Scale {
        /// Number of sandboxes to create
        count: usize,

        /// Id prefix; sandboxes are named <prefix>-001, <prefix>-002, ...
        #[arg(default_value = "sandbox")]
        prefix: String,

        /// Sandbox type: nodejs, python, react or api
        #[arg(value_name = "TYPE")]
        sandbox_type: Option<String>,

        /// Isolation level for every new sandbox
        #[arg(long)]
        isolation: Option<String>,
    },

    /// Tear down containers and volumes of stopped sandboxes
    Cleanup {
        /// Also delete the cleaned sandboxes from the registry
        #[arg(long)]
        purge: bool,
    },

    /// Stream container logs of a sandbox
    Logs {
        /// Sandbox id
        id: String,

        /// Service: app, db, cache or editor (default: all)
        service: Option<String>,

        /// Keep streaming new output
        #[arg(short, long)]
        follow: bool,

        /// Number of lines to show from the end of each log
        #[arg(long)]
        tail: Option<u64>,
    },
}

/// Set up stderr logging plus a daily log file under the fleet home.
///
/// The returned guard flushes the file writer when dropped.
fn init_tracing(verbose: bool, format: LogFormat, logs_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("sandbox_fleet=debug")
        } else {
            EnvFilter::new("sandbox_fleet=info")
        }
    });

    let (text_layer, json_layer) = match format {
        LogFormat::Text => (Some(fmt::layer().with_writer(std::io::stderr)), None),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_writer(std::io::stderr)),
        ),
    };

    let (file_layer, guard) = logs_dir
        .and_then(|dir| {
            fs::create_dir_all(dir).ok()?;
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("fleet.log")
                .build(dir)
                .ok()
        })
        .map(|appender| {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        })
        .unwrap_or((None, None));

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let home = config::resolve_home(cli.home)?;
    let config = Config::load(&home)?;
    let ctx = FleetContext::new(&home, config)?;

    let format = cli.log_format.unwrap_or(ctx.config.logging.format);
    let logs_dir = (ctx.config.logging.file && home.exists()).then_some(ctx.paths.logs_dir.as_path());
    let _guard = init_tracing(cli.verbose, format, logs_dir);

    let result = run(cli.command, &home, &ctx).await;
    if let Err(e) = &result {
        if let Some(hint) = e.downcast_ref::<FleetError>().and_then(commands::format_hint) {
            eprintln!("{hint}");
        }
    }
    result
}

async fn run(command: Commands, home: &Path, ctx: &FleetContext) -> Result<()> {
    match command {
        Commands::Init { force } => {
            commands::init::run(home, force).await?;
        }
        Commands::Create {
            id,
            project,
            sandbox_type,
            isolation,
        } => {
            commands::create::run(
                ctx,
                &id,
                project.as_deref(),
                sandbox_type.as_deref(),
                isolation.as_deref(),
            )
            .await?;
        }
        Commands::List => {
            commands::list::run(ctx)?;
        }
        Commands::Start { id } => {
            commands::start::run(ctx, &id).await?;
        }
        Commands::Stop { id } => {
            commands::stop::run(ctx, &id).await?;
        }
        Commands::Remove { id, force } => {
            commands::remove::run(ctx, &id, force).await?;
        }
        Commands::Info { id } => {
            commands::info::run(ctx, &id).await?;
        }
        Commands::Scale {
            count,
            prefix,
            sandbox_type,
            isolation,
        } => {
            commands::scale::run(
                ctx,
                count,
                &prefix,
                sandbox_type.as_deref(),
                isolation.as_deref(),
            )
            .await?;
        }
        Commands::Cleanup { purge } => {
            commands::cleanup::run(ctx, purge).await?;
        }
        Commands::Logs {
            id,
            service,
            follow,
            tail,
        } => {
            commands::logs::run(ctx, &id, service.as_deref(), follow, tail).await?;
        }
    }

    Ok(())
}
