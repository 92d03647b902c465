use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::SandboxType;

const CONFIG_FILE: &str = "fleet.toml";
const REGISTRY_FILE: &str = "registry.json";
const LOCK_FILE: &str = "registry.lock";
const DEFAULT_HOME: &str = ".sandbox-fleet";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub images: ImageConfig,
    #[serde(default)]
    pub isolation: IsolationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Fleet-wide limits and shared resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Hard ceiling on registered sandboxes
    #[serde(default = "default_max_sandboxes")]
    pub max_sandboxes: usize,

    /// Bridge network shared by every sandbox
    #[serde(default = "default_network")]
    pub network: String,

    /// Directory holding one source tree per sandbox
    /// - Relative paths resolve against the fleet home
    /// - "~/" expands to the user's home directory
    #[serde(default = "default_projects_dir")]
    pub projects_dir: String,

    /// Pause between sandbox creations during `scale`
    #[serde(default = "default_scale_delay_ms")]
    pub scale_delay_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_sandboxes: default_max_sandboxes(),
            network: default_network(),
            projects_dir: default_projects_dir(),
            scale_delay_ms: default_scale_delay_ms(),
        }
    }
}

impl FleetConfig {
    pub fn scale_delay(&self) -> Duration {
        Duration::from_millis(self.scale_delay_ms)
    }
}

/// Host port range handed out to sandboxes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// First port considered for a sandbox block
    #[serde(default = "default_base_port")]
    pub base: u16,

    /// Distance between consecutive block starts
    #[serde(default = "default_port_step")]
    pub step: u16,

    /// Highest port a block may use
    #[serde(default = "default_max_port")]
    pub max: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            base: default_base_port(),
            step: default_port_step(),
            max: default_max_port(),
        }
    }
}

/// Readiness polling and registry locking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Give up waiting for containers after this long
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// First delay between status checks
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Backoff ceiling between status checks
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    /// How long a commit waits for the registry lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl StartupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Container images per service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_node_image")]
    pub nodejs: String,
    #[serde(default = "default_python_image")]
    pub python: String,
    #[serde(default = "default_node_image")]
    pub react: String,
    #[serde(default = "default_node_image")]
    pub api: String,
    #[serde(default = "default_database_image")]
    pub database: String,
    #[serde(default = "default_cache_image")]
    pub cache: String,
    #[serde(default = "default_editor_image")]
    pub editor: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            nodejs: default_node_image(),
            python: default_python_image(),
            react: default_node_image(),
            api: default_node_image(),
            database: default_database_image(),
            cache: default_cache_image(),
            editor: default_editor_image(),
        }
    }
}

impl ImageConfig {
    /// Image for the application runtime container of a sandbox type
    pub fn runtime_image(&self, sandbox_type: SandboxType) -> &str {
        match sandbox_type {
            SandboxType::Nodejs => &self.nodejs,
            SandboxType::Python => &self.python,
            SandboxType::React => &self.react,
            SandboxType::Api => &self.api,
        }
    }
}

/// Resource limits applied per isolation level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    #[serde(default = "default_low_resources")]
    pub low: ResourceConfig,
    #[serde(default = "default_medium_resources")]
    pub medium: ResourceConfig,
    #[serde(default = "default_high_resources")]
    pub high: ResourceConfig,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            low: default_low_resources(),
            medium: default_medium_resources(),
            high: default_high_resources(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Memory limit per container (e.g., "2g"); unset means unlimited
    #[serde(default)]
    pub memory: Option<String>,

    /// CPU limit per container (e.g., "2"); unset means unlimited
    #[serde(default)]
    pub cpus: Option<String>,

    /// Maximum processes per container
    #[serde(default)]
    pub pids_limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Console log format
    #[serde(default)]
    pub format: LogFormat,

    /// Also write a daily log file under `<home>/logs`
    #[serde(default = "default_true")]
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            file: true,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_sandboxes() -> usize {
    20
}

fn default_network() -> String {
    "sandbox-fleet".to_string()
}

fn default_projects_dir() -> String {
    "projects".to_string()
}

fn default_scale_delay_ms() -> u64 {
    2000
}

fn default_base_port() -> u16 {
    50100
}

fn default_port_step() -> u16 {
    10
}

fn default_max_port() -> u16 {
    60000
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_poll_interval_ms() -> u64 {
    5000
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_node_image() -> String {
    "node:20-bookworm".to_string()
}

fn default_python_image() -> String {
    "python:3.12-bookworm".to_string()
}

fn default_database_image() -> String {
    "postgres:16-alpine".to_string()
}

fn default_cache_image() -> String {
    "redis:7-alpine".to_string()
}

fn default_editor_image() -> String {
    "codercom/code-server:4.23.1".to_string()
}

fn default_low_resources() -> ResourceConfig {
    ResourceConfig {
        memory: None,
        cpus: None,
        pids_limit: None,
    }
}

fn default_medium_resources() -> ResourceConfig {
    ResourceConfig {
        memory: Some("2g".to_string()),
        cpus: Some("2".to_string()),
        pids_limit: Some(1024),
    }
}

fn default_high_resources() -> ResourceConfig {
    ResourceConfig {
        memory: Some("1g".to_string()),
        cpus: Some("1".to_string()),
        pids_limit: Some(256),
    }
}

impl Config {
    /// Load configuration from the fleet home, using defaults if not found
    pub fn load(home: &Path) -> Result<Self> {
        let config_path = home.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }

    /// Default configuration rendered as TOML
    pub fn render_default() -> Result<String> {
        toml::to_string_pretty(&Self::default()).context("Failed to serialize default config")
    }
}

/// Locations of every file the fleet manager owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetPaths {
    pub registry_file: PathBuf,
    pub lock_file: PathBuf,
    pub env_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub projects_dir: PathBuf,
}

impl FleetPaths {
    /// Resolve all paths under `home`, honoring the configured projects dir
    pub fn new(home: &Path, config: &Config) -> Result<Self> {
        let projects = PathBuf::from(expand_path(&config.fleet.projects_dir)?);
        let projects_dir = if projects.is_absolute() {
            projects
        } else {
            home.join(projects)
        };

        Ok(Self {
            registry_file: home.join(REGISTRY_FILE),
            lock_file: home.join(LOCK_FILE),
            env_dir: home.join("env"),
            logs_dir: home.join("logs"),
            projects_dir,
        })
    }

    /// Descriptor file written for one sandbox
    pub fn env_file(&self, id: &str) -> PathBuf {
        self.env_dir.join(format!("{id}.env"))
    }

    /// Source tree dedicated to one sandbox
    pub fn project_path(&self, id: &str) -> PathBuf {
        self.projects_dir.join(id)
    }
}

/// Pick the fleet home: explicit flag/env value, else `./.sandbox-fleet`
pub fn resolve_home(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(PathBuf::from(expand_path(&path.to_string_lossy())?)),
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            Ok(cwd.join(DEFAULT_HOME))
        }
    }
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest).to_string_lossy().into_owned())
    } else {
        Ok(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.fleet.max_sandboxes, 20);
        assert_eq!(config.ports.base, 50100);
        assert_eq!(config.ports.step, 10);
        assert_eq!(config.startup.timeout(), Duration::from_secs(120));
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.isolation.low.memory.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[fleet]
max_sandboxes = 5
network = "dev-net"

[ports]
base = 40000

[startup]
timeout_secs = 30

[images]
python = "python:3.11-slim"

[isolation.high]
memory = "512m"
cpus = "0.5"

[logging]
format = "json"
file = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.fleet.max_sandboxes, 5);
        assert_eq!(config.fleet.network, "dev-net");
        assert_eq!(config.ports.base, 40000);
        assert_eq!(config.ports.step, 10);
        assert_eq!(config.startup.timeout_secs, 30);
        assert_eq!(config.images.runtime_image(SandboxType::Python), "python:3.11-slim");
        assert_eq!(config.images.runtime_image(SandboxType::React), "node:20-bookworm");
        assert_eq!(config.isolation.high.memory.as_deref(), Some("512m"));
        assert_eq!(config.isolation.medium.cpus.as_deref(), Some("2"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(!config.logging.file);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.fleet.network, "sandbox-fleet");
    }

    #[test]
    fn test_stale_credential_seed_key_is_ignored() {
        let toml = r#"
[fleet]
max_sandboxes = 3
credential_seed = "from-an-older-fleet-toml"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.fleet.max_sandboxes, 3);
    }

    #[test]
    fn test_render_default_roundtrips() {
        let rendered = Config::render_default().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.fleet.max_sandboxes, FleetConfig::default().max_sandboxes);
        assert_eq!(parsed.ports, PortConfig::default());
    }

    #[test]
    fn test_paths_resolve_relative_projects_dir() {
        let config = Config::default();
        let paths = FleetPaths::new(Path::new("/srv/fleet"), &config).unwrap();
        assert_eq!(paths.registry_file, PathBuf::from("/srv/fleet/registry.json"));
        assert_eq!(paths.env_file("web-app"), PathBuf::from("/srv/fleet/env/web-app.env"));
        assert_eq!(
            paths.project_path("web-app"),
            PathBuf::from("/srv/fleet/projects/web-app")
        );
    }

    #[test]
    fn test_paths_keep_absolute_projects_dir() {
        let mut config = Config::default();
        config.fleet.projects_dir = "/data/src".to_string();
        let paths = FleetPaths::new(Path::new("/srv/fleet"), &config).unwrap();
        assert_eq!(paths.project_path("a"), PathBuf::from("/data/src/a"));
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/usr/bin").unwrap(), "/usr/bin");

        if dirs::home_dir().is_some() {
            let expanded = expand_path("~/fleet").unwrap();
            assert!(!expanded.starts_with('~'));
            assert!(expanded.ends_with("/fleet"));
        }
    }
}
