//! Turns a sandbox record into the concrete service layout handed to the
//! container runtime.
//!
//! Materialization is a pure function of the sandbox record, the fleet
//! settings and the registry's credential seed: the same sandbox always
//! yields the same ports, names and credentials, so `start` after `stop` or
//! `cleanup` rebuilds an identical environment.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::config::{Config, ImageConfig};
use crate::error::FleetError;
use crate::registry::{IsolationLevel, Sandbox, SandboxType};

/// Mount point of the sandbox source tree inside app and editor containers.
pub(crate) const WORKSPACE_DIR: &str = "/workspace";

const DATABASE_PORT: u16 = 5432;
const CACHE_PORT: u16 = 6379;
const EDITOR_PORT: u16 = 8080;
const NOTEBOOK_PORT: u16 = 8888;

/// One container per service kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ServiceKind {
    App,
    Database,
    Cache,
    Editor,
}

impl ServiceKind {
    pub const ALL: [Self; 4] = [Self::App, Self::Database, Self::Cache, Self::Editor];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Database => "db",
            Self::Cache => "cache",
            Self::Editor => "editor",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "app" | "runtime" => Ok(Self::App),
            "db" | "database" | "postgres" => Ok(Self::Database),
            "cache" | "redis" => Ok(Self::Cache),
            "editor" | "code-server" => Ok(Self::Editor),
            _ => Err(FleetError::validation(format!(
                "Unknown service: '{s}'. Supported: app, db, cache, editor"
            ))),
        }
    }
}

/// Container name for one service of a sandbox.
pub(crate) fn container_name(sandbox_id: &str, kind: ServiceKind) -> String {
    format!("sbx-{sandbox_id}-{kind}")
}

/// Host ports of a sandbox, at fixed offsets from its base port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct ServicePorts {
    pub app: u16,
    pub debug: u16,
    pub secondary: u16,
    pub notebook: u16,
    pub database: u16,
    pub cache: u16,
    pub editor: u16,
}

impl ServicePorts {
    pub fn from_base(base: u16) -> Self {
        Self {
            app: base,
            debug: base + 1,
            secondary: base + 2,
            notebook: base + 3,
            database: base + 4,
            cache: base + 5,
            editor: base + 6,
        }
    }

    /// Labelled ports in offset order.
    pub fn labelled(&self) -> [(&'static str, u16); 7] {
        [
            ("app", self.app),
            ("debug", self.debug),
            ("secondary", self.secondary),
            ("notebook", self.notebook),
            ("database", self.database),
            ("cache", self.cache),
            ("editor", self.editor),
        ]
    }
}

/// Per-sandbox credentials derived from the sandbox id and the registry seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Credentials {
    pub database_name: String,
    pub database_user: String,
    pub database_password: String,
    pub cache_password: String,
    pub editor_password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct PortMapping {
    pub host: u16,
    pub container: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct VolumeMount {
    pub name: String,
    pub target: String,
}

/// Everything needed to run one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ServiceSpec {
    pub kind: ServiceKind,
    pub container_name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub volume: Option<VolumeMount>,
    /// Bind the sandbox source tree at [`WORKSPACE_DIR`].
    pub mount_project: bool,
    pub command: Option<Vec<String>>,
}

/// The only input the runtime adapter receives about a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct EnvironmentDescriptor {
    pub sandbox_id: String,
    pub project_name: String,
    pub sandbox_type: SandboxType,
    pub isolation_level: IsolationLevel,
    pub project_path: PathBuf,
    pub network: String,
    pub ports: ServicePorts,
    pub credentials: Credentials,
    pub services: Vec<ServiceSpec>,
}

impl EnvironmentDescriptor {
    #[cfg(test)]
    pub fn service(&self, kind: ServiceKind) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.kind == kind)
    }

    /// Flat variables describing the sandbox, as written to its env file.
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let ports = &self.ports;
        let creds = &self.credentials;
        let mut vars = BTreeMap::new();

        vars.insert("SANDBOX_ID".to_string(), self.sandbox_id.clone());
        vars.insert("PROJECT_NAME".to_string(), self.project_name.clone());
        vars.insert("SANDBOX_TYPE".to_string(), self.sandbox_type.to_string());
        vars.insert("ISOLATION_LEVEL".to_string(), self.isolation_level.to_string());
        vars.insert(
            "PROJECT_PATH".to_string(),
            self.project_path.display().to_string(),
        );
        vars.insert("NETWORK".to_string(), self.network.clone());
        for (label, port) in ports.labelled() {
            vars.insert(format!("{}_PORT", label.to_uppercase()), port.to_string());
        }
        vars.insert("DB_NAME".to_string(), creds.database_name.clone());
        vars.insert("DB_USER".to_string(), creds.database_user.clone());
        vars.insert("DB_PASSWORD".to_string(), creds.database_password.clone());
        vars.insert("REDIS_PASSWORD".to_string(), creds.cache_password.clone());
        vars.insert("EDITOR_PASSWORD".to_string(), creds.editor_password.clone());
        vars.insert(
            "DATABASE_URL".to_string(),
            format!(
                "postgres://{}:{}@localhost:{}/{}",
                creds.database_user, creds.database_password, ports.database, creds.database_name
            ),
        );
        vars.insert(
            "REDIS_URL".to_string(),
            format!("redis://:{}@localhost:{}", creds.cache_password, ports.cache),
        );

        vars
    }

    pub fn render_env_file(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# sandbox-fleet environment for {}", self.sandbox_id);
        for (key, value) in self.env_vars() {
            let _ = writeln!(out, "{key}={value}");
        }
        out
    }
}

/// Derives descriptors from sandbox records.
#[derive(Debug, Clone)]
pub(crate) struct Materializer {
    network: String,
    images: ImageConfig,
}

impl Materializer {
    pub fn new(config: &Config) -> Self {
        Self {
            network: config.fleet.network.clone(),
            images: config.images.clone(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// `credential_seed` is the registry's seed, fixed when the registry
    /// was first written.
    pub fn materialize(&self, sandbox: &Sandbox, credential_seed: &str) -> EnvironmentDescriptor {
        let ports = ServicePorts::from_base(sandbox.base_port);
        let credentials = credentials(&sandbox.id, credential_seed);
        let services = vec![
            self.app_service(sandbox, &ports, &credentials),
            self.database_service(&sandbox.id, &ports, &credentials),
            self.cache_service(&sandbox.id, &ports, &credentials),
            self.editor_service(&sandbox.id, &ports, &credentials),
        ];

        EnvironmentDescriptor {
            sandbox_id: sandbox.id.clone(),
            project_name: sandbox.project_name.clone(),
            sandbox_type: sandbox.sandbox_type,
            isolation_level: sandbox.isolation_level,
            project_path: sandbox.project_path.clone(),
            network: self.network.clone(),
            ports,
            credentials,
            services,
        }
    }

    fn app_service(&self, sandbox: &Sandbox, ports: &ServicePorts, creds: &Credentials) -> ServiceSpec {
        let (app, debug, secondary) = runtime_ports(sandbox.sandbox_type);
        let db_host = container_name(&sandbox.id, ServiceKind::Database);
        let cache_host = container_name(&sandbox.id, ServiceKind::Cache);

        let mut env = BTreeMap::new();
        env.insert("SANDBOX_ID".to_string(), sandbox.id.clone());
        env.insert("PORT".to_string(), app.to_string());
        env.insert("DEBUG_PORT".to_string(), debug.to_string());
        env.insert("SECONDARY_PORT".to_string(), secondary.to_string());
        env.insert("NOTEBOOK_PORT".to_string(), NOTEBOOK_PORT.to_string());
        env.insert(
            "DATABASE_URL".to_string(),
            format!(
                "postgres://{}:{}@{db_host}:{DATABASE_PORT}/{}",
                creds.database_user, creds.database_password, creds.database_name
            ),
        );
        env.insert(
            "REDIS_URL".to_string(),
            format!("redis://:{}@{cache_host}:{CACHE_PORT}", creds.cache_password),
        );

        ServiceSpec {
            kind: ServiceKind::App,
            container_name: container_name(&sandbox.id, ServiceKind::App),
            image: self.images.runtime_image(sandbox.sandbox_type).to_string(),
            env,
            ports: vec![
                PortMapping { host: ports.app, container: app },
                PortMapping { host: ports.debug, container: debug },
                PortMapping { host: ports.secondary, container: secondary },
                PortMapping { host: ports.notebook, container: NOTEBOOK_PORT },
            ],
            volume: None,
            mount_project: true,
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        }
    }

    fn database_service(&self, id: &str, ports: &ServicePorts, creds: &Credentials) -> ServiceSpec {
        let mut env = BTreeMap::new();
        env.insert("POSTGRES_DB".to_string(), creds.database_name.clone());
        env.insert("POSTGRES_USER".to_string(), creds.database_user.clone());
        env.insert("POSTGRES_PASSWORD".to_string(), creds.database_password.clone());

        ServiceSpec {
            kind: ServiceKind::Database,
            container_name: container_name(id, ServiceKind::Database),
            image: self.images.database.clone(),
            env,
            ports: vec![PortMapping { host: ports.database, container: DATABASE_PORT }],
            volume: Some(data_volume(id, ServiceKind::Database, "/var/lib/postgresql/data")),
            mount_project: false,
            command: None,
        }
    }

    fn cache_service(&self, id: &str, ports: &ServicePorts, creds: &Credentials) -> ServiceSpec {
        ServiceSpec {
            kind: ServiceKind::Cache,
            container_name: container_name(id, ServiceKind::Cache),
            image: self.images.cache.clone(),
            env: BTreeMap::new(),
            ports: vec![PortMapping { host: ports.cache, container: CACHE_PORT }],
            volume: Some(data_volume(id, ServiceKind::Cache, "/data")),
            mount_project: false,
            command: Some(vec![
                "redis-server".to_string(),
                "--requirepass".to_string(),
                creds.cache_password.clone(),
                "--appendonly".to_string(),
                "yes".to_string(),
            ]),
        }
    }

    fn editor_service(&self, id: &str, ports: &ServicePorts, creds: &Credentials) -> ServiceSpec {
        let mut env = BTreeMap::new();
        env.insert("PASSWORD".to_string(), creds.editor_password.clone());

        ServiceSpec {
            kind: ServiceKind::Editor,
            container_name: container_name(id, ServiceKind::Editor),
            image: self.images.editor.clone(),
            env,
            ports: vec![PortMapping { host: ports.editor, container: EDITOR_PORT }],
            volume: Some(data_volume(id, ServiceKind::Editor, "/home/coder/.local/share/code-server")),
            mount_project: true,
            command: Some(vec![
                "--bind-addr".to_string(),
                format!("0.0.0.0:{EDITOR_PORT}"),
                "--auth".to_string(),
                "password".to_string(),
                WORKSPACE_DIR.to_string(),
            ]),
        }
    }
}

fn credentials(id: &str, seed: &str) -> Credentials {
    let ident = format!("sbx_{}", id.replace('-', "_").to_lowercase());
    Credentials {
        database_name: ident.clone(),
        database_user: ident,
        database_password: derive_secret(seed, id, "database"),
        cache_password: derive_secret(seed, id, "cache"),
        editor_password: derive_secret(seed, id, "editor"),
    }
}

fn derive_secret(seed: &str, id: &str, purpose: &str) -> String {
    let name = format!("{seed}:{id}:{purpose}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
        .simple()
        .to_string()
}

/// Container-side (app, debug, secondary) ports for each runtime.
fn runtime_ports(sandbox_type: SandboxType) -> (u16, u16, u16) {
    match sandbox_type {
        SandboxType::Nodejs => (3000, 9229, 3001),
        SandboxType::Python => (8000, 5678, 5000),
        SandboxType::React => (3000, 9229, 6006),
        SandboxType::Api => (8080, 9229, 9090),
    }
}

fn data_volume(id: &str, kind: ServiceKind, target: &str) -> VolumeMount {
    VolumeMount {
        name: format!("sbx-{id}-{kind}-data"),
        target: target.to_string(),
    }
}

/// Atomically write the descriptor's env file to `path`.
pub(crate) fn write_env_file(path: &Path, descriptor: &EnvironmentDescriptor) -> Result<(), FleetError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .map_err(|e| FleetError::io(format!("Failed to create directory {}", parent.display()), e))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|e| FleetError::io("Failed to create temporary env file", e))?;
    tmp.write_all(descriptor.render_env_file().as_bytes())
        .and_then(|()| tmp.flush())
        .map_err(|e| FleetError::io("Failed to write env file", e))?;
    tmp.persist(path)
        .map_err(|e| FleetError::io(format!("Failed to write {}", path.display()), e.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{sandbox_fixture, SandboxStatus};
    use tempfile::tempdir;

    const SEED: &str = "seed";

    fn materializer() -> Materializer {
        Materializer::new(&Config::default())
    }

    #[test]
    fn test_ports_use_fixed_offsets() {
        let sandbox = sandbox_fixture("web-app", 50100, SandboxStatus::Creating);
        let descriptor = materializer().materialize(&sandbox, SEED);

        assert_eq!(
            descriptor.ports.labelled().map(|(_, p)| p),
            [50100, 50101, 50102, 50103, 50104, 50105, 50106]
        );
        let db = descriptor.service(ServiceKind::Database).unwrap();
        assert_eq!(db.ports, vec![PortMapping { host: 50104, container: 5432 }]);
        let editor = descriptor.service(ServiceKind::Editor).unwrap();
        assert_eq!(editor.ports[0].host, 50106);
    }

    #[test]
    fn test_materialize_is_deterministic() {
        let sandbox = sandbox_fixture("web-app", 50100, SandboxStatus::Creating);
        let m = materializer();
        assert_eq!(m.materialize(&sandbox, SEED), m.materialize(&sandbox, SEED));
    }

    #[test]
    fn test_credentials_differ_per_sandbox_and_seed() {
        let m = materializer();
        let a = m.materialize(&sandbox_fixture("a", 50100, SandboxStatus::Running), SEED);
        let b = m.materialize(&sandbox_fixture("b", 50110, SandboxStatus::Running), SEED);
        assert_ne!(a.credentials.database_password, b.credentials.database_password);
        assert_ne!(a.credentials.database_password, a.credentials.cache_password);

        let reseeded = m.materialize(&sandbox_fixture("a", 50100, SandboxStatus::Running), "other");
        assert_ne!(a.credentials.database_password, reseeded.credentials.database_password);
    }

    #[test]
    fn test_database_identifiers_are_sql_safe() {
        let descriptor = materializer().materialize(&sandbox_fixture("Web-App", 50100, SandboxStatus::Running), SEED);
        assert_eq!(descriptor.credentials.database_name, "sbx_web_app");
        assert_eq!(descriptor.credentials.database_user, "sbx_web_app");
    }

    #[test]
    fn test_python_sandbox_uses_python_runtime() {
        let mut sandbox = sandbox_fixture("ml", 50100, SandboxStatus::Creating);
        sandbox.sandbox_type = SandboxType::Python;
        let descriptor = materializer().materialize(&sandbox, SEED);

        let app = descriptor.service(ServiceKind::App).unwrap();
        assert_eq!(app.image, "python:3.12-bookworm");
        assert_eq!(app.ports[1], PortMapping { host: 50101, container: 5678 });
        assert_eq!(app.ports[3], PortMapping { host: 50103, container: 8888 });
        assert!(app.env["DATABASE_URL"].contains("@sbx-ml-db:5432/sbx_ml"));
    }

    #[test]
    fn test_descriptor_carries_identity() {
        let sandbox = sandbox_fixture("web-app", 50100, SandboxStatus::Creating);
        let descriptor = materializer().materialize(&sandbox, SEED);

        assert_eq!(descriptor.network, "sandbox-fleet");
        assert_eq!(descriptor.project_path, sandbox.project_path);
        assert_eq!(descriptor.isolation_level, IsolationLevel::Medium);
        assert_eq!(descriptor.services.len(), 4);
        assert_eq!(
            descriptor.services.iter().map(|s| s.container_name.as_str()).collect::<Vec<_>>(),
            vec!["sbx-web-app-app", "sbx-web-app-db", "sbx-web-app-cache", "sbx-web-app-editor"]
        );
        assert_eq!(
            descriptor.service(ServiceKind::Cache).unwrap().volume.as_ref().unwrap().name,
            "sbx-web-app-cache-data"
        );
    }

    #[test]
    fn test_service_kind_parse() {
        assert_eq!("db".parse::<ServiceKind>().unwrap(), ServiceKind::Database);
        assert_eq!("Redis".parse::<ServiceKind>().unwrap(), ServiceKind::Cache);
        assert!("mongo".parse::<ServiceKind>().unwrap_err().is_validation());
    }

    #[test]
    fn test_write_env_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("env").join("web-app.env");
        let descriptor = materializer().materialize(&sandbox_fixture("web-app", 50100, SandboxStatus::Creating), SEED);

        write_env_file(&path, &descriptor).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# sandbox-fleet environment for web-app"));
        assert!(content.contains("APP_PORT=50100\n"));
        assert!(content.contains("EDITOR_PORT=50106\n"));
        assert!(content.contains("DB_NAME=sbx_web_app\n"));
        assert!(content.contains("REDIS_URL=redis://:"));
    }
}
