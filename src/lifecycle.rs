//! Single-sandbox lifecycle: create, start, stop, remove, info and logs.
//!
//! Registry mutations go through [`RegistryStore::commit`]; container work
//! happens between commits so the registry lock is never held across runtime
//! I/O. Status only moves along [`SandboxStatus::can_transition_to`].

use std::fs;
use std::io;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{Config, FleetPaths, PortConfig, StartupConfig};
use crate::environment::{write_env_file, EnvironmentDescriptor, Materializer, ServiceKind};
use crate::error::FleetError;
use crate::ports::{allocate_block, PortProbe};
use crate::registry::{
    IsolationLevel, Registry, RegistryStore, Sandbox, SandboxStatus, SandboxType,
};
use crate::runtime::{ContainerRuntime, LogOptions, LogStream, ResourceUsage, RuntimeStatus};

/// Longest accepted sandbox id.
const MAX_ID_LEN: usize = 48;

/// Parameters for [`LifecycleController::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CreateRequest {
    pub id: String,
    /// Defaults to the id when not given.
    pub project_name: Option<String>,
    pub sandbox_type: SandboxType,
    pub isolation_level: IsolationLevel,
}

impl CreateRequest {
    /// Build a request from CLI strings. Unknown types and levels are
    /// validation errors.
    pub fn parse(
        id: &str,
        project_name: Option<&str>,
        sandbox_type: Option<&str>,
        isolation_level: Option<&str>,
    ) -> Result<Self, FleetError> {
        Ok(Self {
            id: id.to_string(),
            project_name: project_name
                .filter(|p| !p.trim().is_empty())
                .map(str::to_string),
            sandbox_type: sandbox_type.map_or(Ok(SandboxType::Nodejs), str::parse)?,
            isolation_level: isolation_level.map_or(Ok(IsolationLevel::default()), str::parse)?,
        })
    }
}

/// Registry record merged with what the runtime reports.
#[derive(Debug, Clone)]
pub(crate) struct SandboxInfo {
    pub sandbox: Sandbox,
    pub descriptor: EnvironmentDescriptor,
    /// `None` when the runtime could not be queried.
    pub runtime: Option<RuntimeStatus>,
    pub usage: Vec<ResourceUsage>,
    pub runtime_error: Option<String>,
}

/// Drives one sandbox at a time through its state machine.
pub(crate) struct LifecycleController {
    store: RegistryStore,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn PortProbe>,
    materializer: Materializer,
    paths: FleetPaths,
    ports: PortConfig,
    startup: StartupConfig,
}

impl LifecycleController {
    pub fn new(
        config: &Config,
        paths: FleetPaths,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        Self {
            store: RegistryStore::new(
                &paths,
                config.fleet.max_sandboxes,
                config.startup.lock_timeout(),
            ),
            runtime,
            probe,
            materializer: Materializer::new(config),
            paths,
            ports: config.ports,
            startup: config.startup.clone(),
        }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    pub fn network(&self) -> &str {
        self.materializer.network()
    }

    /// Current registry contents.
    pub fn registry(&self) -> Result<Registry, FleetError> {
        self.store.load()
    }

    // ---- Operations ----

    /// Register a new sandbox, bring its containers up and wait for them to
    /// report ready.
    ///
    /// On timeout or runtime failure the sandbox stays registered as
    /// `failed` with its ports and containers left for inspection.
    pub async fn create(&self, request: &CreateRequest) -> Result<Sandbox, FleetError> {
        validate_id(&request.id)?;
        let id = request.id.as_str();
        let max = self.store.max_sandboxes();
        let project_path = self.paths.project_path(id);

        let (_, sandbox) = self.store.commit(|registry| {
            if registry.contains(id) {
                return Err(FleetError::duplicate(id));
            }
            if registry.len() >= max {
                return Err(FleetError::CapacityExceeded { max });
            }

            let block = allocate_block(registry, &self.ports, self.probe.as_ref())?;
            let sandbox = Sandbox {
                id: id.to_string(),
                project_name: request.project_name.clone().unwrap_or_else(|| id.to_string()),
                sandbox_type: request.sandbox_type,
                isolation_level: request.isolation_level,
                base_port: block.base,
                project_path: project_path.clone(),
                status: SandboxStatus::Creating,
                created_at: Utc::now(),
            };
            registry.insert(sandbox.clone());
            Ok(sandbox)
        })?;

        info!(
            event = "sandbox_registered",
            sandbox = %id,
            base_port = sandbox.base_port,
            sandbox_type = %sandbox.sandbox_type,
            runtime = self.runtime.name(),
        );

        if let Err(e) = self.bring_up(&sandbox).await {
            warn!(sandbox = %id, "Sandbox creation failed: {}", e);
            if let Err(commit_err) = self.transition(id, SandboxStatus::Failed) {
                warn!(sandbox = %id, "Could not record failure: {}", commit_err);
            }
            return Err(e);
        }

        let sandbox = self.transition(id, SandboxStatus::Running)?;
        info!(event = "sandbox_running", sandbox = %id);
        Ok(sandbox)
    }

    /// Bring a stopped sandbox back up. Starting a running sandbox is a no-op.
    pub async fn start(&self, id: &str) -> Result<Sandbox, FleetError> {
        let sandbox = self.lookup(id)?;
        if sandbox.status == SandboxStatus::Running {
            debug!(sandbox = %id, "Sandbox already running");
            return Ok(sandbox);
        }
        check_transition(&sandbox, SandboxStatus::Running)?;

        let descriptor = self.prepare(&sandbox)?;
        self.runtime.ensure_network(self.network()).await?;
        self.runtime.up(&descriptor).await?;

        let sandbox = self.transition(id, SandboxStatus::Running)?;
        info!(event = "sandbox_started", sandbox = %id);
        Ok(sandbox)
    }

    /// Stop a running sandbox's containers. Stopping a stopped sandbox is a no-op.
    pub async fn stop(&self, id: &str) -> Result<Sandbox, FleetError> {
        let sandbox = self.lookup(id)?;
        if sandbox.status == SandboxStatus::Stopped {
            debug!(sandbox = %id, "Sandbox already stopped");
            return Ok(sandbox);
        }
        check_transition(&sandbox, SandboxStatus::Stopped)?;

        self.runtime.down(id).await?;

        let sandbox = self.transition(id, SandboxStatus::Stopped)?;
        info!(event = "sandbox_stopped", sandbox = %id);
        Ok(sandbox)
    }

    /// Tear down containers and volumes, then delete the record and release
    /// its ports in one commit. The project source tree is kept.
    ///
    /// Callers obtain operator confirmation before calling this.
    pub async fn remove(&self, id: &str) -> Result<Sandbox, FleetError> {
        let sandbox = self.lookup(id)?;
        check_transition(&sandbox, SandboxStatus::Removed)?;

        self.runtime.down(id).await?;
        self.runtime.teardown_volumes(id).await?;

        let (_, removed) = self.store.commit(|registry| {
            registry.set_status(id, SandboxStatus::Removed)?;
            registry.remove(id).ok_or_else(|| FleetError::not_found(id))
        })?;

        self.remove_env_file(id);

        info!(
            event = "sandbox_removed",
            sandbox = %id,
            base_port = removed.base_port,
        );
        Ok(removed)
    }

    /// Delete the records of those `ids` that are still stopped, releasing
    /// their ports in one commit. Returns the ids deleted.
    pub fn purge_stopped(&self, ids: &[String]) -> Result<Vec<String>, FleetError> {
        let (_, purged) = self.store.commit(|registry| {
            let mut purged = Vec::new();
            for id in ids {
                if registry
                    .get(id)
                    .is_some_and(|s| s.status == SandboxStatus::Stopped)
                {
                    registry.set_status(id, SandboxStatus::Removed)?;
                    registry.remove(id);
                    purged.push(id.clone());
                }
            }
            Ok(purged)
        })?;

        for id in &purged {
            self.remove_env_file(id);
            info!(event = "sandbox_purged", sandbox = %id);
        }
        Ok(purged)
    }

    /// Registry record plus live container state and resource usage.
    ///
    /// A runtime failure degrades to the record alone with the error noted.
    pub async fn info(&self, id: &str) -> Result<SandboxInfo, FleetError> {
        let sandbox = self.lookup(id)?;
        let descriptor = self.descriptor(&sandbox)?;

        let (runtime, runtime_error) = match self.runtime.status(id).await {
            Ok(status) => (Some(status), None),
            Err(e) => {
                warn!(sandbox = %id, "Could not query runtime: {}", e);
                (None, Some(e.to_string()))
            }
        };

        let usage = if runtime.is_some() {
            self.runtime.resource_usage(id).await.unwrap_or_else(|e| {
                warn!(sandbox = %id, "Could not read resource usage: {}", e);
                Vec::new()
            })
        } else {
            Vec::new()
        };

        Ok(SandboxInfo {
            sandbox,
            descriptor,
            runtime,
            usage,
            runtime_error,
        })
    }

    /// Stream container logs for a registered sandbox.
    pub async fn logs(
        &self,
        id: &str,
        service: Option<ServiceKind>,
        options: LogOptions,
    ) -> Result<LogStream, FleetError> {
        self.lookup(id)?;
        Ok(self.runtime.logs(id, service, options).await?)
    }

    // ---- Helpers ----

    fn lookup(&self, id: &str) -> Result<Sandbox, FleetError> {
        self.store
            .load()?
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::not_found(id))
    }

    fn transition(&self, id: &str, status: SandboxStatus) -> Result<Sandbox, FleetError> {
        self.store
            .commit(|registry| registry.set_status(id, status))
            .map(|(_, sandbox)| sandbox)
    }

    fn remove_env_file(&self, id: &str) {
        let env_file = self.paths.env_file(id);
        match fs::remove_file(&env_file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", env_file.display(), e),
        }
    }

    fn descriptor(&self, sandbox: &Sandbox) -> Result<EnvironmentDescriptor, FleetError> {
        let seed = self.store.credential_seed()?;
        Ok(self.materializer.materialize(sandbox, &seed))
    }

    /// Materialize the descriptor and write its env file and project dir.
    fn prepare(&self, sandbox: &Sandbox) -> Result<EnvironmentDescriptor, FleetError> {
        fs::create_dir_all(&sandbox.project_path).map_err(|e| {
            FleetError::io(
                format!("Failed to create {}", sandbox.project_path.display()),
                e,
            )
        })?;
        let descriptor = self.descriptor(sandbox)?;
        write_env_file(&self.paths.env_file(&sandbox.id), &descriptor)?;
        Ok(descriptor)
    }

    async fn bring_up(&self, sandbox: &Sandbox) -> Result<(), FleetError> {
        let descriptor = self.prepare(sandbox)?;
        self.runtime.ensure_network(self.network()).await?;
        self.runtime.up(&descriptor).await?;
        self.wait_until_ready(&sandbox.id).await
    }

    /// Poll runtime status with exponential backoff until every service is
    /// ready or the startup timeout passes.
    async fn wait_until_ready(&self, id: &str) -> Result<(), FleetError> {
        let timeout = self.startup.timeout();
        let deadline = Instant::now() + timeout;
        let mut interval = self.startup.poll_interval();

        loop {
            let status = self.runtime.status(id).await?;
            if status.healthy {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(FleetError::start_timeout(id, timeout));
            }

            debug!(
                sandbox = %id,
                ready = status.containers.iter().filter(|c| c.is_ready()).count(),
                total = status.containers.len(),
                "Waiting for containers"
            );
            sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(self.startup.max_poll_interval());
        }
    }
}

/// Ids become container, volume and directory names.
pub(crate) fn validate_id(id: &str) -> Result<(), FleetError> {
    if id.is_empty() {
        return Err(FleetError::validation("Sandbox id must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(FleetError::validation(format!(
            "Sandbox id '{id}' is longer than {MAX_ID_LEN} characters"
        )));
    }
    if !id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(FleetError::validation(format!(
            "Sandbox id '{id}' must start with a letter or digit"
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(FleetError::validation(format!(
            "Sandbox id '{id}' contains '{bad}'; use letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

fn check_transition(sandbox: &Sandbox, to: SandboxStatus) -> Result<(), FleetError> {
    if sandbox.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(FleetError::InvalidTransition {
            id: sandbox.id.clone(),
            from: sandbox.status,
            to,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{controller, controller_with, test_config};
    use super::*;
    use crate::ports::testing::StaticProbe;
    use crate::runtime::fake::FakeRuntime;
    use futures_util::StreamExt;

    fn request(id: &str) -> CreateRequest {
        CreateRequest::parse(id, Some("myproj"), Some("nodejs"), Some("medium")).unwrap()
    }

    #[tokio::test]
    async fn test_create_reserves_block_and_runs() {
        let (dir, runtime, controller) = controller(FakeRuntime::new());

        let sandbox = controller.create(&request("web-app")).await.unwrap();

        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(sandbox.base_port, 50100);
        assert_eq!(sandbox.project_name, "myproj");

        let registry = controller.registry().unwrap();
        assert_eq!(registry.get("web-app").unwrap().status, SandboxStatus::Running);
        for port in 50100..=50106 {
            assert_eq!(registry.port_allocation[&port], "web-app");
        }
        assert_eq!(registry.port_allocation.len(), 7);

        assert!(runtime.is_running("web-app"));
        assert_eq!(runtime.networks(), vec!["sandbox-fleet".to_string()]);
        assert!(dir.path().join("env/web-app.env").exists());
        assert!(dir.path().join("projects/web-app").is_dir());
    }

    #[tokio::test]
    async fn test_create_duplicate_leaves_registry_unchanged() {
        let (_dir, runtime, controller) = controller(FakeRuntime::new());
        controller.create(&request("x")).await.unwrap();
        let before = controller.registry().unwrap();

        let err = controller.create(&request("x")).await.unwrap_err();

        assert!(err.is_duplicate());
        assert_eq!(controller.registry().unwrap(), before);
        assert_eq!(runtime.call_count("up"), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_beyond_capacity() {
        let (_dir, runtime, controller) = controller(FakeRuntime::new());
        for i in 0..20 {
            controller.create(&request(&format!("sbx-{i}"))).await.unwrap();
        }
        let before = controller.registry().unwrap();

        let err = controller.create(&request("one-too-many")).await.unwrap_err();

        assert!(err.is_capacity_exceeded());
        let after = controller.registry().unwrap();
        assert_eq!(after.len(), 20);
        assert_eq!(after, before);
        assert_eq!(runtime.call_count("up"), 20);
    }

    #[tokio::test]
    async fn test_create_timeout_leaves_sandbox_failed() {
        let (_dir, runtime, controller) = controller(FakeRuntime::new().never_ready());

        let err = controller.create(&request("slow")).await.unwrap_err();

        assert!(err.is_start_timeout());
        let registry = controller.registry().unwrap();
        assert_eq!(registry.get("slow").unwrap().status, SandboxStatus::Failed);
        assert_eq!(registry.port_allocation.len(), 7);
        assert!(runtime.has_volumes("slow"));
        assert_eq!(runtime.call_count("teardown"), 0);
    }

    #[tokio::test]
    async fn test_create_runtime_failure_leaves_sandbox_failed() {
        let (_dir, _runtime, controller) = controller(FakeRuntime::new().failing_up("broken"));

        let err = controller.create(&request("broken")).await.unwrap_err();

        assert!(matches!(err, FleetError::Adapter(_)));
        assert!(err.to_string().contains("port is already allocated"));
        assert_eq!(
            controller.registry().unwrap().get("broken").unwrap().status,
            SandboxStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let (_dir, runtime, controller) = controller(FakeRuntime::new());

        let err = controller.create(&request("")).await.unwrap_err();
        assert!(err.is_validation());
        assert!(controller.create(&request("-dash")).await.unwrap_err().is_validation());
        assert!(controller.create(&request("a/b")).await.unwrap_err().is_validation());
        assert!(CreateRequest::parse("ok", None, Some("cobol"), None)
            .unwrap_err()
            .is_validation());

        assert!(controller.registry().unwrap().is_empty());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_skips_ports_bound_on_host() {
        let (_dir, _runtime, controller) =
            controller_with(&test_config(), FakeRuntime::new(), StaticProbe::busy([50103]));

        let sandbox = controller.create(&request("web-app")).await.unwrap();
        assert_eq!(sandbox.base_port, 50110);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (_dir, runtime, controller) = controller(FakeRuntime::new());
        controller.create(&request("web-app")).await.unwrap();

        let sandbox = controller.start("web-app").await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert_eq!(runtime.call_count("up"), 1);

        controller.stop("web-app").await.unwrap();
        let sandbox = controller.stop("web-app").await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Stopped);
        assert_eq!(runtime.call_count("down"), 1);
        assert!(!runtime.is_running("web-app"));

        let sandbox = controller.start("web-app").await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Running);
        assert!(runtime.is_running("web-app"));
    }

    #[tokio::test]
    async fn test_credentials_survive_restart_and_reinit() {
        let config = test_config();
        let (dir, runtime, controller) =
            controller_with(&config, FakeRuntime::new(), StaticProbe::all_free());
        controller.create(&request("web-app")).await.unwrap();
        let env_file = dir.path().join("env/web-app.env");
        let written = fs::read_to_string(&env_file).unwrap();
        let first = controller.info("web-app").await.unwrap().descriptor.credentials;

        controller.stop("web-app").await.unwrap();
        controller.start("web-app").await.unwrap();
        assert_eq!(fs::read_to_string(&env_file).unwrap(), written);

        assert!(!controller.store().initialize().unwrap());
        let paths = FleetPaths::new(dir.path(), &config).unwrap();
        let reopened =
            LifecycleController::new(&config, paths, runtime, Arc::new(StaticProbe::all_free()));
        let again = reopened.info("web-app").await.unwrap().descriptor.credentials;
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn test_start_failed_sandbox_is_rejected() {
        let (_dir, _runtime, controller) = controller(FakeRuntime::new().failing_up("broken"));
        controller.create(&request("broken")).await.unwrap_err();

        let err = controller.start("broken").await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::InvalidTransition {
                from: SandboxStatus::Failed,
                to: SandboxStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (_dir, _runtime, controller) = controller(FakeRuntime::new());

        assert!(controller.start("ghost").await.unwrap_err().is_not_found());
        assert!(controller.stop("ghost").await.unwrap_err().is_not_found());
        assert!(controller.remove("ghost").await.unwrap_err().is_not_found());
        assert!(controller.info("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_releases_ports() {
        let (dir, runtime, controller) = controller(FakeRuntime::new());
        controller.create(&request("web-app")).await.unwrap();
        controller.create(&request("other")).await.unwrap();

        let removed = controller.remove("web-app").await.unwrap();
        assert_eq!(removed.base_port, 50100);

        let registry = controller.registry().unwrap();
        assert!(!registry.contains("web-app"));
        assert!((50100..=50106).all(|p| !registry.is_port_reserved(p)));
        assert!(registry.is_port_reserved(50110));
        assert!(!runtime.has_volumes("web-app"));
        assert!(!dir.path().join("env/web-app.env").exists());
        assert!(dir.path().join("projects/web-app").is_dir());
    }

    #[tokio::test]
    async fn test_remove_failed_sandbox() {
        let (_dir, _runtime, controller) = controller(FakeRuntime::new().never_ready());
        controller.create(&request("slow")).await.unwrap_err();

        controller.remove("slow").await.unwrap();
        assert!(controller.registry().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_keeps_record_when_teardown_fails() {
        let (_dir, _runtime, controller) =
            controller(FakeRuntime::new().failing_teardown("web-app"));
        controller.create(&request("web-app")).await.unwrap();

        let err = controller.remove("web-app").await.unwrap_err();
        assert!(matches!(err, FleetError::Adapter(_)));
        assert!(controller.registry().unwrap().contains("web-app"));
    }

    #[tokio::test]
    async fn test_info_merges_runtime_state() {
        let (_dir, _runtime, controller) = controller(FakeRuntime::new());
        controller.create(&request("web-app")).await.unwrap();
        let before = controller.registry().unwrap();

        let info = controller.info("web-app").await.unwrap();

        assert_eq!(info.sandbox.id, "web-app");
        assert_eq!(info.descriptor.ports.editor, 50106);
        let runtime = info.runtime.unwrap();
        assert!(runtime.healthy);
        assert_eq!(runtime.containers.len(), 4);
        assert_eq!(info.usage.len(), 4);
        assert!(info.runtime_error.is_none());
        assert_eq!(controller.registry().unwrap(), before);
    }

    #[tokio::test]
    async fn test_logs_stream_selected_service() {
        let (_dir, _runtime, controller) = controller(FakeRuntime::new());
        controller.create(&request("web-app")).await.unwrap();

        let lines: Vec<_> = controller
            .logs("web-app", Some(ServiceKind::Database), LogOptions::default())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_ref().unwrap().service, "db");
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("web-app").is_ok());
        assert!(validate_id("test_001").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("_hidden").is_err());
        assert!(validate_id("has space").is_err());
        assert!(validate_id(&"a".repeat(49)).is_err());
        assert!(validate_id(&"a".repeat(48)).is_ok());
    }

    #[test]
    fn test_create_request_defaults() {
        let request = CreateRequest::parse("web-app", None, None, None).unwrap();
        assert_eq!(request.sandbox_type, SandboxType::Nodejs);
        assert_eq!(request.isolation_level, IsolationLevel::Medium);
        assert!(request.project_name.is_none());

        let request = CreateRequest::parse("api", Some("  "), Some("API"), Some("high")).unwrap();
        assert_eq!(request.sandbox_type, SandboxType::Api);
        assert_eq!(request.isolation_level, IsolationLevel::High);
        assert!(request.project_name.is_none());
    }
}
