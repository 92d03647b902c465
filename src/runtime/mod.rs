//! Container runtime adapters.
//!
//! The lifecycle controller talks to containers only through
//! [`ContainerRuntime`], handing it an [`EnvironmentDescriptor`] and sandbox
//! ids. The Docker implementation drives the daemon via bollard; tests use an
//! in-memory fake.

mod docker;
mod error;
#[cfg(test)]
pub(crate) mod fake;
mod network;

pub(crate) use docker::DockerRuntime;
pub(crate) use error::RuntimeError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::Serialize;

use crate::environment::{EnvironmentDescriptor, ServiceKind};

/// Label carrying the owning sandbox id on containers and volumes.
pub(crate) const LABEL_SANDBOX: &str = "sandbox-fleet.id";
/// Label carrying the service kind on containers and volumes.
pub(crate) const LABEL_SERVICE: &str = "sandbox-fleet.service";
/// Label marking every resource this tool created.
pub(crate) const LABEL_MANAGED: &str = "sandbox-fleet.managed";

/// Observed state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ContainerState {
    pub name: String,
    pub service: String,
    /// Docker state word: created, running, exited, ...
    pub state: String,
    /// Human status line, e.g. "Up 3 minutes (healthy)".
    pub status: String,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// Running and not reporting a failing or pending healthcheck.
    pub fn is_ready(&self) -> bool {
        self.is_running()
            && !self.status.contains("(unhealthy)")
            && !self.status.contains("health: starting")
    }
}

/// Live view of a sandbox's containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct RuntimeStatus {
    pub containers: Vec<ContainerState>,
    pub healthy: bool,
}

impl RuntimeStatus {
    /// Healthy when every service kind has a ready container.
    pub fn from_containers(containers: Vec<ContainerState>) -> Self {
        let healthy = ServiceKind::ALL.iter().all(|kind| {
            containers
                .iter()
                .any(|c| c.service == kind.as_str() && c.is_ready())
        });
        Self {
            containers,
            healthy,
        }
    }
}

/// Point-in-time resource usage of one container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ResourceUsage {
    pub container: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
}

/// Runtime resources removed by an orphan sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct PruneReport {
    pub containers: Vec<String>,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.containers.len() + self.volumes.len() + self.networks.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LogOptions {
    pub follow: bool,
    /// Lines from the end of each container's log; `None` means all.
    pub tail: Option<u64>,
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogLine {
    pub service: String,
    pub stderr: bool,
    pub message: String,
}

pub(crate) type LogStream = BoxStream<'static, Result<LogLine, RuntimeError>>;

/// Brings sandbox containers up and down and reports on them.
#[async_trait]
pub(crate) trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name for display.
    fn name(&self) -> &'static str;

    /// Create the shared bridge network if it does not exist yet.
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Create any missing containers and volumes, then start them all.
    async fn up(&self, descriptor: &EnvironmentDescriptor) -> Result<(), RuntimeError>;

    /// Stop every container of the sandbox, keeping containers and volumes.
    async fn down(&self, sandbox_id: &str) -> Result<(), RuntimeError>;

    async fn status(&self, sandbox_id: &str) -> Result<RuntimeStatus, RuntimeError>;

    /// Remove the sandbox's containers and named volumes.
    async fn teardown_volumes(&self, sandbox_id: &str) -> Result<(), RuntimeError>;

    /// Remove managed containers, volumes and networks that belong to no
    /// sandbox in `live_ids`. `network` is the shared network to keep.
    ///
    /// Containers and volumes created at or after `cutoff`, or whose creation
    /// time is unknown, are left alone: they may belong to a sandbox that
    /// registered after `live_ids` was read.
    async fn prune_orphans(
        &self,
        live_ids: &[String],
        network: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<PruneReport, RuntimeError>;

    async fn resource_usage(&self, sandbox_id: &str) -> Result<Vec<ResourceUsage>, RuntimeError>;

    /// Stream output of one service, or of every service when `service` is `None`.
    async fn logs(
        &self,
        sandbox_id: &str,
        service: Option<ServiceKind>,
        options: LogOptions,
    ) -> Result<LogStream, RuntimeError>;
}
