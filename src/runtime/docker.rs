use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, PortBinding, Volume};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{
    network, ContainerRuntime, ContainerState, LogLine, LogOptions, LogStream, PruneReport,
    ResourceUsage, RuntimeError, RuntimeStatus, LABEL_MANAGED, LABEL_SANDBOX, LABEL_SERVICE,
};
use crate::config::{IsolationConfig, ResourceConfig};
use crate::environment::{
    container_name, EnvironmentDescriptor, ServiceKind, ServiceSpec, WORKSPACE_DIR,
};
use crate::registry::IsolationLevel;

/// Seconds Docker waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: i64 = 10;
/// Host interface the sandbox ports are published on.
const PUBLISH_HOST: &str = "127.0.0.1";

/// Runs sandbox services as Docker containers via the local daemon.
pub(crate) struct DockerRuntime {
    docker: Docker,
    isolation: IsolationConfig,
}

impl DockerRuntime {
    /// Build a client for the local daemon. No request is made until the
    /// first operation.
    pub fn connect(isolation: IsolationConfig) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::docker_unavailable(e.to_string()))?;
        Ok(Self { docker, isolation })
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map(|_| ()).map_err(|e| {
            RuntimeError::docker_unavailable(format!("{e}. Is Docker running?"))
        })
    }

    async fn list_labelled(&self, label: String) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label]);

        self.docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::container_failed(format!("Failed to list containers: {e}")))
    }

    async fn sandbox_containers(&self, sandbox_id: &str) -> Result<Vec<ContainerState>, RuntimeError> {
        let summaries = self
            .list_labelled(format!("{LABEL_SANDBOX}={sandbox_id}"))
            .await?;
        Ok(summaries.into_iter().map(summary_to_state).collect())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!("Image {} already exists locally", image);
            return Ok(());
        }

        info!("Image {} not found locally, pulling...", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            if let Err(e) = progress {
                warn!("Failed to pull image {}: {}", image, e);
                return Err(RuntimeError::image_not_found(image));
            }
        }

        info!("Pulled image {}", image);
        Ok(())
    }

    async fn ensure_volume(
        &self,
        sandbox_id: &str,
        service: &ServiceSpec,
    ) -> Result<(), RuntimeError> {
        let Some(volume) = &service.volume else {
            return Ok(());
        };

        self.docker
            .create_volume(CreateVolumeOptions {
                name: volume.name.clone(),
                labels: resource_labels(sandbox_id, service.kind),
                ..Default::default()
            })
            .await
            .map_err(|e| RuntimeError::volume_failed(format!("{}: {e}", volume.name)))?;
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(RuntimeError::container_failed(format!(
                "Failed to inspect {name}: {e}"
            ))),
        }
    }

    async fn start_service(
        &self,
        descriptor: &EnvironmentDescriptor,
        service: &ServiceSpec,
    ) -> Result<(), RuntimeError> {
        let name = &service.container_name;

        if !self.container_exists(name).await? {
            self.ensure_image(&service.image).await?;
            self.ensure_volume(&descriptor.sandbox_id, service).await?;

            let config = container_config(&self.isolation, descriptor, service)?;
            debug!(container = %name, "Creating container");
            self.docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: name.clone(),
                        platform: None,
                    }),
                    config,
                )
                .await
                .map_err(|e| RuntimeError::container_failed(format!("Failed to create {name}: {e}")))?;
        }

        match self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            // 304: already running
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(RuntimeError::container_failed(format!(
                "Failed to start {name}: {e}"
            ))),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(RuntimeError::container_failed(format!(
                "Failed to remove {name}: {e}"
            ))),
        }
    }

    async fn labelled_volumes(&self, label: String) -> Result<Vec<Volume>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label]);

        let response = self
            .docker
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await
            .map_err(|e| RuntimeError::volume_failed(format!("Failed to list volumes: {e}")))?;

        Ok(response.volumes.unwrap_or_default())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(RuntimeError::volume_failed(format!("{name}: {e}"))),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.ping().await?;
        network::ensure(&self.docker, name).await
    }

    async fn up(&self, descriptor: &EnvironmentDescriptor) -> Result<(), RuntimeError> {
        self.ping().await?;
        info!(sandbox = %descriptor.sandbox_id, "Bringing up sandbox containers");

        // Dependencies first so the app sees a live database and cache.
        let mut services: Vec<&ServiceSpec> = descriptor.services.iter().collect();
        services.sort_by_key(|s| match s.kind {
            ServiceKind::Database | ServiceKind::Cache => 0,
            ServiceKind::App => 1,
            ServiceKind::Editor => 2,
        });

        for service in services {
            self.start_service(descriptor, service).await?;
        }
        Ok(())
    }

    async fn down(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        for container in self.sandbox_containers(sandbox_id).await? {
            if !container.is_running() {
                continue;
            }
            debug!(container = %container.name, "Stopping container");
            match self
                .docker
                .stop_container(
                    &container.name,
                    Some(StopContainerOptions {
                        t: STOP_TIMEOUT_SECS,
                    }),
                )
                .await
            {
                Ok(()) => {}
                Err(e) if is_status(&e, 304) || is_status(&e, 404) => {}
                Err(e) => {
                    return Err(RuntimeError::container_failed(format!(
                        "Failed to stop {}: {e}",
                        container.name
                    )))
                }
            }
        }
        Ok(())
    }

    async fn status(&self, sandbox_id: &str) -> Result<RuntimeStatus, RuntimeError> {
        Ok(RuntimeStatus::from_containers(
            self.sandbox_containers(sandbox_id).await?,
        ))
    }

    async fn teardown_volumes(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        for container in self.sandbox_containers(sandbox_id).await? {
            self.remove_container(&container.name).await?;
        }
        for volume in self
            .labelled_volumes(format!("{LABEL_SANDBOX}={sandbox_id}"))
            .await?
        {
            self.remove_volume(&volume.name).await?;
        }
        info!(sandbox = %sandbox_id, "Removed sandbox containers and volumes");
        Ok(())
    }

    async fn prune_orphans(
        &self,
        live_ids: &[String],
        network: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<PruneReport, RuntimeError> {
        let is_orphan = |labels: Option<&HashMap<String, String>>| {
            labels
                .and_then(|l| l.get(LABEL_SANDBOX))
                .is_some_and(|id| !live_ids.contains(id))
        };
        let mut report = PruneReport::default();

        for summary in self.list_labelled(format!("{LABEL_MANAGED}=true")).await? {
            if is_orphan(summary.labels.as_ref()) && predates(summary.created, cutoff) {
                let state = summary_to_state(summary);
                match self.remove_container(&state.name).await {
                    Ok(()) => report.containers.push(state.name),
                    Err(e) => warn!("{}", e),
                }
            }
        }

        for volume in self.labelled_volumes(format!("{LABEL_MANAGED}=true")).await? {
            if is_orphan(Some(&volume.labels)) && predates(volume_created(&volume), cutoff) {
                match self.remove_volume(&volume.name).await {
                    Ok(()) => report.volumes.push(volume.name),
                    Err(e) => warn!("{}", e),
                }
            }
        }

        report.networks = network::prune(&self.docker, network).await?;
        Ok(report)
    }

    async fn resource_usage(&self, sandbox_id: &str) -> Result<Vec<ResourceUsage>, RuntimeError> {
        let mut usage = Vec::new();

        for container in self.sandbox_containers(sandbox_id).await? {
            if !container.is_running() {
                continue;
            }
            let mut stream = self.docker.stats(
                &container.name,
                Some(StatsOptions {
                    stream: false,
                    one_shot: false,
                }),
            );
            match stream.next().await {
                Some(Ok(stats)) => usage.push(ResourceUsage {
                    container: container.name,
                    cpu_percent: cpu_percent(
                        stats.cpu_stats.cpu_usage.total_usage,
                        stats.precpu_stats.cpu_usage.total_usage,
                        stats.cpu_stats.system_cpu_usage.unwrap_or(0),
                        stats.precpu_stats.system_cpu_usage.unwrap_or(0),
                        stats.cpu_stats.online_cpus.unwrap_or(1),
                    ),
                    memory_bytes: stats.memory_stats.usage.unwrap_or(0),
                    memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
                }),
                Some(Err(e)) => warn!(container = %container.name, "Failed to read stats: {}", e),
                None => {}
            }
        }

        Ok(usage)
    }

    async fn logs(
        &self,
        sandbox_id: &str,
        service: Option<ServiceKind>,
        options: LogOptions,
    ) -> Result<LogStream, RuntimeError> {
        let targets: Vec<(String, String)> = match service {
            Some(kind) => vec![(container_name(sandbox_id, kind), kind.to_string())],
            None => self
                .sandbox_containers(sandbox_id)
                .await?
                .into_iter()
                .map(|c| (c.name, c.service))
                .collect(),
        };

        if targets.is_empty() {
            return Err(RuntimeError::container_failed(format!(
                "Sandbox {sandbox_id} has no containers"
            )));
        }

        let tail = options
            .tail
            .map_or_else(|| "all".to_string(), |n| n.to_string());
        let mut streams = Vec::new();

        for (name, service) in targets {
            if !self.container_exists(&name).await? {
                return Err(RuntimeError::container_failed(format!(
                    "Container {name} does not exist"
                )));
            }

            let stream = self
                .docker
                .logs(
                    &name,
                    Some(LogsOptions::<String> {
                        follow: options.follow,
                        stdout: true,
                        stderr: true,
                        tail: tail.clone(),
                        ..Default::default()
                    }),
                )
                .map(move |chunk| match chunk {
                    Ok(LogOutput::StdErr { message }) => Ok(LogLine {
                        service: service.clone(),
                        stderr: true,
                        message: String::from_utf8_lossy(&message).into_owned(),
                    }),
                    Ok(output) => Ok(LogLine {
                        service: service.clone(),
                        stderr: false,
                        message: output.to_string(),
                    }),
                    Err(e) => Err(RuntimeError::container_failed(format!(
                        "Error reading logs: {e}"
                    ))),
                });
            streams.push(stream.boxed());
        }

        Ok(futures_util::stream::select_all(streams).boxed())
    }
}

/// True if the daemon answered with HTTP `code`.
pub(super) fn is_status(err: &DockerError, code: u16) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

fn resource_labels(sandbox_id: &str, kind: ServiceKind) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_SANDBOX.to_string(), sandbox_id.to_string());
    labels.insert(LABEL_SERVICE.to_string(), kind.to_string());
    labels
}

fn summary_to_state(summary: ContainerSummary) -> ContainerState {
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .or(summary.id)
        .unwrap_or_default();
    let service = summary
        .labels
        .and_then(|mut labels| labels.remove(LABEL_SERVICE))
        .unwrap_or_default();

    ContainerState {
        name,
        service,
        state: summary.state.unwrap_or_default(),
        status: summary.status.unwrap_or_default(),
    }
}

/// Build the Docker container configuration for one service.
fn container_config(
    isolation: &IsolationConfig,
    descriptor: &EnvironmentDescriptor,
    service: &ServiceSpec,
) -> Result<ContainerConfig<String>, RuntimeError> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for mapping in &service.ports {
        let key = format!("{}/tcp", mapping.container);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some(PUBLISH_HOST.to_string()),
                host_port: Some(mapping.host.to_string()),
            }]),
        );
    }

    let mut binds = Vec::new();
    if service.mount_project {
        binds.push(format!(
            "{}:{WORKSPACE_DIR}:rw",
            descriptor
                .project_path
                .to_str()
                .ok_or_else(|| RuntimeError::container_failed("Invalid project path"))?
        ));
    }
    if let Some(volume) = &service.volume {
        binds.push(format!("{}:{}", volume.name, volume.target));
    }

    let mut host_config = HostConfig {
        binds: Some(binds),
        port_bindings: Some(port_bindings),
        network_mode: Some(descriptor.network.clone()),
        ..Default::default()
    };
    apply_isolation(&mut host_config, isolation, descriptor.isolation_level, service.kind)?;

    Ok(ContainerConfig {
        image: Some(service.image.clone()),
        env: Some(service.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        cmd: service.command.clone(),
        labels: Some(resource_labels(&descriptor.sandbox_id, service.kind)),
        exposed_ports: Some(exposed_ports),
        working_dir: service.mount_project.then(|| WORKSPACE_DIR.to_string()),
        host_config: Some(host_config),
        ..Default::default()
    })
}

fn apply_isolation(
    host_config: &mut HostConfig,
    isolation: &IsolationConfig,
    level: IsolationLevel,
    kind: ServiceKind,
) -> Result<(), RuntimeError> {
    let resources: &ResourceConfig = match level {
        IsolationLevel::Low => &isolation.low,
        IsolationLevel::Medium => &isolation.medium,
        IsolationLevel::High => &isolation.high,
    };

    if let Some(memory) = &resources.memory {
        host_config.memory = Some(parse_memory_limit(memory)?);
    }
    if let Some(cpus) = &resources.cpus {
        let cpus: f64 = cpus
            .parse()
            .map_err(|_| RuntimeError::container_failed(format!("Invalid CPU limit: {cpus}")))?;
        #[allow(clippy::cast_possible_truncation)]
        let nano_cpus = (cpus * 1_000_000_000.0) as i64;
        host_config.nano_cpus = Some(nano_cpus);
    }
    host_config.pids_limit = resources.pids_limit;

    if level != IsolationLevel::Low {
        host_config.security_opt = Some(vec!["no-new-privileges:true".to_string()]);
    }
    if level == IsolationLevel::High && kind == ServiceKind::App {
        host_config.cap_drop = Some(vec!["ALL".to_string()]);
    }

    Ok(())
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64, RuntimeError> {
    let invalid = || RuntimeError::container_failed(format!("Invalid memory limit: {limit}"));
    let lower = limit.to_lowercase();

    if let Some(num) = lower.strip_suffix('g') {
        let gigs: i64 = num.parse().map_err(|_| invalid())?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = lower.strip_suffix('m') {
        let megs: i64 = num.parse().map_err(|_| invalid())?;
        Ok(megs * 1024 * 1024)
    } else {
        lower.parse().map_err(|_| invalid())
    }
}

/// Whether a resource created at `created` (unix seconds) is strictly older
/// than `cutoff`. Docker reports whole seconds, so the cutoff is truncated
/// the same way.
fn predates(created: Option<i64>, cutoff: DateTime<Utc>) -> bool {
    created.is_some_and(|secs| secs < cutoff.timestamp())
}

fn volume_created(volume: &Volume) -> Option<i64> {
    volume
        .created_at
        .as_deref()
        .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
        .map(|at| at.timestamp())
}

/// CPU usage between two samples, scaled by online CPUs like `docker stats`.
#[allow(clippy::cast_precision_loss)]
fn cpu_percent(total: u64, pre_total: u64, system: u64, pre_system: u64, cpus: u64) -> f64 {
    let cpu_delta = total.saturating_sub(pre_total) as f64;
    let system_delta = system.saturating_sub(pre_system) as f64;
    if system_delta <= 0.0 {
        return 0.0;
    }
    cpu_delta / system_delta * cpus as f64 * 100.0
}
