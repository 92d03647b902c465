//! In-memory runtime for testing.
//!
//! Tracks which sandboxes have containers and volumes, records every call,
//! and can be told to fail or never become ready for chosen sandboxes.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;

use super::{
    ContainerRuntime, ContainerState, LogLine, LogOptions, LogStream, PruneReport, ResourceUsage,
    RuntimeError, RuntimeStatus,
};
use crate::environment::{container_name, EnvironmentDescriptor, ServiceKind};

#[derive(Debug, Default)]
struct FakeState {
    /// Sandbox id to whether its containers are running.
    containers: BTreeMap<String, bool>,
    volumes: BTreeSet<String>,
    /// When each sandbox's resources were first created.
    created: BTreeMap<String, DateTime<Utc>>,
    networks: BTreeSet<String>,
    calls: Vec<String>,
}

/// A fake container runtime that keeps everything in memory.
#[derive(Debug, Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
    never_ready: bool,
    failing_up: HashSet<String>,
    failing_teardown: HashSet<String>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Containers start but never pass their healthcheck.
    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    /// `up` fails for this sandbox.
    pub fn failing_up(mut self, id: &str) -> Self {
        self.failing_up.insert(id.to_string());
        self
    }

    /// `teardown_volumes` fails for this sandbox.
    pub fn failing_teardown(mut self, id: &str) -> Self {
        self.failing_teardown.insert(id.to_string());
        self
    }

    /// Pretend containers and volumes exist for a sandbox nobody registered.
    pub fn with_orphan(self, id: &str) -> Self {
        self.with_unregistered(id, Utc::now() - Duration::hours(1))
    }

    /// Like `with_orphan`, but created after any sweep that starts now.
    pub fn with_recent_orphan(self, id: &str) -> Self {
        self.with_unregistered(id, Utc::now() + Duration::hours(1))
    }

    fn with_unregistered(self, id: &str, created: DateTime<Utc>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.containers.insert(id.to_string(), false);
            state.volumes.insert(id.to_string());
            state.created.insert(id.to_string(), created);
        }
        self
    }

    /// Every call made so far, as `op:sandbox`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .copied()
            .unwrap_or(false)
    }

    pub fn has_containers(&self, id: &str) -> bool {
        self.state.lock().unwrap().containers.contains_key(id)
    }

    pub fn has_volumes(&self, id: &str) -> bool {
        self.state.lock().unwrap().volumes.contains(id)
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.iter().cloned().collect()
    }

    fn record(&self, op: &str, id: &str) {
        self.state.lock().unwrap().calls.push(format!("{op}:{id}"));
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("network", name);
        self.state.lock().unwrap().networks.insert(name.to_string());
        Ok(())
    }

    async fn up(&self, descriptor: &EnvironmentDescriptor) -> Result<(), RuntimeError> {
        let id = &descriptor.sandbox_id;
        self.record("up", id);
        if self.failing_up.contains(id) {
            return Err(RuntimeError::container_failed(format!(
                "Failed to create sbx-{id}-app: port is already allocated"
            )));
        }

        let mut state = self.state.lock().unwrap();
        state.containers.insert(id.clone(), true);
        state.volumes.insert(id.clone());
        state.created.entry(id.clone()).or_insert_with(Utc::now);
        Ok(())
    }

    async fn down(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        self.record("down", sandbox_id);
        if let Some(running) = self.state.lock().unwrap().containers.get_mut(sandbox_id) {
            *running = false;
        }
        Ok(())
    }

    async fn status(&self, sandbox_id: &str) -> Result<RuntimeStatus, RuntimeError> {
        let running = self.state.lock().unwrap().containers.get(sandbox_id).copied();
        let containers = match running {
            None => Vec::new(),
            Some(running) => ServiceKind::ALL
                .iter()
                .map(|kind| ContainerState {
                    name: container_name(sandbox_id, *kind),
                    service: kind.to_string(),
                    state: if running { "running" } else { "exited" }.to_string(),
                    status: match (running, self.never_ready) {
                        (true, true) => "Up 1 second (health: starting)",
                        (true, false) => "Up 1 second (healthy)",
                        (false, _) => "Exited (0) 1 second ago",
                    }
                    .to_string(),
                })
                .collect(),
        };
        Ok(RuntimeStatus::from_containers(containers))
    }

    async fn teardown_volumes(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        self.record("teardown", sandbox_id);
        if self.failing_teardown.contains(sandbox_id) {
            return Err(RuntimeError::volume_failed(format!(
                "sbx-{sandbox_id}-db-data: volume is in use"
            )));
        }

        let mut state = self.state.lock().unwrap();
        state.containers.remove(sandbox_id);
        state.volumes.remove(sandbox_id);
        state.created.remove(sandbox_id);
        Ok(())
    }

    async fn prune_orphans(
        &self,
        live_ids: &[String],
        _network: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<PruneReport, RuntimeError> {
        self.record("prune", &live_ids.join(","));
        let mut state = self.state.lock().unwrap();
        let mut report = PruneReport::default();
        let sweepable = |state: &FakeState, id: &String| {
            !live_ids.contains(id) && state.created.get(id).is_some_and(|at| *at < cutoff)
        };

        let orphans: Vec<String> = state
            .containers
            .keys()
            .filter(|&id| sweepable(&*state, id))
            .cloned()
            .collect();
        for id in orphans {
            state.containers.remove(&id);
            report.containers.push(container_name(&id, ServiceKind::App));
        }

        let orphans: Vec<String> = state
            .volumes
            .iter()
            .filter(|&id| sweepable(&*state, id))
            .cloned()
            .collect();
        for id in orphans {
            state.volumes.remove(&id);
            state.created.remove(&id);
            report.volumes.push(format!("sbx-{id}-db-data"));
        }

        Ok(report)
    }

    async fn resource_usage(&self, sandbox_id: &str) -> Result<Vec<ResourceUsage>, RuntimeError> {
        if !self.is_running(sandbox_id) {
            return Ok(Vec::new());
        }
        Ok(ServiceKind::ALL
            .iter()
            .map(|kind| ResourceUsage {
                container: container_name(sandbox_id, *kind),
                cpu_percent: 1.5,
                memory_bytes: 64 * 1024 * 1024,
                memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            })
            .collect())
    }

    async fn logs(
        &self,
        sandbox_id: &str,
        service: Option<ServiceKind>,
        options: LogOptions,
    ) -> Result<LogStream, RuntimeError> {
        self.record("logs", sandbox_id);
        if !self.has_containers(sandbox_id) {
            return Err(RuntimeError::container_failed(format!(
                "Sandbox {sandbox_id} has no containers"
            )));
        }

        let kinds: Vec<ServiceKind> = service.map_or_else(|| ServiceKind::ALL.to_vec(), |k| vec![k]);
        let mut lines: Vec<Result<LogLine, RuntimeError>> = kinds
            .into_iter()
            .map(|kind| {
                Ok(LogLine {
                    service: kind.to_string(),
                    stderr: false,
                    message: format!("{kind} ready\n"),
                })
            })
            .collect();
        if let Some(tail) = options.tail {
            let keep = usize::try_from(tail).unwrap_or(usize::MAX);
            let skip = lines.len().saturating_sub(keep);
            lines.drain(..skip);
        }

        Ok(futures_util::stream::iter(lines).boxed())
    }
}
