//! Operations over the whole fleet: scale, list and cleanup.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::FleetError;
use crate::lifecycle::{validate_id, CreateRequest, LifecycleController};
use crate::registry::{IsolationLevel, Sandbox, SandboxStatus, SandboxType};
use crate::runtime::PruneReport;

/// Parameters for [`scale`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScaleRequest {
    pub count: usize,
    pub prefix: String,
    pub sandbox_type: SandboxType,
    pub isolation_level: IsolationLevel,
}

/// The create that stopped a scale run.
#[derive(Debug)]
pub(crate) struct ScaleFailure {
    pub id: String,
    pub error: FleetError,
}

/// Outcome of [`scale`]: everything created before the first failure.
#[derive(Debug, Default)]
pub(crate) struct ScaleReport {
    pub created: Vec<Sandbox>,
    pub failure: Option<ScaleFailure>,
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct SandboxSummary {
    pub id: String,
    pub project_name: String,
    pub sandbox_type: SandboxType,
    pub base_port: u16,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
}

/// What [`cleanup`] did.
#[derive(Debug, Default)]
pub(crate) struct CleanupReport {
    /// Stopped sandboxes whose containers and volumes were removed.
    pub torn_down: Vec<String>,
    /// Registry entries deleted (only with purge).
    pub purged: Vec<String>,
    pub pruned: PruneReport,
    pub warnings: Vec<String>,
}

/// Ids generated by `scale`: `prefix-001`, `prefix-002`, ...
pub(crate) fn scale_ids(prefix: &str, count: usize) -> impl Iterator<Item = String> + '_ {
    (1..=count).map(move |n| format!("{prefix}-{n:03}"))
}

/// Create `count` sandboxes one after another, pausing `delay` between
/// creates. Stops at the first failure without rolling back earlier ones.
pub(crate) async fn scale(
    controller: &LifecycleController,
    request: &ScaleRequest,
    delay: Duration,
) -> Result<ScaleReport, FleetError> {
    if request.count == 0 {
        return Err(FleetError::validation("Scale count must be at least 1"));
    }
    validate_id(&format!("{}-001", request.prefix))?;

    let existing = controller.registry()?.len();
    let max = controller.store().max_sandboxes();
    let fits = existing
        .checked_add(request.count)
        .is_some_and(|total| total <= max);
    if !fits {
        return Err(FleetError::CapacityExceeded { max });
    }

    info!(
        event = "scale_start",
        count = request.count,
        prefix = %request.prefix,
        existing,
    );

    let mut report = ScaleReport::default();
    for (i, id) in scale_ids(&request.prefix, request.count).enumerate() {
        if i > 0 && !delay.is_zero() {
            sleep(delay).await;
        }

        let create = CreateRequest {
            id: id.clone(),
            project_name: None,
            sandbox_type: request.sandbox_type,
            isolation_level: request.isolation_level,
        };
        match controller.create(&create).await {
            Ok(sandbox) => report.created.push(sandbox),
            Err(error) => {
                warn!(sandbox = %id, "Scale stopped: {}", error);
                report.failure = Some(ScaleFailure { id, error });
                break;
            }
        }
    }

    info!(
        event = "scale_finished",
        created = report.created.len(),
        failed = report.failure.is_some(),
    );
    Ok(report)
}

/// Every registered sandbox, ordered by id.
pub(crate) fn list(controller: &LifecycleController) -> Result<Vec<SandboxSummary>, FleetError> {
    Ok(controller
        .registry()?
        .sandboxes
        .into_values()
        .map(|s| SandboxSummary {
            id: s.id,
            project_name: s.project_name,
            sandbox_type: s.sandbox_type,
            base_port: s.base_port,
            status: s.status,
            created_at: s.created_at,
        })
        .collect())
}

/// Tear down containers and volumes of every stopped sandbox, then sweep
/// runtime resources that belong to no registered sandbox.
///
/// Stopped sandboxes stay registered unless `purge` is set. Per-sandbox
/// failures become warnings and never abort the rest.
pub(crate) async fn cleanup(
    controller: &LifecycleController,
    purge: bool,
) -> Result<CleanupReport, FleetError> {
    let registry = controller.registry()?;
    let runtime = controller.runtime();
    let mut report = CleanupReport::default();

    let stopped: Vec<String> = registry
        .sandboxes
        .values()
        .filter(|s| s.status == SandboxStatus::Stopped)
        .map(|s| s.id.clone())
        .collect();

    for id in stopped {
        match runtime.teardown_volumes(&id).await {
            Ok(()) => {
                info!(event = "sandbox_cleaned", sandbox = %id);
                report.torn_down.push(id);
            }
            Err(e) => {
                warn!(sandbox = %id, "Cleanup failed: {}", e);
                report.warnings.push(format!("{id}: {e}"));
            }
        }
    }

    if purge && !report.torn_down.is_empty() {
        match controller.purge_stopped(&report.torn_down) {
            Ok(purged) => report.purged = purged,
            Err(e) => {
                warn!("Could not purge registry entries: {}", e);
                report.warnings.push(format!("purge: {e}"));
            }
        }
    }

    // Taken before the registry read, so a sandbox registered after the
    // snapshot only owns resources newer than the cutoff.
    let cutoff = Utc::now();
    let live: Vec<String> = controller.registry()?.sandboxes.into_keys().collect();
    match runtime.prune_orphans(&live, controller.network(), cutoff).await {
        Ok(pruned) => report.pruned = pruned,
        Err(e) => {
            warn!("Orphan sweep failed: {}", e);
            report.warnings.push(format!("orphan sweep: {e}"));
        }
    }

    Ok(report)
}
