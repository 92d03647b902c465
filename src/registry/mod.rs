//! Sandbox records and the registry that owns them.
//!
//! The registry is the single source of truth for which sandboxes exist and
//! which host ports they hold. `RegistryStore::commit` is the only write
//! path; it checks [`Registry::validate`] before anything reaches disk.

mod store;

pub(crate) use store::RegistryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use crate::error::FleetError;

/// Number of consecutive host ports reserved for each sandbox.
pub(crate) const BLOCK_SIZE: u16 = 7;

/// Kind of application runtime a sandbox is built around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SandboxType {
    Nodejs,
    Python,
    React,
    Api,
}

impl std::fmt::Display for SandboxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nodejs => write!(f, "nodejs"),
            Self::Python => write!(f, "python"),
            Self::React => write!(f, "react"),
            Self::Api => write!(f, "api"),
        }
    }
}

impl std::str::FromStr for SandboxType {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nodejs" | "node" => Ok(Self::Nodejs),
            "python" => Ok(Self::Python),
            "react" => Ok(Self::React),
            "api" => Ok(Self::Api),
            _ => Err(FleetError::validation(format!(
                "Unknown sandbox type: '{s}'. Supported: nodejs, python, react, api"
            ))),
        }
    }
}

/// Isolation requested for a sandbox; interpreted only by the runtime adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum IsolationLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(FleetError::validation(format!(
                "Unknown isolation level: '{s}'. Supported: low, medium, high"
            ))),
        }
    }
}

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SandboxStatus {
    Creating,
    Running,
    Stopped,
    Failed,
    Removed,
}

impl SandboxStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Running | Self::Failed)
                | (Self::Running, Self::Stopped)
                | (Self::Stopped, Self::Running)
                | (Self::Running | Self::Stopped | Self::Failed, Self::Removed)
        )
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Contiguous block of host ports starting at `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortBlock {
    pub base: u16,
}

impl PortBlock {
    /// Returns `None` when the block would run past the last valid port.
    pub fn new(base: u16) -> Option<Self> {
        base.checked_add(BLOCK_SIZE - 1).map(|_| Self { base })
    }

    pub fn last(self) -> u16 {
        self.base + (BLOCK_SIZE - 1)
    }

    pub fn ports(self) -> RangeInclusive<u16> {
        self.base..=self.last()
    }
}

/// A managed environment and the resources it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Sandbox {
    pub id: String,
    pub project_name: String,
    pub sandbox_type: SandboxType,
    pub isolation_level: IsolationLevel,
    pub base_port: u16,
    pub project_path: PathBuf,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
}

impl Sandbox {
    /// The port block recorded for this sandbox.
    pub fn block(&self) -> Option<PortBlock> {
        PortBlock::new(self.base_port)
    }
}

/// Durable fleet state: sandboxes, their port reservations and the
/// allocation watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Registry {
    /// Bumped on every committed change.
    #[serde(default)]
    pub version: u64,
    /// Where the next port block search starts. Never rewinds.
    #[serde(default)]
    pub next_candidate_port: u16,
    #[serde(default)]
    pub sandboxes: BTreeMap<String, Sandbox>,
    #[serde(default)]
    pub port_allocation: BTreeMap<u16, String>,
    /// Secret mixed into every derived credential. Assigned on the first
    /// write and never changed afterwards, since database volumes keep the
    /// password they were created with.
    #[serde(default)]
    pub credential_seed: String,
}

impl Registry {
    pub fn get(&self, id: &str) -> Option<&Sandbox> {
        self.sandboxes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sandboxes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }

    pub fn is_port_reserved(&self, port: u16) -> bool {
        self.port_allocation.contains_key(&port)
    }

    /// Register a sandbox and reserve its whole port block.
    pub fn insert(&mut self, sandbox: Sandbox) {
        if let Some(block) = sandbox.block() {
            for port in block.ports() {
                self.port_allocation.insert(port, sandbox.id.clone());
            }
        }
        self.sandboxes.insert(sandbox.id.clone(), sandbox);
    }

    /// Drop a sandbox and release every port it held.
    pub fn remove(&mut self, id: &str) -> Option<Sandbox> {
        let removed = self.sandboxes.remove(id)?;
        self.port_allocation.retain(|_, owner| owner != id);
        Some(removed)
    }

    /// Move a sandbox to `status` if the state machine allows it.
    ///
    /// Setting the current status again is accepted and changes nothing.
    pub fn set_status(&mut self, id: &str, status: SandboxStatus) -> Result<Sandbox, FleetError> {
        let sandbox = self
            .sandboxes
            .get_mut(id)
            .ok_or_else(|| FleetError::not_found(id))?;

        if sandbox.status != status && !sandbox.status.can_transition_to(status) {
            return Err(FleetError::InvalidTransition {
                id: id.to_string(),
                from: sandbox.status,
                to: status,
            });
        }

        sandbox.status = status;
        Ok(sandbox.clone())
    }

    /// Check the structural invariants: keys match ids, blocks are in range
    /// and pairwise disjoint, and `port_allocation` mirrors the blocks exactly.
    pub fn validate(&self) -> Result<(), String> {
        let mut expected: BTreeMap<u16, &str> = BTreeMap::new();

        for (key, sandbox) in &self.sandboxes {
            if key.is_empty() {
                return Err("sandbox with empty id".to_string());
            }
            if key != &sandbox.id {
                return Err(format!("entry '{key}' holds sandbox '{}'", sandbox.id));
            }
            let block = sandbox.block().ok_or_else(|| {
                format!("sandbox '{key}' has base port {} past the port range", sandbox.base_port)
            })?;
            for port in block.ports() {
                if let Some(other) = expected.insert(port, key) {
                    return Err(format!(
                        "port {port} is claimed by both '{other}' and '{key}'"
                    ));
                }
            }
        }

        if expected.len() != self.port_allocation.len() {
            return Err(format!(
                "port allocation lists {} ports but sandboxes hold {}",
                self.port_allocation.len(),
                expected.len()
            ));
        }
        for (port, owner) in &self.port_allocation {
            match expected.get(port) {
                Some(holder) if *holder == owner.as_str() => {}
                Some(holder) => {
                    return Err(format!(
                        "port {port} is allocated to '{owner}' but belongs to '{holder}'"
                    ))
                }
                None => return Err(format!("port {port} is allocated to '{owner}' outside any block")),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sandbox_fixture(id: &str, base_port: u16, status: SandboxStatus) -> Sandbox {
    Sandbox {
        id: id.to_string(),
        project_name: format!("{id}-project"),
        sandbox_type: SandboxType::Nodejs,
        isolation_level: IsolationLevel::Medium,
        base_port,
        project_path: PathBuf::from(format!("/tmp/projects/{id}")),
        status,
        created_at: Utc::now(),
    }
}
