//! Domain errors for fleet operations.
//!
//! Every lifecycle and fleet operation returns one of these so callers can
//! branch on the failure category. Runtime failures are wrapped, not
//! flattened, so the daemon's message survives.

use std::path::Path;
use std::time::Duration;

use crate::registry::SandboxStatus;
use crate::runtime::RuntimeError;

/// Errors produced by the registry, allocator and lifecycle controller.
#[derive(Debug, thiserror::Error)]
pub(crate) enum FleetError {
    /// Malformed input such as an empty id or unknown sandbox type.
    #[error("Invalid input: {message}")]
    Validation { message: String },

    /// A sandbox with this id is already registered.
    #[error("Sandbox already exists: {id}")]
    DuplicateSandbox { id: String },

    /// The fleet already holds the maximum number of sandboxes.
    #[error("Fleet is at capacity ({max} sandboxes)")]
    CapacityExceeded { max: usize },

    /// No free port block was found in the scan range.
    #[error("No free port block available between {start} and {end}")]
    PortExhaustion { start: u16, end: u16 },

    /// No sandbox with this id is registered.
    #[error("Sandbox not found: {id}")]
    NotFound { id: String },

    /// Containers did not report ready before the startup deadline.
    #[error("Sandbox {id} did not become ready within {timeout_secs} seconds")]
    ContainerStartTimeout { id: String, timeout_secs: u64 },

    /// The registry lock could not be obtained; retry the whole operation.
    #[error("Registry is busy: {message}")]
    RegistryConflict { message: String },

    /// The requested status change is not allowed from the current status.
    #[error("Cannot move sandbox {id} from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SandboxStatus,
        to: SandboxStatus,
    },

    /// A mutation would break a registry invariant; nothing was written.
    #[error("Registry invariant violated: {message}")]
    InvariantViolation { message: String },

    /// The registry file on disk could not be parsed or is inconsistent.
    #[error("Registry file {path} is corrupt: {message}")]
    RegistryCorrupt { path: String, message: String },

    /// Filesystem access for registry or descriptor files failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The container runtime rejected an operation.
    #[error(transparent)]
    Adapter(#[from] RuntimeError),
}

impl FleetError {
    /// Creates a `Validation` error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a `DuplicateSandbox` error.
    pub fn duplicate(id: impl Into<String>) -> Self {
        Self::DuplicateSandbox { id: id.into() }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a `ContainerStartTimeout` error from a `Duration`.
    pub fn start_timeout(id: impl Into<String>, timeout: Duration) -> Self {
        Self::ContainerStartTimeout {
            id: id.into(),
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Creates a `RegistryConflict` error.
    pub fn registry_conflict(message: impl Into<String>) -> Self {
        Self::RegistryConflict {
            message: message.into(),
        }
    }

    /// Creates an `InvariantViolation` error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates a `RegistryCorrupt` error for the file at `path`.
    pub fn corrupt(path: &Path, message: impl Into<String>) -> Self {
        Self::RegistryCorrupt {
            path: path.display().to_string(),
            message: message.into(),
        }
    }

    /// Wraps an IO error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns true if this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a `DuplicateSandbox` error.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateSandbox { .. })
    }

    /// Returns true if this is a `CapacityExceeded` error.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }

    /// Returns true if this is a `ContainerStartTimeout` error.
    pub fn is_start_timeout(&self) -> bool {
        matches!(self, Self::ContainerStartTimeout { .. })
    }

    /// Returns true if this is a `Validation` error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
