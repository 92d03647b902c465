//! Typed errors raised by container runtime adapters.
//!
//! Callers match on the failure mode instead of parsing the daemon's
//! message strings.

/// Errors that can occur while driving the container runtime.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RuntimeError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Container image was not found and could not be pulled.
    #[error("Container image not found: {image}")]
    ImageNotFound { image: String },

    /// Container operation failed (create, start, stop, remove, ...).
    #[error("Container operation failed: {message}")]
    ContainerFailed { message: String },

    /// Bridge network could not be inspected or created.
    #[error("Network setup failed: {message}")]
    NetworkSetupFailed { message: String },

    /// Volume could not be created, listed or removed.
    #[error("Volume operation failed: {message}")]
    VolumeFailed { message: String },
}

impl RuntimeError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `ImageNotFound` error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound {
            image: image.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Creates a `NetworkSetupFailed` error.
    pub fn network_setup_failed(message: impl Into<String>) -> Self {
        Self::NetworkSetupFailed {
            message: message.into(),
        }
    }

    /// Creates a `VolumeFailed` error.
    pub fn volume_failed(message: impl Into<String>) -> Self {
        Self::VolumeFailed {
            message: message.into(),
        }
    }

    /// Returns true if this is a Docker unavailability error.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }
}
