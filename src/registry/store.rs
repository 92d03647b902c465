//! Durable, lock-guarded persistence for the registry.
//!
//! Commits hold an exclusive `flock` on a sidecar lock file for the whole
//! load-mutate-validate-persist sequence. The registry file itself is only
//! ever replaced by renaming a fully written temp file over it, so readers
//! never need the lock.
//!
//! Waiting for the lock blocks the calling thread. Inside a multi-threaded
//! tokio runtime the wait runs under `block_in_place` so other tasks keep
//! being polled.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;
use uuid::Uuid;

use super::Registry;
use crate::config::FleetPaths;
use crate::error::FleetError;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Loads and commits the registry file under the fleet home.
#[derive(Debug, Clone)]
pub(crate) struct RegistryStore {
    registry_file: PathBuf,
    lock_file: PathBuf,
    max_sandboxes: usize,
    lock_timeout: Duration,
}

impl RegistryStore {
    pub fn new(paths: &FleetPaths, max_sandboxes: usize, lock_timeout: Duration) -> Self {
        Self {
            registry_file: paths.registry_file.clone(),
            lock_file: paths.lock_file.clone(),
            max_sandboxes,
            lock_timeout,
        }
    }

    pub fn max_sandboxes(&self) -> usize {
        self.max_sandboxes
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.registry_file
    }

    /// Read the current registry. A missing file is an empty registry.
    pub fn load(&self) -> Result<Registry, FleetError> {
        let content = match fs::read_to_string(&self.registry_file) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Registry::default()),
            Err(e) => {
                return Err(FleetError::io(
                    format!("Failed to read registry {}", self.registry_file.display()),
                    e,
                ))
            }
        };

        let registry: Registry = serde_json::from_str(&content)
            .map_err(|e| FleetError::corrupt(&self.registry_file, e.to_string()))?;
        registry
            .validate()
            .map_err(|message| FleetError::corrupt(&self.registry_file, message))?;

        Ok(registry)
    }

    /// Write an empty registry if none exists yet. Returns true if created.
    ///
    /// An existing registry, and the credential seed it carries, is left
    /// as it is.
    pub fn initialize(&self) -> Result<bool, FleetError> {
        if self.registry_file.exists() {
            self.load()?;
            return Ok(false);
        }
        wait_blocking(|| self.commit_inner(|_| Ok(()), true))?;
        Ok(true)
    }

    /// The registry's credential seed, assigning one if the registry on disk
    /// predates it.
    pub fn credential_seed(&self) -> Result<String, FleetError> {
        let registry = self.load()?;
        if !registry.credential_seed.is_empty() {
            return Ok(registry.credential_seed);
        }
        let (registry, ()) = wait_blocking(|| self.commit_inner(|_| Ok(()), true))?;
        Ok(registry.credential_seed)
    }

    /// Apply `mutate` to the latest registry and persist the result atomically.
    ///
    /// Nothing is written when `mutate` fails, when the result breaks an
    /// invariant, or when the result equals what was loaded.
    ///
    /// Blocks the calling thread for up to the lock timeout while another
    /// process holds the lock.
    pub fn commit<T, F>(&self, mutate: F) -> Result<(Registry, T), FleetError>
    where
        F: FnOnce(&mut Registry) -> Result<T, FleetError>,
    {
        wait_blocking(|| self.commit_inner(mutate, false))
    }

    fn commit_inner<T, F>(&self, mutate: F, force_write: bool) -> Result<(Registry, T), FleetError>
    where
        F: FnOnce(&mut Registry) -> Result<T, FleetError>,
    {
        if let Some(parent) = self.registry_file.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                FleetError::io(format!("Failed to create directory {}", parent.display()), e)
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)
            .map_err(|e| {
                FleetError::io(format!("Failed to open lock file {}", self.lock_file.display()), e)
            })?;
        let mut lock = fd_lock::RwLock::new(file);
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            match lock.try_write() {
                Ok(_guard) => return self.apply(mutate, force_write),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(FleetError::registry_conflict(format!(
                            "another operation held the registry lock for more than {:?}",
                            self.lock_timeout
                        )));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(FleetError::io("Failed to lock registry", e)),
            }
        }
    }

    /// Runs with the commit lock held.
    fn apply<T, F>(&self, mutate: F, force_write: bool) -> Result<(Registry, T), FleetError>
    where
        F: FnOnce(&mut Registry) -> Result<T, FleetError>,
    {
        let before = self.load()?;
        let mut working = before.clone();
        let output = mutate(&mut working)?;

        working.validate().map_err(FleetError::invariant)?;
        if !before.credential_seed.is_empty() && working.credential_seed != before.credential_seed {
            return Err(FleetError::invariant("credential seed cannot change once set"));
        }
        if working.len() > self.max_sandboxes && working.len() > before.len() {
            return Err(FleetError::CapacityExceeded {
                max: self.max_sandboxes,
            });
        }

        if working == before && !force_write {
            return Ok((working, output));
        }

        if working.credential_seed.is_empty() {
            working.credential_seed = Uuid::new_v4().simple().to_string();
        }

        working.version = before.version + 1;
        self.persist(&working)?;
        debug!(
            version = working.version,
            sandboxes = working.len(),
            "Registry committed"
        );

        Ok((working, output))
    }

    fn persist(&self, registry: &Registry) -> Result<(), FleetError> {
        let json = serde_json::to_string_pretty(registry)
            .map_err(|e| FleetError::io("Failed to serialize registry", io::Error::other(e)))?;

        let parent = self.registry_file.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(parent)
            .map_err(|e| FleetError::io("Failed to create temporary registry file", e))?;
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.flush())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| FleetError::io("Failed to write temporary registry file", e))?;
        tmp.persist(&self.registry_file).map_err(|e| {
            FleetError::io(
                format!("Failed to replace registry {}", self.registry_file.display()),
                e.error,
            )
        })?;

        Ok(())
    }
}

/// Run a blocking section without stalling the tokio worker it is called on.
fn wait_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
