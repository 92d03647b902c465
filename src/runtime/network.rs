//! Shared bridge network management.

use std::collections::HashMap;

use bollard::network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use tracing::{debug, info, warn};

use super::docker::is_status;
use super::{RuntimeError, LABEL_MANAGED};

/// Network driver used for the shared sandbox network.
const DRIVER: &str = "bridge";

/// Create the bridge network `name` unless it already exists.
pub(super) async fn ensure(docker: &Docker, name: &str) -> Result<(), RuntimeError> {
    match docker
        .inspect_network(name, None::<InspectNetworkOptions<String>>)
        .await
    {
        Ok(_) => {
            debug!(network = name, "Network already exists");
            return Ok(());
        }
        Err(e) if is_status(&e, 404) => {}
        Err(e) => return Err(RuntimeError::network_setup_failed(e.to_string())),
    }

    let mut labels = HashMap::new();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

    match docker
        .create_network(CreateNetworkOptions {
            name: name.to_string(),
            driver: DRIVER.to_string(),
            labels,
            ..Default::default()
        })
        .await
    {
        Ok(_) => {
            info!(network = name, "Created sandbox network");
            Ok(())
        }
        // Lost a race with a concurrent create.
        Err(e) if is_status(&e, 409) => Ok(()),
        Err(e) => Err(RuntimeError::network_setup_failed(e.to_string())),
    }
}

/// Remove managed networks other than `keep`. Networks still in use are
/// skipped with a warning.
pub(super) async fn prune(docker: &Docker, keep: &str) -> Result<Vec<String>, RuntimeError> {
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec![format!("{LABEL_MANAGED}=true")]);

    let networks = docker
        .list_networks(Some(ListNetworksOptions { filters }))
        .await
        .map_err(|e| RuntimeError::network_setup_failed(e.to_string()))?;

    let mut removed = Vec::new();
    for name in networks.into_iter().filter_map(|n| n.name) {
        if name == keep {
            continue;
        }
        match docker.remove_network(&name).await {
            Ok(()) => removed.push(name),
            Err(e) => warn!(network = %name, "Could not remove orphaned network: {}", e),
        }
    }

    Ok(removed)
}
