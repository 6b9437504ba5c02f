//! Network bootstrap.

use crate::engine::{ContainerEngine, NetworkSpec, NetworkSummary};
use crate::error::OrchestratorError;

/// Find the network called `name`, creating it if absent.
///
/// Existing networks are never modified or deleted. More than one network
/// with the same name is an error rather than a guess.
pub async fn ensure_network(
    engine: &dyn ContainerEngine,
    name: &str,
) -> Result<NetworkSummary, OrchestratorError> {
    let networks = list(engine, name).await?;
    let mut networks = match networks.len() {
        0 => {
            tracing::info!(network = %name, "Creating network");
            engine
                .create_network(&NetworkSpec::bridge(name))
                .await
                .map_err(|e| network_error(name, e))?;
            list(engine, name).await?
        }
        _ => networks,
    };

    match networks.len() {
        0 => Err(OrchestratorError::Network {
            network: name.to_string(),
            reason: "network not found after creation".to_string(),
        }),
        1 => {
            let network = networks.remove(0);
            tracing::debug!(network = %network.name, id = %network.id, "Using network");
            Ok(network)
        }
        n => Err(OrchestratorError::Network {
            network: name.to_string(),
            reason: format!("ambiguous name, {} networks match", n),
        }),
    }
}

async fn list(
    engine: &dyn ContainerEngine,
    name: &str,
) -> Result<Vec<NetworkSummary>, OrchestratorError> {
    engine
        .list_networks(name)
        .await
        .map_err(|e| network_error(name, e))
}

fn network_error(name: &str, e: impl ToString) -> OrchestratorError {
    OrchestratorError::Network {
        network: name.to_string(),
        reason: e.to_string(),
    }
}
