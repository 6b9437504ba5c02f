//! Startup health gate.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::{ContainerEngine, HealthStatus, short_id};
use crate::error::OrchestratorError;

/// Delay between polls while a container reports `starting`.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Block until `container_id` is healthy or has no health check.
///
/// There is no upper bound on polls; a container stuck in `starting` holds
/// the caller until `cancel` fires.
pub async fn wait_healthy(
    engine: &dyn ContainerEngine,
    service: &str,
    container_id: &str,
    cancel: &CancellationToken,
) -> Result<(), OrchestratorError> {
    let container = short_id(container_id);
    let mut retry: u32 = 0;

    loop {
        let status = engine.inspect_health(container_id).await.map_err(|source| {
            OrchestratorError::HealthCheckFailed {
                service: service.to_string(),
                container: container.clone(),
                source,
            }
        })?;

        match status {
            HealthStatus::Healthy => {
                tracing::info!(service = %service, container = %container, retry, "Container is healthy");
                return Ok(());
            }
            HealthStatus::NoHealthcheck => {
                tracing::warn!(service = %service, container = %container, "Container has no health check");
                return Ok(());
            }
            HealthStatus::Unhealthy => {
                return Err(OrchestratorError::Unhealthy {
                    service: service.to_string(),
                    container,
                    retries: retry,
                });
            }
            HealthStatus::Unknown(status) => {
                return Err(OrchestratorError::UnhandledHealthStatus {
                    service: service.to_string(),
                    container,
                    status,
                });
            }
            HealthStatus::Starting => {
                tracing::debug!(service = %service, container = %container, retry, "Waiting for container to become healthy");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(OrchestratorError::Cancelled {
                            service: service.to_string(),
                        });
                    }
                    _ = tokio::time::sleep(HEALTH_POLL_INTERVAL) => {}
                }
                retry += 1;
            }
        }
    }
}
