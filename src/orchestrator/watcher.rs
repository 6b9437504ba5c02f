//! Exit watchers.
//!
//! One task per started container. A watcher only observes: it never
//! restarts, stops or removes anything. Outcomes travel back to the
//! orchestrator over a channel and are applied under its lock.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

use crate::engine::{ContainerEngine, short_id};
use crate::error::EngineError;
use crate::service::ServiceId;

/// What a watcher observed.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Exited { id: ServiceId, exit_code: i64 },
    WaitFailed { id: ServiceId, error: EngineError },
}

/// Spawn a watcher for `container_id`.
///
/// The watcher ends when the container stops running, when waiting fails,
/// or when either token is cancelled. The task inherits the current
/// subscriber.
pub fn spawn_exit_watcher(
    engine: Arc<dyn ContainerEngine>,
    id: ServiceId,
    service: String,
    container_id: String,
    events: UnboundedSender<ServiceEvent>,
    shutdown: CancellationToken,
    caller: CancellationToken,
) -> JoinHandle<()> {
    let container = short_id(&container_id);
    let task = async move {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(service = %service, container = %container, "Exit watcher stopped by shutdown");
            }
            _ = caller.cancelled() => {
                tracing::debug!(service = %service, container = %container, "Exit watcher cancelled");
            }
            result = engine.wait_container(&container_id) => match result {
                Ok(exit_code) => {
                    tracing::warn!(service = %service, container = %container, exit_code, "Container exited");
                    let _ = events.send(ServiceEvent::Exited { id, exit_code });
                }
                Err(error) => {
                    tracing::error!(service = %service, container = %container, error = %error, "Failed waiting for container");
                    let _ = events.send(ServiceEvent::WaitFailed { id, error });
                }
            },
        }
    };
    tokio::spawn(task.with_current_subscriber())
}
