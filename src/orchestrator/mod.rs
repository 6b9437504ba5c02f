//! Lifecycle orchestrator for the platform's containers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    Orchestrator                        │
//! │                                                        │
//! │  run()   network ─► per service, in order:             │
//! │            pull ─► create ─► start ─► watch            │
//! │            ─► health gate ─► post-start ─► attach      │
//! │                                                        │
//! │  stop()  per service, in reverse:                      │
//! │            detach ─► stop (bounded) ─► remove          │
//! │                                                        │
//! │  watchers ──ServiceEvent──► drained under the lock     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! All state sits behind one async mutex held for the whole of each `run`
//! and `stop`. Background tasks only hold a [`ServiceId`] and a container id.

pub mod health;
pub mod network;
pub mod watcher;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Dispatch;
use tracing::instrument::WithSubscriber;

use crate::config::Config;
use crate::engine::{
    AttachHandle, ContainerEngine, ContainerSpec, DockerEngine, NetworkSummary, PROJECT_LABEL,
    short_id,
};
use crate::error::{EngineError, OrchestratorError};
use crate::service::{ServiceDefinition, ServiceId, ServiceState, ServiceStatus};

pub use self::health::{HEALTH_POLL_INTERVAL, wait_healthy};
pub use self::network::ensure_network;
pub use self::watcher::ServiceEvent;

/// Slack added on top of a service's stop timeout before giving up on it.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// What `run` does with already started services when a later one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialFailurePolicy {
    /// Leave earlier services up; the caller decides when to `stop`.
    #[default]
    LeaveRunning,
    /// Tear everything down before returning the error.
    StopAll,
}

struct ManagedService {
    definition: ServiceDefinition,
    container_id: Option<String>,
    attach: Option<AttachHandle>,
    watcher: Option<JoinHandle<()>>,
    state: ServiceState,
}

impl ManagedService {
    fn new(definition: ServiceDefinition) -> Self {
        Self {
            definition,
            container_id: None,
            attach: None,
            watcher: None,
            state: ServiceState::Defined,
        }
    }
}

struct State {
    network: Option<NetworkSummary>,
    services: Vec<ManagedService>,
    events_tx: UnboundedSender<ServiceEvent>,
    events_rx: UnboundedReceiver<ServiceEvent>,
    shutdown: CancellationToken,
    stopped: bool,
}

impl State {
    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                ServiceEvent::Exited { id, exit_code } => {
                    if let Some(service) = self.services.get_mut(id.index()) {
                        service.state = ServiceState::Exited(exit_code);
                    }
                }
                ServiceEvent::WaitFailed { id, .. } => {
                    if let Some(service) = self.services.get_mut(id.index()) {
                        service.state = ServiceState::Failed;
                    }
                }
            }
        }
    }
}

/// Brings a set of services up in order and tears them down in reverse.
pub struct Orchestrator {
    config: Arc<Config>,
    engine: Arc<dyn ContainerEngine>,
    logger: Dispatch,
    policy: PartialFailurePolicy,
    state: Mutex<State>,
}

impl Orchestrator {
    /// Create an orchestrator over an existing engine.
    ///
    /// All logging from the orchestrator and its background tasks goes to
    /// `logger`; no global subscriber is consulted.
    pub fn new(config: Arc<Config>, engine: Arc<dyn ContainerEngine>, logger: Dispatch) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            engine,
            logger,
            policy: PartialFailurePolicy::default(),
            state: Mutex::new(State {
                network: None,
                services: Vec::new(),
                events_tx,
                events_rx,
                shutdown: CancellationToken::new(),
                stopped: false,
            }),
        }
    }

    /// Connect to the local Docker engine and create an orchestrator.
    pub async fn connect(config: Arc<Config>, logger: Dispatch) -> Result<Self, OrchestratorError> {
        let engine = DockerEngine::connect()
            .with_subscriber(logger.clone())
            .await
            .map_err(OrchestratorError::Engine)?;
        Ok(Self::new(config, Arc::new(engine), logger))
    }

    pub fn with_partial_failure_policy(mut self, policy: PartialFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Register a service. It is processed by the next `run`.
    pub async fn add_service(&self, definition: ServiceDefinition) -> ServiceId {
        let mut state = self.state.lock().await;
        let id = ServiceId(state.services.len());
        state.services.push(ManagedService::new(definition));
        id
    }

    /// Register several services, preserving their order.
    pub async fn add_services<I>(&self, definitions: I) -> Vec<ServiceId>
    where
        I: IntoIterator<Item = ServiceDefinition>,
    {
        let mut state = self.state.lock().await;
        definitions
            .into_iter()
            .map(|definition| {
                let id = ServiceId(state.services.len());
                state.services.push(ManagedService::new(definition));
                id
            })
            .collect()
    }

    /// Snapshot of every registered service.
    pub async fn services(&self) -> Vec<ServiceStatus> {
        let mut state = self.state.lock().await;
        state.drain_events();
        state
            .services
            .iter()
            .enumerate()
            .map(|(index, service)| ServiceStatus {
                id: ServiceId(index),
                name: service.definition.name.clone(),
                container_id: service.container_id.clone(),
                state: service.state,
            })
            .collect()
    }

    /// The platform network, once bootstrapped.
    pub async fn network(&self) -> Option<NetworkSummary> {
        self.state.lock().await.network.clone()
    }

    /// Bring up every service still in the `defined` state.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), OrchestratorError> {
        self.run_inner(cancel, false)
            .with_subscriber(self.logger.clone())
            .await
    }

    /// Like [`run`](Self::run), but first removes any existing container
    /// with the same name as the one about to be created.
    pub async fn run_forcefully(&self, cancel: &CancellationToken) -> Result<(), OrchestratorError> {
        self.run_inner(cancel, true)
            .with_subscriber(self.logger.clone())
            .await
    }

    /// Tear everything down in reverse registration order.
    ///
    /// Failures are logged, never returned. The orchestrator is inert
    /// afterwards.
    pub async fn stop(&self) {
        async {
            let mut state = self.state.lock().await;
            self.teardown(&mut state).await;
        }
        .with_subscriber(self.logger.clone())
        .await
    }

    async fn run_inner(
        &self,
        cancel: &CancellationToken,
        forceful: bool,
    ) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(OrchestratorError::Stopped);
        }
        state.drain_events();

        let network = if let Some(network) = state.network.clone() {
            network
        } else {
            let network =
                ensure_network(self.engine.as_ref(), self.config.platform_namespace()).await?;
            state.network = Some(network.clone());
            network
        };

        let pending: Vec<usize> = state
            .services
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == ServiceState::Defined)
            .map(|(index, _)| index)
            .collect();

        tracing::info!(
            platform = %self.config.platform_namespace(),
            services = pending.len(),
            forceful,
            "Starting services"
        );

        for index in pending {
            if let Err(e) = self
                .provision(&mut state, index, &network, cancel, forceful)
                .await
            {
                state.services[index].state = ServiceState::Failed;
                tracing::error!(
                    service = %state.services[index].definition.name,
                    error = %e,
                    "Failed to bring up service"
                );
                if self.policy == PartialFailurePolicy::StopAll {
                    self.teardown(&mut state).await;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn provision(
        &self,
        state: &mut State,
        index: usize,
        network: &NetworkSummary,
        cancel: &CancellationToken,
        forceful: bool,
    ) -> Result<(), OrchestratorError> {
        let definition = state.services[index].definition.clone();
        let service = definition.name.as_str();
        let engine = self.engine.as_ref();

        tracing::info!(service = %service, image = %definition.image, "Pulling image");
        cancellable(cancel, service, async {
            engine
                .pull_image(&definition.image)
                .await
                .map_err(|source| OrchestratorError::PullFailed {
                    service: service.to_string(),
                    source,
                })
        })
        .await?;

        if forceful {
            match engine.remove_container(service).await {
                Ok(()) => tracing::debug!(service = %service, "Removed existing container"),
                Err(e) => tracing::debug!(service = %service, error = %e, "No existing container removed"),
            }
        }

        let spec = self.container_spec(&definition, network);
        let container_id = cancellable(cancel, service, async {
            engine
                .create_container(&spec)
                .await
                .map_err(|source| OrchestratorError::ContainerCreationFailed {
                    service: service.to_string(),
                    source,
                })
        })
        .await?;
        let container = short_id(&container_id);
        state.services[index].container_id = Some(container_id.clone());
        state.services[index].state = ServiceState::Created;
        tracing::debug!(service = %service, container = %container, "Created container");

        cancellable(cancel, service, async {
            engine
                .start_container(&container_id)
                .await
                .map_err(|source| OrchestratorError::ContainerStartFailed {
                    service: service.to_string(),
                    source,
                })
        })
        .await?;
        state.services[index].state = ServiceState::Started;
        tracing::info!(service = %service, container = %container, "Started container");

        state.services[index].watcher = Some(watcher::spawn_exit_watcher(
            Arc::clone(&self.engine),
            ServiceId(index),
            service.to_string(),
            container_id.clone(),
            state.events_tx.clone(),
            state.shutdown.clone(),
            cancel.clone(),
        ));

        wait_healthy(engine, service, &container_id, cancel).await?;
        state.services[index].state = ServiceState::Healthy;

        if let Some(hook) = &definition.post_start {
            tracing::info!(service = %service, container = %container, "Running post-start hook");
            hook.after_start(Arc::clone(&self.engine), &container_id)
                .await
                .map_err(|source| OrchestratorError::PostStartFailed {
                    service: service.to_string(),
                    source,
                })?;
        }

        let debug_mode = self.config.global.debug_mode;
        let handle = cancellable(cancel, service, async {
            engine
                .attach(&container_id, debug_mode)
                .await
                .map_err(|source| OrchestratorError::AttachFailed {
                    service: service.to_string(),
                    container: container.clone(),
                    source,
                })
        })
        .await?;
        state.services[index].attach = Some(handle);
        state.services[index].state = ServiceState::Running;
        tracing::info!(service = %service, container = %container, "Service is running");
        Ok(())
    }

    fn container_spec(
        &self,
        definition: &ServiceDefinition,
        network: &NetworkSummary,
    ) -> ContainerSpec {
        let mut labels = definition.labels.clone();
        labels.insert(
            PROJECT_LABEL.to_string(),
            self.config.platform_namespace().to_string(),
        );
        ContainerSpec {
            name: definition.name.clone(),
            image: definition.image.clone(),
            entrypoint: definition.entrypoint.clone(),
            cmd: definition.cmd.clone(),
            env: definition.env.clone(),
            labels,
            mounts: definition.mounts.clone(),
            ports: definition.ports.clone(),
            network: network.name.clone(),
            aliases: definition.aliases.clone(),
            healthcheck: definition.healthcheck.clone(),
            stop_signal: definition.stop_signal.clone(),
            stop_timeout: definition.stop_timeout,
        }
    }

    async fn teardown(&self, state: &mut State) {
        state.stopped = true;
        state.shutdown.cancel();
        if state.services.is_empty() {
            return;
        }
        state.drain_events();

        let debug_mode = self.config.global.debug_mode;
        for service in state.services.iter_mut().rev() {
            let name = service.definition.name.clone();

            if let Some(watcher) = service.watcher.take()
                && let Err(e) = watcher.await
            {
                tracing::debug!(service = %name, error = %e, "Exit watcher ended abnormally");
            }
            if let Some(handle) = service.attach.take() {
                handle.close().await;
            }

            let Some(container_id) = service.container_id.clone() else {
                continue;
            };
            let container = short_id(&container_id);

            let timeout = service.definition.effective_stop_timeout();
            tracing::info!(service = %name, container = %container, "Stopping container");
            match tokio::time::timeout(
                timeout + STOP_GRACE,
                self.engine.stop_container(&container_id, timeout),
            )
            .await
            {
                Ok(Ok(())) => service.state = ServiceState::Stopped,
                Ok(Err(e)) => {
                    service.state = ServiceState::Failed;
                    tracing::warn!(service = %name, container = %container, error = %e, "Failed to stop container")
                }
                Err(_) => {
                    service.state = ServiceState::Failed;
                    tracing::warn!(service = %name, container = %container, "Timed out stopping container")
                }
            }

            if debug_mode {
                tracing::info!(service = %name, container = %container, "Debug mode, leaving container in place");
                continue;
            }

            match tokio::time::timeout(
                timeout + STOP_GRACE,
                self.engine.remove_container(&container_id),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(EngineError::RemovalInProgress { .. })) => {
                    tracing::debug!(service = %name, container = %container, "Removal already in progress");
                }
                Ok(Err(EngineError::NotFound(_))) => {
                    tracing::debug!(service = %name, container = %container, "Container already gone");
                }
                Ok(Err(e)) => {
                    service.state = ServiceState::Failed;
                    tracing::warn!(service = %name, container = %container, error = %e, "Failed to remove container (may require manual cleanup)");
                    continue;
                }
                Err(_) => {
                    service.state = ServiceState::Failed;
                    tracing::warn!(service = %name, container = %container, "Timed out removing container (may require manual cleanup)");
                    continue;
                }
            }
            service.container_id = None;
            service.state = ServiceState::Removed;
            tracing::info!(service = %name, container = %container, "Removed container");
        }
    }
}

/// Race `fut` against `cancel`, mapping cancellation to an error naming
/// `service`.
async fn cancellable<T, F>(
    cancel: &CancellationToken,
    service: &str,
    fut: F,
) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, OrchestratorError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled {
            service: service.to_string(),
        }),
        result = fut => result,
    }
}
