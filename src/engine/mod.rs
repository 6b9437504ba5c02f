//! Container engine seam.
//!
//! The orchestrator talks to the engine only through [`ContainerEngine`], a
//! narrow subset of the Docker Engine API. [`DockerEngine`] implements it on
//! top of `bollard`; tests substitute in-memory fakes.

mod docker;

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::service::{HealthCheck, MountSpec};

pub use self::docker::DockerEngine;

/// Subnet assigned to freshly created platform networks.
pub const NETWORK_SUBNET: &str = "172.30.0.0/16";

/// Label identifying the project a container belongs to.
pub const PROJECT_LABEL: &str = "com.docker.compose.project";

/// A network known to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
}

/// Parameters for a new network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: String,
    pub subnet: String,
    pub enable_ipv6: bool,
    pub attachable: bool,
    pub internal: bool,
}

impl NetworkSpec {
    /// Local bridge network with IPv4 and IPv6, attachable, not internal.
    pub fn bridge(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: "bridge".to_string(),
            subnet: NETWORK_SUBNET.to_string(),
            enable_ipv6: true,
            attachable: true,
            internal: false,
        }
    }
}

/// Everything needed to create one container.
///
/// Restart policy is always `no` and auto-remove is always off.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    /// Container ports published on 127.0.0.1 under the same number.
    pub ports: Vec<u16>,
    pub network: String,
    pub aliases: Vec<String>,
    pub healthcheck: Option<HealthCheck>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<Duration>,
}

/// Health as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// The container has no health check configured.
    NoHealthcheck,
    Starting,
    Healthy,
    Unhealthy,
    /// Anything else the engine reported, including an empty status.
    Unknown(String),
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::NoHealthcheck => write!(f, "none"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// Result of running a command inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub output: String,
}

type StdinWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A live attachment to a container's standard streams.
///
/// Owns the stdin writer and, when output is attached, the task forwarding
/// output to the log. Closing is explicit and idempotent via consumption.
pub struct AttachHandle {
    input: Option<StdinWriter>,
    forwarder: Option<JoinHandle<()>>,
}

impl AttachHandle {
    pub fn new(input: Option<StdinWriter>, forwarder: Option<JoinHandle<()>>) -> Self {
        Self { input, forwarder }
    }

    /// A handle holding nothing, for engines without stream support.
    pub fn noop() -> Self {
        Self::new(None, None)
    }

    /// Close stdin and stop forwarding output.
    pub async fn close(mut self) {
        if let Some(mut input) = self.input.take()
            && let Err(e) = input.shutdown().await
        {
            tracing::debug!(error = %e, "Failed to close container stdin");
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for AttachHandle {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl fmt::Debug for AttachHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachHandle")
            .field("stdin", &self.input.is_some())
            .field("forwarding", &self.forwarder.is_some())
            .finish()
    }
}

/// The subset of the container engine API the orchestrator relies on.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Networks whose name is exactly `name`.
    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkSummary>, EngineError>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError>;

    /// Pull `image`, draining the progress stream to completion.
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    async fn inspect_health(&self, id: &str) -> Result<HealthStatus, EngineError>;

    /// Block until the container is no longer running; returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    /// Attach stdin, and stdout/stderr when `with_output` is set.
    async fn attach(&self, id: &str, with_output: bool) -> Result<AttachHandle, EngineError>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Force-remove a container by id or name, including anonymous volumes.
    async fn remove_container(&self, id_or_name: &str) -> Result<(), EngineError>;

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput, EngineError>;
}

/// Run `cmd` in a container and return its output, failing on a non-zero
/// exit code.
pub async fn exec(
    engine: &dyn ContainerEngine,
    id: &str,
    cmd: Vec<String>,
) -> Result<String, EngineError> {
    let result = engine.exec(id, cmd).await?;
    if result.exit_code != 0 {
        return Err(EngineError::ExecFailed {
            exit_code: result.exit_code,
            output: result.output,
        });
    }
    Ok(result.output)
}

/// Abbreviated container id for log output.
pub fn short_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 8 {
        return id.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
