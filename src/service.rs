//! Service definitions and runtime status types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::engine::ContainerEngine;
use crate::error::EngineError;

/// Stop timeout used when a definition does not set one.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Kind of a container mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

/// One mount of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    /// Host path for binds, volume name for volumes, empty for tmpfs.
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl MountSpec {
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Volume,
            source: name.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn tmpfs(target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Tmpfs,
            source: String::new(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Container health check.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HealthCheck {
    /// Test command in engine form, e.g. `["CMD", "pg_isready"]`.
    pub test: Vec<String>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub start_period: Option<Duration>,
}

impl HealthCheck {
    /// `CMD` style check.
    pub fn cmd<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut test = vec!["CMD".to_string()];
        test.extend(args.into_iter().map(Into::into));
        Self {
            test,
            ..Default::default()
        }
    }

    /// `CMD-SHELL` style check.
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            test: vec!["CMD-SHELL".to_string(), command.into()],
            ..Default::default()
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn start_period(mut self, start_period: Duration) -> Self {
        self.start_period = Some(start_period);
        self
    }
}

/// Work performed once a container has passed its health gate.
#[async_trait]
pub trait PostStartHook: Send + Sync {
    async fn after_start(
        &self,
        engine: Arc<dyn ContainerEngine>,
        container_id: &str,
    ) -> Result<(), EngineError>;
}

/// Declarative template for one container.
#[derive(Clone)]
pub struct ServiceDefinition {
    /// Full container name, already namespaced.
    pub name: String,
    pub image: String,
    pub aliases: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub ports: Vec<u16>,
    pub healthcheck: Option<HealthCheck>,
    pub stop_signal: Option<String>,
    pub stop_timeout: Option<Duration>,
    pub post_start: Option<Arc<dyn PostStartHook>>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            aliases: Vec::new(),
            entrypoint: None,
            cmd: None,
            env: Vec::new(),
            labels: HashMap::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            healthcheck: None,
            stop_signal: None,
            stop_timeout: None,
            post_start: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn entrypoint<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn cmd<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn env(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn mount(mut self, mount: MountSpec) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn healthcheck(mut self, check: HealthCheck) -> Self {
        self.healthcheck = Some(check);
        self
    }

    pub fn stop_signal(mut self, signal: impl Into<String>) -> Self {
        self.stop_signal = Some(signal.into());
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    pub fn post_start(mut self, hook: impl PostStartHook + 'static) -> Self {
        self.post_start = Some(Arc::new(hook));
        self
    }

    /// Effective stop timeout.
    pub fn effective_stop_timeout(&self) -> Duration {
        self.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT)
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Env values routinely carry secrets; only the keys are shown.
        let env_keys: Vec<&str> = self
            .env
            .iter()
            .map(|kv| kv.split_once('=').map_or(kv.as_str(), |(k, _)| k))
            .collect();
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("image", &self.image)
            .field("aliases", &self.aliases)
            .field("env", &env_keys)
            .field("mounts", &self.mounts)
            .field("ports", &self.ports)
            .field("healthcheck", &self.healthcheck)
            .field("stop_signal", &self.stop_signal)
            .field("stop_timeout", &self.stop_timeout)
            .field("post_start", &self.post_start.is_some())
            .finish_non_exhaustive()
    }
}

/// Index of a service inside an orchestrator, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub(crate) usize);

impl ServiceId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Registered, not yet processed by `run`.
    Defined,
    Created,
    Started,
    Healthy,
    /// Post-start hook done and streams attached.
    Running,
    /// The container exited on its own with this code.
    Exited(i64),
    Failed,
    Stopped,
    Removed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Defined => write!(f, "defined"),
            ServiceState::Created => write!(f, "created"),
            ServiceState::Started => write!(f, "started"),
            ServiceState::Healthy => write!(f, "healthy"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Exited(code) => write!(f, "exited({})", code),
            ServiceState::Failed => write!(f, "failed"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Removed => write!(f, "removed"),
        }
    }
}

/// Point-in-time view of a managed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub id: ServiceId,
    pub name: String,
    pub container_id: Option<String>,
    pub state: ServiceState,
}
