//! `bollard`-backed container engine.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointSettings, HealthConfig, HealthStatusEnum, HostConfig, Ipam, IpamConfig, Mount,
    MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use regex::Regex;
use tokio_stream::StreamExt;
use tracing::instrument::WithSubscriber;

use crate::engine::{
    AttachHandle, ContainerEngine, ContainerSpec, ExecOutput, HealthStatus, NetworkSpec,
    NetworkSummary, short_id,
};
use crate::error::EngineError;
use crate::service::{HealthCheck, MountKind};

static REMOVAL_IN_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"removal of container \S+ is already in progress")
        .expect("removal pattern is valid")
});

/// Container engine speaking the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the ambient `DOCKER_HOST` convention and verify the
    /// daemon answers.
    pub async fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_defaults().map_err(|e| EngineError::Unavailable {
            reason: e.to_string(),
        })?;
        let engine = Self::from_client(docker);
        engine.probe().await?;
        Ok(engine)
    }

    /// Wrap an existing client without probing it.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn probe(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Unavailable {
                reason: e.to_string(),
            })?;

        match self.docker.version().await {
            Ok(version) => tracing::debug!(
                version = version.version.as_deref().unwrap_or("unknown"),
                api_version = version.api_version.as_deref().unwrap_or("unknown"),
                "Connected to container engine"
            ),
            Err(e) => tracing::debug!(error = %e, "Connected to container engine, version unavailable"),
        }
        Ok(())
    }
}

fn classify(operation: &'static str, target: &str, err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            ref message,
        } if REMOVAL_IN_PROGRESS.is_match(message) => EngineError::RemovalInProgress {
            container: target.to_string(),
        },
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(target.to_string()),
        other => EngineError::request(operation, other),
    }
}

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

fn health_config(check: &HealthCheck) -> HealthConfig {
    HealthConfig {
        test: Some(check.test.clone()),
        interval: check.interval.map(nanos),
        timeout: check.timeout.map(nanos),
        retries: check.retries.map(i64::from),
        start_period: check.start_period.map(nanos),
        start_interval: None,
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mounts = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.target.clone()),
            source: Some(m.source.clone()),
            typ: Some(match m.kind {
                MountKind::Bind => MountTypeEnum::BIND,
                MountKind::Volume => MountTypeEnum::VOLUME,
                MountKind::Tmpfs => MountTypeEnum::TMPFS,
            }),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &spec.ports {
        let key = format!("{}/tcp", port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(port.to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        mounts: (!mounts.is_empty()).then_some(mounts),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        network_mode: Some(spec.network.clone()),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            maximum_retry_count: None,
        }),
        auto_remove: Some(false),
        ..Default::default()
    };

    let endpoint = EndpointSettings {
        aliases: (!spec.aliases.is_empty()).then(|| spec.aliases.clone()),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        entrypoint: spec.entrypoint.clone(),
        cmd: spec.cmd.clone(),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone()),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        healthcheck: spec.healthcheck.as_ref().map(health_config),
        stop_signal: spec.stop_signal.clone(),
        stop_timeout: spec.stop_timeout.map(|t| t.as_secs() as i64),
        attach_stdin: Some(true),
        open_stdin: Some(true),
        host_config: Some(host_config),
        networking_config: Some(bollard::container::NetworkingConfig {
            endpoints_config: HashMap::from([(spec.network.clone(), endpoint)]),
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkSummary>, EngineError> {
        let options = ListNetworksOptions {
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
        };
        let networks = self
            .docker
            .list_networks(Some(options))
            .await
            .map_err(|e| EngineError::request("list networks", e))?;

        // The engine's name filter matches substrings.
        Ok(networks
            .into_iter()
            .filter(|n| n.name.as_deref() == Some(name))
            .map(|n| NetworkSummary {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<(), EngineError> {
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            internal: spec.internal,
            attachable: spec.attachable,
            enable_ipv6: spec.enable_ipv6,
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(spec.subnet.clone()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| EngineError::request("create network", e))?;
        tracing::debug!(network = %spec.name, subnet = %spec.subnet, "Created network");
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            let info = item.map_err(|e| EngineError::request("pull image", e))?;
            if let Some(status) = info.status {
                tracing::trace!(image = %image, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| classify("create container", &spec.name, e))?;
        for warning in &response.warnings {
            tracing::warn!(container = %short_id(&response.id), warning = %warning, "Engine warning on create");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify("start container", id, e))
    }

    async fn inspect_health(&self, id: &str) -> Result<HealthStatus, EngineError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify("inspect container", id, e))?;

        let Some(health) = info.state.and_then(|s| s.health) else {
            return Ok(HealthStatus::NoHealthcheck);
        };
        Ok(match health.status {
            Some(HealthStatusEnum::NONE) => HealthStatus::NoHealthcheck,
            Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
            Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
            Some(HealthStatusEnum::EMPTY) | None => HealthStatus::Unknown(String::new()),
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(classify("wait container", id, e)),
            None => Err(EngineError::request(
                "wait container",
                "stream ended without a status",
            )),
        }
    }

    async fn attach(&self, id: &str, with_output: bool) -> Result<AttachHandle, EngineError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(with_output),
            stderr: Some(with_output),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { mut output, input } = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| classify("attach container", id, e))?;

        if !with_output {
            return Ok(AttachHandle::new(Some(input), None));
        }

        let container = short_id(id);
        let forwarder = tokio::spawn(
            async move {
                while let Some(item) = output.next().await {
                    match item {
                        Ok(LogOutput::StdErr { message }) => {
                            let line = String::from_utf8_lossy(&message);
                            tracing::info!(container = %container, stream = "stderr", "{}", line.trim_end());
                        }
                        Ok(chunk) => {
                            let message = chunk.into_bytes();
                            let line = String::from_utf8_lossy(&message);
                            tracing::info!(container = %container, stream = "stdout", "{}", line.trim_end());
                        }
                        Err(e) => {
                            tracing::debug!(container = %container, error = %e, "Attach stream closed");
                            break;
                        }
                    }
                }
            }
            .with_current_subscriber(),
        );
        Ok(AttachHandle::new(Some(input), Some(forwarder)))
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|e| classify("stop container", id, e))
    }

    async fn remove_container(&self, id_or_name: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            v: true,
            force: true,
            link: false,
        };
        self.docker
            .remove_container(id_or_name, Some(options))
            .await
            .map_err(|e| classify("remove container", id_or_name, e))
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecOutput, EngineError> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| classify("create exec", id, e))?;

        let mut collected = Vec::new();
        match self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(|e| classify("start exec", id, e))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    let chunk = chunk.map_err(|e| EngineError::request("read exec output", e))?;
                    collected.extend_from_slice(&chunk.into_bytes());
                }
            }
            StartExecResults::Detached => {}
        }

        let inspected = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(|e| classify("inspect exec", id, e))?;

        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            output: String::from_utf8_lossy(&collected).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MountSpec;

    fn server_error(status_code: u16, message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_classify_removal_in_progress() {
        let err = classify(
            "remove container",
            "abc",
            server_error(409, "removal of container abc123 is already in progress"),
        );
        assert!(matches!(err, EngineError::RemovalInProgress { .. }));
    }

    #[test]
    fn test_classify_other_conflict_is_request_error() {
        let err = classify(
            "create container",
            "demo-db",
            server_error(409, "Conflict. The container name \"/demo-db\" is already in use"),
        );
        assert!(matches!(err, EngineError::Request { .. }));
    }

    #[test]
    fn test_classify_not_found() {
        let err = classify("remove container", "gone", server_error(404, "No such container"));
        assert!(matches!(err, EngineError::NotFound(ref name) if name == "gone"));
    }

    #[test]
    fn test_container_config_publishes_on_loopback() {
        let spec = ContainerSpec {
            name: "demo-db".into(),
            image: "postgres:15".into(),
            ports: vec![5432],
            network: "demo".into(),
            aliases: vec!["db".into()],
            mounts: vec![MountSpec::bind("/srv/data", "/var/lib/postgresql/data")],
            stop_signal: Some("SIGINT".into()),
            stop_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let config = container_config(&spec);
        let host = config.host_config.unwrap();

        let bindings = host.port_bindings.unwrap();
        let binding = bindings["5432/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(binding[0].host_port.as_deref(), Some("5432"));

        assert_eq!(host.network_mode.as_deref(), Some("demo"));
        assert_eq!(host.auto_remove, Some(false));
        assert_eq!(
            host.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::NO)
        );
        assert_eq!(host.mounts.unwrap()[0].typ, Some(MountTypeEnum::BIND));

        assert_eq!(config.stop_signal.as_deref(), Some("SIGINT"));
        assert_eq!(config.stop_timeout, Some(30));
        let endpoints = config.networking_config.unwrap().endpoints_config;
        assert_eq!(endpoints["demo"].aliases, Some(vec!["db".to_string()]));
    }

    #[test]
    fn test_health_config_uses_nanoseconds() {
        let check = HealthCheck {
            test: vec!["CMD".into(), "true".into()],
            interval: Some(Duration::from_secs(5)),
            timeout: Some(Duration::from_secs(2)),
            retries: Some(3),
            start_period: None,
        };
        let config = health_config(&check);
        assert_eq!(config.interval, Some(5_000_000_000));
        assert_eq!(config.timeout, Some(2_000_000_000));
        assert_eq!(config.retries, Some(3));
        assert_eq!(config.start_period, None);
    }
}
