//! Error types for supastack.

use std::path::PathBuf;

/// Configuration errors. Raised before any container is touched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No platform name specified")]
    MissingPlatformName,

    #[error(
        "Invalid platform name '{0}': use letters and internal hyphens only, starting and ending with a letter"
    )]
    InvalidPlatformName(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to determine working directory: {0}")]
    WorkingDirectory(String),

    #[error("Failed to derive access tokens: {0}")]
    Tokens(#[source] crate::secrets::SecretError),

    #[error("Failed to resolve encryption key: {0}")]
    EncryptionKey(#[source] crate::secrets::SecretError),
}

/// Errors reported by a [`ContainerEngine`](crate::engine::ContainerEngine).
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Container engine not reachable: {reason}")]
    Unavailable { reason: String },

    #[error("{operation} failed: {reason}")]
    Request {
        operation: &'static str,
        reason: String,
    },

    #[error("Removal of container {container} is already in progress")]
    RemovalInProgress { container: String },

    #[error("No such object: {0}")]
    NotFound(String),

    #[error("Command exited with code {exit_code}: {output}")]
    ExecFailed { exit_code: i64, output: String },
}

impl EngineError {
    pub(crate) fn request(operation: &'static str, reason: impl ToString) -> Self {
        Self::Request {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Errors returned by the lifecycle orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Container engine error: {0}")]
    Engine(#[source] EngineError),

    #[error("Failed to set up network '{network}': {reason}")]
    Network { network: String, reason: String },

    #[error("Failed to pull image for {service}: {source}")]
    PullFailed {
        service: String,
        #[source]
        source: EngineError,
    },

    #[error("Failed to create container for {service}: {source}")]
    ContainerCreationFailed {
        service: String,
        #[source]
        source: EngineError,
    },

    #[error("Failed to start container for {service}: {source}")]
    ContainerStartFailed {
        service: String,
        #[source]
        source: EngineError,
    },

    #[error("Unable to check health of {service} container {container}: {source}")]
    HealthCheckFailed {
        service: String,
        container: String,
        #[source]
        source: EngineError,
    },

    #[error("{service} container {container} is unhealthy (retry={retries})")]
    Unhealthy {
        service: String,
        container: String,
        retries: u32,
    },

    #[error("{service} container {container} reported unhandled health status '{status}'")]
    UnhandledHealthStatus {
        service: String,
        container: String,
        status: String,
    },

    #[error("Post-start hook failed for {service}: {source}")]
    PostStartFailed {
        service: String,
        #[source]
        source: EngineError,
    },

    #[error("Attach failed for {service} container {container}: {source}")]
    AttachFailed {
        service: String,
        container: String,
        #[source]
        source: EngineError,
    },

    #[error("Run cancelled while processing {service}")]
    Cancelled { service: String },

    #[error("Orchestrator has already been stopped")]
    Stopped,
}

/// Errors raised while preparing service definitions.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{path} exists but is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("Failed to prepare directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write embedded file '{name}': {source}")]
    EmbeddedFile {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
