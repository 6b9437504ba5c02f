//! supastack - programmatic lifecycle orchestration for a self-hosted
//! backend platform stack on a local container engine.
//!
//! A host program builds a [`Config`], picks service definitions from the
//! [`catalog`] (or writes its own), and drives an [`Orchestrator`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use supastack::{Config, ConfigParams, Orchestrator, catalog, logging};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Arc::new(Config::new(ConfigParams::new("demo"))?);
//! let orchestrator = Orchestrator::connect(config.clone(), logging::disabled()).await?;
//! orchestrator.add_services(catalog::all(&config)?).await;
//!
//! let cancel = CancellationToken::new();
//! orchestrator.run(&cancel).await?;
//! // ...
//! orchestrator.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod secrets;
pub mod service;

pub use config::{Config, ConfigParams};
pub use engine::{ContainerEngine, DockerEngine};
pub use error::{CatalogError, ConfigError, EngineError, OrchestratorError};
pub use orchestrator::{Orchestrator, PartialFailurePolicy};
pub use secrets::{EncryptionKeySource, SecretError};
pub use service::{
    HealthCheck, MountSpec, PostStartHook, ServiceDefinition, ServiceId, ServiceState,
    ServiceStatus,
};
