//! The database service and its role-password hook.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::catalog::embedded::EmbeddedFile;
use crate::catalog::{DATABASE_CONTAINER_NAME, ensure_directory};
use crate::config::Config;
use crate::engine::{self, ContainerEngine, short_id};
use crate::error::{CatalogError, EngineError};
use crate::service::{HealthCheck, MountSpec, PostStartHook, ServiceDefinition};

/// Where the database image expects its encryption root key.
const KEY_TARGET: &str = "/etc/postgresql-custom/pgsodium_root.key";

/// Roles whose password is aligned with the configured database password.
const ROLES: &[&str] = &[
    "anon",
    "authenticated",
    "authenticator",
    "dashboard_user",
    "pgbouncer",
    "postgres",
    "service_role",
    "supabase_admin",
    "supabase_auth_admin",
    "supabase_read_only_user",
    "supabase_replication_admin",
    "supabase_storage_admin",
];

/// Database service with no init payloads.
pub fn postgres(config: &Config) -> Result<ServiceDefinition, CatalogError> {
    postgres_with_init(config, &[])
}

/// Database service with caller-supplied init payloads mounted under
/// `/docker-entrypoint-initdb.d`.
pub fn postgres_with_init(
    config: &Config,
    init_files: &[EmbeddedFile],
) -> Result<ServiceDefinition, CatalogError> {
    ensure_directory(&config.database.data_directory)?;
    ensure_directory(&config.database.config_directory)?;

    let key_mount = match &config.keys.encryption_key_file {
        Some(path) if path.is_file() => {
            MountSpec::bind(path.to_string_lossy(), KEY_TARGET).read_only()
        }
        _ => EmbeddedFile::new(
            "pgsodium_root.key",
            config.keys.encryption_key.expose_hex(),
            KEY_TARGET,
        )
        .private()
        .mount()?,
    };

    let password = config.database_password();
    let mut definition = ServiceDefinition::new(
        config.container_name(DATABASE_CONTAINER_NAME),
        "supabase/postgres:17.4.1.055",
    )
    .alias("db")
    .mount(key_mount)
    .mount(MountSpec::bind(
        config.database.data_directory.to_string_lossy(),
        "/var/lib/postgresql/data",
    ))
    .cmd([
        "postgres",
        "-c",
        "config_file=/etc/postgresql/postgresql.conf",
        "-c",
        "log_min_messages=error",
        "-c",
        "archive_mode=off",
    ])
    .env("POSTGRES_HOST", "/var/run/postgresql")
    .env("PGPORT", 5432)
    .env("POSTGRES_PORT", 5432)
    .env("PGPASSWORD", password)
    .env("POSTGRES_PASSWORD", password)
    .env("PGDATABASE", "postgres")
    .env("POSTGRES_DB", "postgres")
    .env("JWT_SECRET", config.jwt_secret())
    .env("JWT_EXP", 3600)
    .healthcheck(
        HealthCheck::cmd(["pg_isready", "-U", "postgres", "-h", "localhost"])
            .interval(Duration::from_secs(5))
            .timeout(Duration::from_secs(5))
            .retries(10),
    )
    .stop_timeout(Duration::from_secs(10))
    .post_start(PatchRolePasswords::new(config.database.password.clone()));

    for file in init_files {
        definition = definition.mount(file.mount()?);
    }
    Ok(definition)
}

/// Sets every built-in role's password to the configured one.
///
/// The image seeds its roles with its own defaults; without this step the
/// other services could not log in.
pub struct PatchRolePasswords {
    password: SecretString,
}

impl PatchRolePasswords {
    pub fn new(password: SecretString) -> Self {
        Self { password }
    }

    fn statements(&self) -> String {
        let escaped = self.password.expose_secret().replace('\'', "''");
        ROLES
            .iter()
            .map(|role| format!("ALTER USER {} WITH PASSWORD '{}';\n", role, escaped))
            .collect()
    }
}

#[async_trait]
impl PostStartHook for PatchRolePasswords {
    async fn after_start(
        &self,
        engine: Arc<dyn ContainerEngine>,
        container_id: &str,
    ) -> Result<(), EngineError> {
        let cmd = vec![
            "psql".to_string(),
            "-h".to_string(),
            "127.0.0.1".to_string(),
            "-U".to_string(),
            "supabase_admin".to_string(),
            "-d".to_string(),
            "postgres".to_string(),
            "-v".to_string(),
            "ON_ERROR_STOP=1".to_string(),
            "-c".to_string(),
            self.statements(),
        ];
        match engine::exec(engine.as_ref(), container_id, cmd).await {
            Ok(_) => {
                tracing::info!(container = %short_id(container_id), roles = ROLES.len(), "Patched role passwords");
                Ok(())
            }
            Err(EngineError::ExecFailed { exit_code, output }) => Err(EngineError::ExecFailed {
                exit_code,
                output: output.trim().replace('\n', "\\n"),
            }),
            Err(e) => Err(e),
        }
    }
}
