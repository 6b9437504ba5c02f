//! Configuration for a supastack platform instance.
//!
//! A [`Config`] is assembled once and never mutated afterwards; downstream
//! components share it as `Arc<Config>`.
//!
//! Construction paths:
//! - [`Config::new`]: explicit, validating; rejects invalid platform names.
//! - [`Config::random`]: random secrets and default directories; does not
//!   validate the platform name (consumers fall back to the unnamespaced
//!   default instead).
//! - [`ConfigParams::from_env`]: `SUPASTACK_*` variables feeding
//!   [`Config::new`].

pub(crate) mod helpers;
mod platform;

use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;
use crate::secrets::{
    DEFAULT_SECRET_LEN, EncryptionKey, EncryptionKeySource, SignedTokens, derive_signed_tokens,
    random_secret,
};

pub use self::platform::{
    FALLBACK_PLATFORM_NAME, container_name, effective_platform_name, is_valid_platform_name,
};

/// Base name of the API gateway container.
pub const GATEWAY_CONTAINER_NAME: &str = "supastack-kong";

/// Default public site URL.
pub const DEFAULT_SITE_URL: &str = "http://127.0.0.1:3000";

/// Platform-wide settings.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Namespace for the network, container names and project label.
    pub platform_name: String,
    /// Keep containers after stop and attach their output streams.
    pub debug_mode: bool,
}

/// Database settings.
#[derive(Debug)]
pub struct DatabaseConfig {
    /// Host directory bind-mounted as the Postgres data directory.
    pub data_directory: PathBuf,
    /// Host directory for custom database files (defaults to the parent of
    /// `data_directory`).
    pub config_directory: PathBuf,
    pub password: SecretString,
}

/// Object storage settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
}

/// Studio dashboard credentials.
#[derive(Debug)]
pub struct DashboardConfig {
    pub username: String,
    pub password: SecretString,
}

/// Log ingestion access tokens.
#[derive(Debug)]
pub struct LogIngestionConfig {
    pub public_key: String,
    pub private_key: SecretString,
}

/// Signing secret, derived tokens and the encryption key.
#[derive(Debug)]
pub struct KeysConfig {
    pub jwt_secret: SecretString,
    /// `anon` role token.
    pub public_jwt: String,
    /// `service_role` token.
    pub private_jwt: SecretString,
    pub encryption_key: EncryptionKey,
    /// Set when the key was sourced from a file.
    pub encryption_key_file: Option<PathBuf>,
}

/// Publicly reachable URLs.
#[derive(Debug, Clone)]
pub struct GatewayUrls {
    /// Where the frontend site is served.
    pub site: String,
    /// Where the API gateway is reachable.
    pub gateway: String,
}

/// Sender identity for outgoing mail.
#[derive(Debug, Clone)]
pub struct SmtpFrom {
    pub email: String,
    pub name: String,
}

/// Outgoing mail settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub from: SmtpFrom,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "supabase-mail".to_string(),
            port: 2500,
            user: "fake_mail_user".to_string(),
            pass: "fake_mail_password".to_string(),
            from: SmtpFrom {
                email: "admin@example.com".to_string(),
                name: "fake_sender".to_string(),
            },
        }
    }
}

/// Gateway-facing settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub urls: GatewayUrls,
    pub smtp: SmtpConfig,
}

/// Main configuration for a platform instance.
#[derive(Debug)]
pub struct Config {
    pub global: GlobalConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub dashboard: DashboardConfig,
    pub log_ingestion: LogIngestionConfig,
    pub keys: KeysConfig,
    pub gateway: GatewayConfig,
}

/// Inputs for [`Config::new`]. Every field is optional except the platform
/// name; unset fields fall back to the documented default.
#[derive(Default)]
pub struct ConfigParams {
    /// Required. Letters and internal hyphens only.
    pub platform_name: Option<String>,
    /// Default: `false`.
    pub debug_mode: Option<bool>,
    /// Default: `<cwd>/postgres/data`.
    pub database_data_directory: Option<PathBuf>,
    /// Default: parent of the database data directory.
    pub database_config_directory: Option<PathBuf>,
    /// Default: random 32-char secret.
    pub database_password: Option<String>,
    /// Default: `<cwd>/storage/data`.
    pub storage_data_directory: Option<PathBuf>,
    /// Default: random 32-char secrets.
    pub dashboard_username: Option<String>,
    pub dashboard_password: Option<String>,
    /// Default: random 32-char secrets.
    pub log_ingestion_public_key: Option<String>,
    pub log_ingestion_private_key: Option<String>,
    /// Default: random 32-char secret.
    pub jwt_secret: Option<String>,
    /// Default: `pgsodium_root.key` beside the database data directory.
    pub encryption_key: Option<EncryptionKeySource>,
    /// Default: [`DEFAULT_SITE_URL`].
    pub site_url: Option<String>,
    /// Default: `http://<platform>-supastack-kong:8000`.
    pub gateway_url: Option<String>,
    /// Default: [`SmtpConfig::default`].
    pub smtp: Option<SmtpConfig>,
}

impl ConfigParams {
    /// Parameters for `platform_name` with everything else defaulted.
    pub fn new(platform_name: impl Into<String>) -> Self {
        Self {
            platform_name: Some(platform_name.into()),
            ..Default::default()
        }
    }

    /// Read parameters from `SUPASTACK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let encryption_key = match (
            optional_env("SUPASTACK_ENCRYPTION_KEY")?,
            optional_env("SUPASTACK_ENCRYPTION_KEY_FILE")?,
        ) {
            (Some(key), _) => Some(EncryptionKeySource::Static(key)),
            (None, Some(path)) => Some(EncryptionKeySource::File(PathBuf::from(path))),
            (None, None) => None,
        };

        let smtp_host = optional_env("SUPASTACK_SMTP_HOST")?;
        let smtp = match smtp_host {
            Some(host) => {
                let defaults = SmtpConfig::default();
                Some(SmtpConfig {
                    host,
                    port: parse_optional_env("SUPASTACK_SMTP_PORT")?.unwrap_or(defaults.port),
                    user: optional_env("SUPASTACK_SMTP_USER")?.unwrap_or(defaults.user),
                    pass: optional_env("SUPASTACK_SMTP_PASS")?.unwrap_or(defaults.pass),
                    from: SmtpFrom {
                        email: optional_env("SUPASTACK_SMTP_FROM_EMAIL")?
                            .unwrap_or(defaults.from.email),
                        name: optional_env("SUPASTACK_SMTP_FROM_NAME")?
                            .unwrap_or(defaults.from.name),
                    },
                })
            }
            None => None,
        };

        Ok(Self {
            platform_name: optional_env("SUPASTACK_PLATFORM")?,
            debug_mode: parse_bool_env("SUPASTACK_DEBUG")?,
            database_data_directory: optional_env("SUPASTACK_DB_DIR")?.map(PathBuf::from),
            database_password: optional_env("SUPASTACK_DB_PASSWORD")?,
            storage_data_directory: optional_env("SUPASTACK_STORAGE_DIR")?.map(PathBuf::from),
            jwt_secret: optional_env("SUPASTACK_JWT_SECRET")?,
            encryption_key,
            site_url: optional_env("SUPASTACK_SITE_URL")?,
            gateway_url: optional_env("SUPASTACK_GATEWAY_URL")?,
            smtp,
            ..Default::default()
        })
    }
}

impl Config {
    /// Build a configuration, validating the platform name and the
    /// encryption key.
    pub fn new(params: ConfigParams) -> Result<Self, ConfigError> {
        let platform = params
            .platform_name
            .as_deref()
            .ok_or(ConfigError::MissingPlatformName)?;
        if !is_valid_platform_name(platform) {
            return Err(ConfigError::InvalidPlatformName(platform.to_string()));
        }
        Self::assemble(params)
    }

    /// Build a configuration with random secrets and directories under the
    /// current working directory.
    ///
    /// The platform name is not validated here; see
    /// [`is_valid_platform_name`].
    pub fn random(
        platform_name: impl Into<String>,
        encryption_key: EncryptionKeySource,
    ) -> Result<Self, ConfigError> {
        Self::assemble(ConfigParams {
            platform_name: Some(platform_name.into()),
            encryption_key: Some(encryption_key),
            ..Default::default()
        })
    }

    fn assemble(params: ConfigParams) -> Result<Self, ConfigError> {
        let platform_name = params.platform_name.unwrap_or_default();

        let database_data_directory = match params.database_data_directory {
            Some(dir) => dir,
            None => working_directory()?.join("postgres").join("data"),
        };
        let database_config_directory = params
            .database_config_directory
            .unwrap_or_else(|| parent_or_self(&database_data_directory));
        let storage_data_directory = match params.storage_data_directory {
            Some(dir) => dir,
            None => working_directory()?.join("storage").join("data"),
        };

        let jwt_secret = params
            .jwt_secret
            .unwrap_or_else(|| random_secret(DEFAULT_SECRET_LEN));
        let SignedTokens { public, private } =
            derive_signed_tokens(&jwt_secret).map_err(ConfigError::Tokens)?;

        let key_source = params
            .encryption_key
            .unwrap_or_else(|| EncryptionKeySource::beside_database(&database_data_directory));
        let encryption_key = key_source.resolve().map_err(ConfigError::EncryptionKey)?;

        let gateway_url = params.gateway_url.unwrap_or_else(|| {
            format!(
                "http://{}:8000",
                container_name(&platform_name, GATEWAY_CONTAINER_NAME)
            )
        });

        let config = Self {
            global: GlobalConfig {
                platform_name,
                debug_mode: params.debug_mode.unwrap_or(false),
            },
            database: DatabaseConfig {
                data_directory: database_data_directory,
                config_directory: database_config_directory,
                password: secret_or_random(params.database_password),
            },
            storage: StorageConfig {
                data_directory: storage_data_directory,
            },
            dashboard: DashboardConfig {
                username: params
                    .dashboard_username
                    .unwrap_or_else(|| random_secret(DEFAULT_SECRET_LEN)),
                password: secret_or_random(params.dashboard_password),
            },
            log_ingestion: LogIngestionConfig {
                public_key: params
                    .log_ingestion_public_key
                    .unwrap_or_else(|| random_secret(DEFAULT_SECRET_LEN)),
                private_key: secret_or_random(params.log_ingestion_private_key),
            },
            keys: KeysConfig {
                jwt_secret: SecretString::from(jwt_secret),
                public_jwt: public,
                private_jwt: SecretString::from(private),
                encryption_key,
                encryption_key_file: key_source.file_path().map(Path::to_path_buf),
            },
            gateway: GatewayConfig {
                urls: GatewayUrls {
                    site: params
                        .site_url
                        .unwrap_or_else(|| DEFAULT_SITE_URL.to_string()),
                    gateway: gateway_url,
                },
                smtp: params.smtp.unwrap_or_default(),
            },
        };

        tracing::debug!(
            platform = %config.global.platform_name,
            debug_mode = config.global.debug_mode,
            "Assembled platform configuration"
        );
        Ok(config)
    }

    /// Namespace applied to the network and project label.
    pub fn platform_namespace(&self) -> &str {
        effective_platform_name(&self.global.platform_name)
    }

    /// Container name for a catalog service.
    pub fn container_name(&self, name: &str) -> String {
        container_name(&self.global.platform_name, name)
    }

    pub fn database_password(&self) -> &str {
        self.database.password.expose_secret()
    }

    pub fn jwt_secret(&self) -> &str {
        self.keys.jwt_secret.expose_secret()
    }

    pub fn service_key(&self) -> &str {
        self.keys.private_jwt.expose_secret()
    }
}

fn secret_or_random(value: Option<String>) -> SecretString {
    SecretString::from(value.unwrap_or_else(|| random_secret(DEFAULT_SECRET_LEN)))
}

fn working_directory() -> Result<PathBuf, ConfigError> {
    std::env::current_dir().map_err(|e| ConfigError::WorkingDirectory(e.to_string()))
}

fn parent_or_self(path: &Path) -> PathBuf {
    path.parent().unwrap_or(path).to_path_buf()
}
