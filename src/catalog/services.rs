//! Service definitions for the platform's stateless services.

use std::time::Duration;

use secrecy::ExposeSecret;

use crate::catalog::embedded::EmbeddedFile;
use crate::catalog::{DATABASE_CONTAINER_NAME, ensure_directory};
use crate::config::{Config, GATEWAY_CONTAINER_NAME};
use crate::error::CatalogError;
use crate::secrets::random_secret;
use crate::service::{HealthCheck, MountSpec, ServiceDefinition};

const STORAGE_TARGET: &str = "/var/lib/storage";
const GATEWAY_TEMPLATE_TARGET: &str = "/usr/local/kong-template.yml";

fn poll(check: HealthCheck, retries: u32) -> HealthCheck {
    check
        .interval(Duration::from_secs(5))
        .timeout(Duration::from_secs(5))
        .retries(retries)
}

fn db_host(config: &Config) -> String {
    config.container_name(DATABASE_CONTAINER_NAME)
}

fn db_url(config: &Config, user: &str) -> String {
    format!(
        "postgres://{}:{}@{}:5432/postgres",
        user,
        config.database_password(),
        db_host(config)
    )
}

/// Log ingestion and analytics.
pub fn analytics(config: &Config) -> ServiceDefinition {
    let password = config.database_password();
    ServiceDefinition::new(
        config.container_name("supastack-analytics"),
        "supabase/logflare:1.14.2",
    )
    .alias("analytics")
    .healthcheck(poll(
        HealthCheck::cmd(["curl", "http://localhost:4000/health"]),
        10,
    ))
    .env("LOGFLARE_NODE_HOST", "127.0.0.1")
    .env("DB_USERNAME", "supabase_admin")
    .env("DB_DATABASE", "_supabase")
    .env("DB_HOSTNAME", db_host(config))
    .env("DB_PORT", 5432)
    .env("DB_PASSWORD", password)
    .env("DB_SCHEMA", "_analytics")
    .env("LOGFLARE_PUBLIC_ACCESS_TOKEN", &config.log_ingestion.public_key)
    .env(
        "LOGFLARE_PRIVATE_ACCESS_TOKEN",
        config.log_ingestion.private_key.expose_secret(),
    )
    .env("LOGFLARE_SINGLE_TENANT", true)
    .env("LOGFLARE_SUPABASE_MODE", true)
    .env("LOGFLARE_MIN_CLUSTER_SIZE", 1)
    .env(
        "POSTGRES_BACKEND_URL",
        format!(
            "postgresql://supabase_admin:{}@{}:5432/_supabase",
            password,
            db_host(config)
        ),
    )
    .env("POSTGRES_BACKEND_SCHEMA", "_analytics")
    .env("LOGFLARE_FEATURE_FLAG_OVERRIDE", "multibackend=true")
}

/// Authentication server.
pub fn auth(config: &Config) -> ServiceDefinition {
    let smtp = &config.gateway.smtp;
    let mut definition = ServiceDefinition::new(
        config.container_name("supastack-auth"),
        "supabase/gotrue:v2.177.0",
    )
    .alias("auth")
    .alias("gotrue")
    .healthcheck(poll(
        HealthCheck::cmd([
            "wget",
            "--no-verbose",
            "--tries=1",
            "--spider",
            "http://localhost:9999/health",
        ]),
        3,
    ))
    .env("GOTRUE_API_HOST", "0.0.0.0")
    .env("GOTRUE_API_PORT", 9999)
    .env("API_EXTERNAL_URL", &config.gateway.urls.gateway)
    .env("GOTRUE_DB_DRIVER", "postgres")
    .env("GOTRUE_DB_DATABASE_URL", db_url(config, "supabase_auth_admin"))
    .env("GOTRUE_SITE_URL", &config.gateway.urls.site)
    .env("GOTRUE_URI_ALLOW_LIST", "")
    .env("GOTRUE_DISABLE_SIGNUP", false)
    .env("GOTRUE_JWT_ADMIN_ROLES", "service_role")
    .env("GOTRUE_JWT_AUD", "authenticated")
    .env("GOTRUE_JWT_DEFAULT_GROUP_NAME", "authenticated")
    .env("GOTRUE_JWT_EXP", 3600)
    .env("GOTRUE_JWT_SECRET", config.jwt_secret())
    .env("GOTRUE_EXTERNAL_EMAIL_ENABLED", true)
    .env("GOTRUE_EXTERNAL_ANONYMOUS_USERS_ENABLED", false)
    .env("GOTRUE_MAILER_AUTOCONFIRM", false)
    .env("GOTRUE_SMTP_ADMIN_EMAIL", &smtp.from.email)
    .env("GOTRUE_SMTP_HOST", &smtp.host)
    .env("GOTRUE_SMTP_PORT", smtp.port)
    .env("GOTRUE_SMTP_USER", &smtp.user)
    .env("GOTRUE_SMTP_PASS", &smtp.pass)
    .env("GOTRUE_SMTP_SENDER_NAME", &smtp.from.name);

    for kind in ["INVITE", "CONFIRMATION", "RECOVERY", "EMAIL_CHANGE"] {
        definition = definition.env(&format!("GOTRUE_MAILER_URLPATHS_{}", kind), "/auth/v1/verify");
    }

    definition
        .env("GOTRUE_EXTERNAL_PHONE_ENABLED", false)
        .env("GOTRUE_SMS_AUTOCONFIRM", false)
}

/// Image transformation server reading from the storage directory.
pub fn imgproxy(config: &Config) -> Result<ServiceDefinition, CatalogError> {
    ensure_directory(&config.storage.data_directory)?;
    Ok(ServiceDefinition::new(
        config.container_name("supastack-imgproxy"),
        "darthsim/imgproxy:v3.8.0",
    )
    .alias("imgproxy")
    .healthcheck(poll(HealthCheck::cmd(["imgproxy", "health"]), 3))
    .mount(MountSpec::bind(
        config.storage.data_directory.to_string_lossy(),
        STORAGE_TARGET,
    ))
    .env("IMGPROXY_BIND", ":5001")
    .env("IMGPROXY_LOCAL_FILESYSTEM_ROOT", "/")
    .env("IMGPROXY_USE_ETAG", true)
    .env("IMGPROXY_ENABLE_WEBP_DETECTION", true))
}

/// API gateway, configured from a caller-supplied declarative template.
///
/// The template is rendered by the container's shell at startup, so it may
/// reference the environment set here (`$SUPABASE_ANON_KEY` and so on).
pub fn kong(config: &Config, template: &str) -> Result<ServiceDefinition, CatalogError> {
    let template = EmbeddedFile::new("kong.yml", template, GATEWAY_TEMPLATE_TARGET).mount()?;
    Ok(ServiceDefinition::new(
        config.container_name(GATEWAY_CONTAINER_NAME),
        "kong:2.8.1",
    )
    .alias("kong")
    .port(8000)
    .mount(template)
    .entrypoint([
        "bash",
        "-c",
        "set -euo pipefail\n\
         eval \"echo \\\"$(cat /usr/local/kong-template.yml)\\\"\" > \"$HOME/kong.yml\"\n\
         exec /docker-entrypoint.sh kong docker-start",
    ])
    .env("KONG_DATABASE", "off")
    .env("KONG_DECLARATIVE_CONFIG", "/home/kong/kong.yml")
    .env("KONG_DNS_ORDER", "LAST,A,CNAME")
    .env(
        "KONG_PLUGINS",
        "request-transformer,cors,key-auth,acl,basic-auth",
    )
    .env("KONG_NGINX_PROXY_PROXY_BUFFER_SIZE", "160k")
    .env("KONG_NGINX_PROXY_PROXY_BUFFERS", "64 160k")
    .env("SUPABASE_ANON_KEY", &config.keys.public_jwt)
    .env("SUPABASE_SERVICE_KEY", config.service_key())
    .env("DASHBOARD_USERNAME", &config.dashboard.username)
    .env("DASHBOARD_PASSWORD", config.dashboard.password.expose_secret()))
}

/// Database introspection API used by the dashboard.
pub fn meta(config: &Config) -> ServiceDefinition {
    ServiceDefinition::new(
        config.container_name("supastack-meta"),
        "supabase/postgres-meta:v0.91.0",
    )
    .alias("meta")
    .env("PG_META_PORT", 8080)
    .env("PG_META_DB_HOST", db_host(config))
    .env("PG_META_DB_PORT", 5432)
    .env("PG_META_DB_NAME", "postgres")
    .env("PG_META_DB_USER", "supabase_admin")
    .env("PG_META_DB_PASSWORD", config.database_password())
}

/// REST API over the database.
pub fn postgrest(config: &Config) -> ServiceDefinition {
    ServiceDefinition::new(
        config.container_name("supastack-rest"),
        "postgrest/postgrest:v12.2.12",
    )
    .alias("rest")
    .cmd(["postgrest"])
    .env("PGRST_DB_URI", db_url(config, "authenticator"))
    .env("PGRST_DB_SCHEMAS", "public")
    .env("PGRST_DB_ANON_ROLE", "anon")
    .env("PGRST_JWT_SECRET", config.jwt_secret())
    .env("PGRST_DB_USE_LEGACY_GUCS", false)
    .env("PGRST_APP_SETTINGS_JWT_SECRET", config.jwt_secret())
    .env("PGRST_APP_SETTINGS_JWT_EXP", 3600)
    .env("PGRST_ADMIN_SERVER_PORT", 3001)
}

/// Realtime server.
///
/// The tenant is derived from the host name the server is reached by, so
/// the `realtime-dev.supabase-realtime` alias is load-bearing.
pub fn realtime(config: &Config) -> ServiceDefinition {
    ServiceDefinition::new(
        config.container_name("supastack-realtime"),
        "supabase/realtime:v2.34.47",
    )
    .alias("realtime-dev.supabase-realtime")
    .alias("realtime")
    .healthcheck(poll(
        HealthCheck::cmd([
            "curl".to_string(),
            "-sSfL".to_string(),
            "--head".to_string(),
            "-o".to_string(),
            "/dev/null".to_string(),
            "-H".to_string(),
            format!("Authorization: Bearer {}", config.keys.public_jwt),
            "http://localhost:4000/api/tenants/realtime-dev/health".to_string(),
        ]),
        3,
    ))
    .env("PORT", 4000)
    .env("DB_HOST", db_host(config))
    .env("DB_PORT", 5432)
    .env("DB_USER", "supabase_admin")
    .env("DB_PASSWORD", config.database_password())
    .env("DB_NAME", "postgres")
    .env("DB_AFTER_CONNECT_QUERY", "SET search_path TO _realtime")
    .env("DB_ENC_KEY", "supabaserealtime")
    .env("API_JWT_SECRET", config.jwt_secret())
    .env("SECRET_KEY_BASE", random_secret(64))
    .env("ERL_AFLAGS", "-proto_dist inet_tcp")
    .env("DNS_NODES", "''")
    .env("RLIMIT_NOFILE", 10000)
    .env("APP_NAME", "realtime")
    .env("SEED_SELF_HOST", true)
    .env("RUN_JANITOR", true)
}

/// Object storage API, backed by the storage directory.
pub fn storage(config: &Config) -> Result<ServiceDefinition, CatalogError> {
    ensure_directory(&config.storage.data_directory)?;
    Ok(ServiceDefinition::new(
        config.container_name("supastack-storage"),
        "supabase/storage-api:v1.25.7",
    )
    .alias("storage")
    .healthcheck(poll(
        HealthCheck::cmd([
            "wget",
            "--no-verbose",
            "--tries=1",
            "--spider",
            "http://storage:5000/status",
        ]),
        3,
    ))
    .mount(MountSpec::bind(
        config.storage.data_directory.to_string_lossy(),
        STORAGE_TARGET,
    ))
    .env("ANON_KEY", &config.keys.public_jwt)
    .env("SERVICE_KEY", config.service_key())
    .env("POSTGREST_URL", "http://rest:3000")
    .env("PGRST_JWT_SECRET", config.jwt_secret())
    .env("DATABASE_URL", db_url(config, "supabase_storage_admin"))
    .env("FILE_SIZE_LIMIT", 52428800)
    .env("STORAGE_BACKEND", "file")
    .env("FILE_STORAGE_BACKEND_PATH", STORAGE_TARGET)
    .env("TENANT_ID", "stub")
    .env("REGION", "stub")
    .env("GLOBAL_S3_BUCKET", "stub")
    .env("ENABLE_IMAGE_TRANSFORMATION", true)
    .env("IMGPROXY_URL", "http://imgproxy:5001"))
}

/// Dashboard.
pub fn studio(config: &Config) -> ServiceDefinition {
    ServiceDefinition::new(
        config.container_name("supastack-studio"),
        "supabase/studio:2025.06.30-sha-6f5982d",
    )
    .alias("studio")
    .healthcheck(
        HealthCheck::cmd([
            "node",
            "-e",
            "fetch('http://localhost:3000/api/platform/profile').then((r) => {if (r.status !== 200) throw new Error(r.status)})",
        ])
        .interval(Duration::from_secs(5))
        .timeout(Duration::from_secs(10))
        .retries(3),
    )
    .env("HOSTNAME", "0.0.0.0")
    .env("STUDIO_PG_META_URL", "http://meta:8080")
    .env("POSTGRES_PASSWORD", config.database_password())
    .env("DEFAULT_ORGANIZATION_NAME", "Supastack")
    .env("DEFAULT_PROJECT_NAME", "Supastack")
    .env("SUPABASE_URL", "http://kong:8000")
    .env("SUPABASE_PUBLIC_URL", "http://127.0.0.1:8000")
    .env("SUPABASE_ANON_KEY", &config.keys.public_jwt)
    .env("SUPABASE_SERVICE_KEY", config.service_key())
    .env("AUTH_JWT_SECRET", config.jwt_secret())
    .env(
        "LOGFLARE_PRIVATE_ACCESS_TOKEN",
        config.log_ingestion.private_key.expose_secret(),
    )
    .env("LOGFLARE_URL", "http://analytics:4000")
    .env("NEXT_PUBLIC_ENABLE_LOGS", true)
    .env("NEXT_ANALYTICS_BACKEND_PROVIDER", "postgres")
}
