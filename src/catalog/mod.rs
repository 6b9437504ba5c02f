//! Service definitions for the standard platform topology.
//!
//! Each function maps a [`Config`] to a [`ServiceDefinition`]. Preparing
//! host directories and writing payload files are the only side effects.

mod embedded;
mod postgres;
mod services;

use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::CatalogError;
use crate::service::ServiceDefinition;

pub use self::embedded::EmbeddedFile;
pub use self::postgres::{PatchRolePasswords, postgres, postgres_with_init};
pub use self::services::{
    analytics, auth, imgproxy, kong, meta, postgrest, realtime, storage, studio,
};

/// Base name of the database container; other services reach it by the
/// namespaced form of this name.
pub const DATABASE_CONTAINER_NAME: &str = "supastack-db";

/// Every service in startup order, database first.
///
/// The gateway is not included because its declarative configuration is
/// supplied by the caller; see [`kong`].
pub fn all(config: &Config) -> Result<Vec<ServiceDefinition>, CatalogError> {
    Ok(vec![
        postgres(config)?,
        imgproxy(config)?,
        analytics(config),
        auth(config),
        meta(config),
        postgrest(config),
        storage(config)?,
        realtime(config),
        studio(config),
    ])
}

/// Make sure `path` is a directory, creating it owner-only if absent.
pub fn ensure_directory(path: &Path) -> Result<(), CatalogError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(CatalogError::NotADirectory {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o700);
            }
            builder
                .create(path)
                .map_err(|source| CatalogError::Directory {
                    path: path.to_path_buf(),
                    source,
                })?;
            tracing::debug!(path = %path.display(), "Created directory");
            Ok(())
        }
        Err(source) => Err(CatalogError::Directory {
            path: path.to_path_buf(),
            source,
        }),
    }
}
