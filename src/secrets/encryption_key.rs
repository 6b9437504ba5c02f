//! Encryption key sources.
//!
//! A key can come from a fixed value, from a caller-supplied function, or
//! from a file that is created on first use. Whatever the source, the value
//! handed back has passed [`validate_encryption_key`].
//!
//! # File-backed keys
//!
//! ```text
//! path ─► create_new(0600) with 32 random bytes (if absent)
//!      ─► stat: regular file, no group/other bits
//!      ─► read, trim, canonicalize, validate
//! ```
//!
//! The file is always re-read after creation so the only way out of
//! [`EncryptionKeySource::resolve`] is through validation of what is on disk.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::secrets::crypto::{generate_key_hex, validate_encryption_key};
use crate::secrets::types::{EncryptionKey, SecretError};

/// File name used for the default key file next to the database directory.
pub const DEFAULT_KEY_FILE_NAME: &str = "pgsodium_root.key";

/// A caller-supplied key provider.
pub type KeyProvider = Arc<dyn Fn() -> Result<String, SecretError> + Send + Sync>;

/// Where the encryption key comes from.
#[derive(Clone)]
pub enum EncryptionKeySource {
    /// A fixed value, e.g. retrieved from a vault by the caller.
    Static(String),
    /// A function invoked at resolution time.
    Function(KeyProvider),
    /// A file that is created with a random key if absent.
    File(PathBuf),
}

impl EncryptionKeySource {
    /// Use a function as the key source.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> Result<String, SecretError> + Send + Sync + 'static,
    {
        Self::Function(Arc::new(f))
    }

    /// Key file stored one level above the database data directory.
    pub fn beside_database(data_directory: &Path) -> Self {
        let parent = data_directory.parent().unwrap_or(data_directory);
        Self::File(parent.join(DEFAULT_KEY_FILE_NAME))
    }

    /// Path of the backing file, if any.
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            _ => None,
        }
    }

    /// Resolve and validate the key.
    pub fn resolve(&self) -> Result<EncryptionKey, SecretError> {
        match self {
            Self::Static(value) => validate_encryption_key(value),
            Self::Function(provider) => validate_encryption_key(&provider()?),
            Self::File(path) => resolve_key_file(path),
        }
    }
}

impl fmt::Debug for EncryptionKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(_) => write!(f, "Static([REDACTED])"),
            Self::Function(_) => write!(f, "Function(..)"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

fn resolve_key_file(path: &Path) -> Result<EncryptionKey, SecretError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            return Err(SecretError::NotARegularFile {
                path: path.to_path_buf(),
            });
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => create_key_file(path)?,
        Err(e) => {
            return Err(SecretError::KeyFile {
                path: path.to_path_buf(),
                reason: format!("failed to check whether key file exists: {}", e),
            });
        }
    }
    read_key_file(path)
}

/// Write a fresh key with owner-only permissions.
///
/// Losing a creation race to another process is not an error; the winner's
/// file is read and validated afterwards.
fn create_key_file(path: &Path) -> Result<(), SecretError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = match options.open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => {
            return Err(SecretError::KeyFile {
                path: path.to_path_buf(),
                reason: format!("does not exist and could not be created: {}", e),
            });
        }
    };

    file.write_all(generate_key_hex().as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| SecretError::KeyFile {
            path: path.to_path_buf(),
            reason: format!("failed to write new key: {}", e),
        })?;

    tracing::debug!(path = %path.display(), "Created encryption key file");
    Ok(())
}

fn read_key_file(path: &Path) -> Result<EncryptionKey, SecretError> {
    let meta = fs::metadata(path).map_err(|e| SecretError::KeyFile {
        path: path.to_path_buf(),
        reason: format!("failed to stat: {}", e),
    })?;
    if !meta.is_file() {
        return Err(SecretError::NotARegularFile {
            path: path.to_path_buf(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = meta.permissions().mode() & 0o777;
        if mode & 0o177 != 0 {
            return Err(SecretError::InsecurePermissions {
                path: path.to_path_buf(),
                mode,
            });
        }
    }

    let data = fs::read_to_string(path).map_err(|e| SecretError::KeyFile {
        path: path.to_path_buf(),
        reason: format!("failed to read: {}", e),
    })?;

    let canonical = data.trim().to_ascii_lowercase();
    validate_encryption_key(&canonical).map_err(|e| SecretError::KeyFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
