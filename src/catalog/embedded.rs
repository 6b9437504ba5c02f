//! Payload files exposed to containers as read-only bind mounts.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::CatalogError;
use crate::service::MountSpec;

static TEMP_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Process-wide scratch directory for payload files, created on first use.
fn temp_dir(name: &str) -> Result<&'static Path, CatalogError> {
    if let Some(dir) = TEMP_DIR.get() {
        return Ok(dir);
    }
    let dir = std::env::temp_dir().join(format!("supastack-{}", uuid::Uuid::new_v4()));
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(&dir)
        .map_err(|source| CatalogError::EmbeddedFile {
            name: name.to_string(),
            source,
        })?;
    // A concurrent first call may win; its directory is used and ours stays empty.
    Ok(TEMP_DIR.get_or_init(|| dir).as_path())
}

/// A payload written to a unique temp file and mounted into a container.
#[derive(Clone)]
pub struct EmbeddedFile {
    /// File name used as the suffix of the temp file.
    pub name: String,
    pub data: Vec<u8>,
    /// Path inside the container.
    pub target: String,
    /// Permission bits of the temp file.
    pub mode: u32,
}

impl EmbeddedFile {
    pub fn new(
        name: impl Into<String>,
        data: impl Into<Vec<u8>>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            target: target.into(),
            mode: 0o444,
        }
    }

    /// Owner-only read access, for secret payloads.
    pub fn private(mut self) -> Self {
        self.mode = 0o400;
        self
    }

    /// Write the payload and return the mount for it.
    pub fn mount(&self) -> Result<MountSpec, CatalogError> {
        let file_name = format!("{}-{}", uuid::Uuid::new_v4(), self.name);
        let path = temp_dir(&self.name)?.join(file_name);
        self.write_to(&path)
            .map_err(|source| CatalogError::EmbeddedFile {
                name: self.name.clone(),
                source,
            })?;
        tracing::debug!(file = %self.name, path = %path.display(), "Wrote embedded file");
        Ok(MountSpec::bind(path.to_string_lossy(), self.target.clone()).read_only())
    }

    fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(self.mode);
        }
        let mut file = options.open(path)?;
        file.write_all(&self.data)?;
        file.sync_all()
    }
}

impl std::fmt::Debug for EmbeddedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedFile")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .field("target", &self.target)
            .field("mode", &format_args!("{:o}", self.mode))
            .finish()
    }
}
