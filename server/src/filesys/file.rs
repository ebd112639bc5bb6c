//! File operations

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::DockyardError;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Size in bytes
    pub async fn size(&self) -> Result<u64, DockyardError> {
        Ok(fs::metadata(&self.path).await?.len())
    }

    pub async fn read_string(&self) -> Result<String, DockyardError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    pub async fn read_bytes(&self) -> Result<Vec<u8>, DockyardError> {
        Ok(fs::read(&self.path).await?)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, DockyardError> {
        let contents = self.read_string().await?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Write string to file, creating parent directories
    pub async fn write_string(&self, contents: &str) -> Result<(), DockyardError> {
        self.write_bytes(contents.as_bytes()).await
    }

    pub async fn write_bytes(&self, contents: &[u8]) -> Result<(), DockyardError> {
        self.ensure_parent().await?;
        let mut file = fs::File::create(&self.path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Write pretty JSON to file
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), DockyardError> {
        let contents = serde_json::to_string_pretty(value)?;
        self.write_string(&contents).await
    }

    /// Write bytes that only the owning user may read.
    ///
    /// Fails if the file already exists.
    pub async fn write_private(&self, contents: &[u8]) -> Result<(), DockyardError> {
        self.ensure_parent().await?;
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&self.path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Set file permissions to 0o600 on Unix; no-op elsewhere
    pub async fn set_permissions_600(&self) -> Result<(), DockyardError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path).await?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms).await?;
        }
        Ok(())
    }

    /// Atomic write through a sibling temporary file and rename
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), DockyardError> {
        self.ensure_parent().await?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = self
            .path
            .with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete the file if present
    pub async fn delete(&self) -> Result<(), DockyardError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_parent(&self) -> Result<(), DockyardError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }
}
