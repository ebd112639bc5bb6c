//! Archive storage backends

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::errors::DockyardError;
use crate::filesys::dir::Dir;
use crate::storage::settings::BackupStorageSettings;
use crate::utils::generate_uuid;

/// Persistence for finished archives, addressed by an opaque handle
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Copy the local file at `source` into storage under `name`; returns
    /// the handle to record
    async fn store(&self, name: &str, source: &Path) -> Result<String, DockyardError>;

    /// Copy the archive behind `handle` to the local path `dest`
    async fn retrieve(&self, handle: &str, dest: &Path) -> Result<(), DockyardError>;

    /// Remove an archive; removing a missing one succeeds
    async fn delete(&self, handle: &str) -> Result<(), DockyardError>;

    async fn exists(&self, handle: &str) -> Result<bool, DockyardError>;

    async fn size(&self, handle: &str) -> Result<u64, DockyardError>;

    /// Every stored handle
    async fn list(&self) -> Result<Vec<String>, DockyardError>;
}

/// Build the backend named in the settings
pub fn create_storage_backend(
    settings: &BackupStorageSettings,
    default_dir: Dir,
) -> Result<Arc<dyn StorageBackend>, DockyardError> {
    match settings.storage_type.as_str() {
        "local" => {
            let root = match &settings.path {
                Some(path) => Dir::new(path),
                None => default_dir,
            };
            info!("Using local backup storage at {}", root.path().display());
            Ok(Arc::new(LocalStorage::new(root)))
        }
        other => Err(DockyardError::ConfigError(format!(
            "unsupported backup storage type '{}'",
            other
        ))),
    }
}

/// Archives as files in one directory; the handle is the file name
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: Dir,
}

impl LocalStorage {
    pub fn new(root: Dir) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Dir {
        &self.root
    }

    fn resolve(&self, handle: &str) -> Result<PathBuf, DockyardError> {
        let valid = !handle.is_empty()
            && !handle.starts_with('.')
            && !handle.contains(['/', '\\'])
            && handle != "..";
        if !valid {
            return Err(DockyardError::StorageFailure(format!(
                "invalid storage handle '{}'",
                handle
            )));
        }
        Ok(self.root.path().join(handle))
    }
}

fn storage_error(context: &str, err: std::io::Error) -> DockyardError {
    DockyardError::StorageFailure(format!("{}: {}", context, err))
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn store(&self, name: &str, source: &Path) -> Result<String, DockyardError> {
        let dest = self.resolve(name)?;
        self.root.create().await?;

        // copy beside the target, then rename so readers never see a partial file
        let tmp = self.root.path().join(format!(".{}.{}.tmp", name, generate_uuid()));
        if let Err(e) = fs::copy(source, &tmp).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(storage_error("copying archive into storage", e));
        }
        if let Err(e) = fs::rename(&tmp, &dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(storage_error("finalizing stored archive", e));
        }

        debug!("Stored archive {}", dest.display());
        Ok(name.to_string())
    }

    async fn retrieve(&self, handle: &str, dest: &Path) -> Result<(), DockyardError> {
        let path = self.resolve(handle)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(DockyardError::NotFound(format!("archive {}", handle)));
        }
        fs::copy(&path, dest)
            .await
            .map_err(|e| storage_error("retrieving archive", e))?;
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<(), DockyardError> {
        let path = self.resolve(handle)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted archive {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error("deleting archive", e)),
        }
    }

    async fn exists(&self, handle: &str) -> Result<bool, DockyardError> {
        let path = self.resolve(handle)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn size(&self, handle: &str) -> Result<u64, DockyardError> {
        let path = self.resolve(handle)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(DockyardError::NotFound(format!("archive {}", handle)))
            }
            Err(e) => Err(storage_error("reading archive size", e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>, DockyardError> {
        Ok(self
            .root
            .list_file_names()
            .await?
            .into_iter()
            .filter(|name| !name.starts_with('.'))
            .collect())
    }
}

/// Backup ID an archive handle belongs to
pub fn backup_id_of(handle: &str) -> &str {
    handle.split('.').next().unwrap_or(handle)
}

/// Remove stored archives whose backup ID is not in `valid_ids`.
///
/// Returns the removed handles.
pub async fn cleanup_orphans(
    backend: &dyn StorageBackend,
    valid_ids: &[String],
) -> Result<Vec<String>, DockyardError> {
    let mut removed = Vec::new();
    for handle in backend.list().await? {
        if valid_ids.iter().any(|id| id == backup_id_of(&handle)) {
            continue;
        }
        match backend.delete(&handle).await {
            Ok(()) => {
                info!("Removed orphaned archive {}", handle);
                removed.push(handle);
            }
            Err(e) => warn!("Failed to remove orphaned archive {}: {}", handle, e),
        }
    }
    Ok(removed)
}
