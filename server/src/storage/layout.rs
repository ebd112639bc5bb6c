//! On-disk layout under the data directory

use std::path::PathBuf;

use crate::errors::DockyardError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the server
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Persisted deployment and backup records
    pub fn state_file(&self) -> File {
        File::new(self.base_dir.join("state.json"))
    }

    /// Root of the per-stack project directories
    pub fn deployments_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deployments"))
    }

    /// Project directory of one stack
    pub fn stack_dir(&self, stack_name: &str) -> Dir {
        self.deployments_dir().subdir(stack_name)
    }

    /// Default root for the local archive store
    pub fn backups_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("backups"))
    }

    /// Root of the per-backup capture directories
    pub fn staging_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("staging"))
    }

    /// Exclusive capture directory of one backup
    pub fn backup_staging_dir(&self, backup_id: &str) -> Dir {
        self.staging_dir().subdir(backup_id)
    }

    /// Root of the restore extraction directories
    pub fn scratch_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("scratch"))
    }

    /// Encryption key store
    pub fn keys_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("keys"))
    }

    /// Default root of the directory template source
    pub fn templates_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("templates"))
    }

    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Create every directory of the layout
    pub async fn setup(&self) -> Result<(), DockyardError> {
        self.deployments_dir().create().await?;
        self.backups_dir().create().await?;
        self.staging_dir().create().await?;
        self.scratch_dir().create().await?;
        self.keys_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/dockyard");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dockyard");

        Self::new(base_dir)
    }
}
