//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::DockyardError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory and its parents
    pub async fn create(&self) -> Result<(), DockyardError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Create the directory, failing if it already exists.
    ///
    /// Parents are created as needed.
    pub async fn create_exclusive(&self) -> Result<(), DockyardError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        match fs::create_dir(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(DockyardError::Conflict(format!(
                    "directory already in use: {}",
                    self.path.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), DockyardError> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List file names in the directory, sorted; empty if it does not exist
    pub async fn list_file_names(&self) -> Result<Vec<String>, DockyardError> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        names.sort();
        Ok(names)
    }

    /// List subdirectory paths, sorted
    pub async fn list_dirs(&self) -> Result<Vec<PathBuf>, DockyardError> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }

        dirs.sort();
        Ok(dirs)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }
}
