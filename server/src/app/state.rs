//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::{AppOptions, TemplateOptions};
use crate::backup::encryption::KeyStore;
use crate::backup::{create_storage_backend, BackupEngine};
use crate::deploy::tasks::TaskTracker;
use crate::deploy::{ComposeCli, DeploymentLifecycle, Orchestrator};
use crate::errors::DockyardError;
use crate::storage::layout::StorageLayout;
use crate::store::{MemoryStore, Store};
use crate::templates::{DirTemplateSource, HttpTemplateSource, TemplateSource};

/// Main application state
pub struct AppState {
    pub layout: StorageLayout,

    /// Deployment and backup records
    pub store: Arc<dyn Store>,

    pub lifecycle: DeploymentLifecycle,

    pub backups: BackupEngine,

    /// Background deploy, backup and restore tasks
    pub tasks: TaskTracker,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, DockyardError> {
        info!("Initializing application state...");

        let layout = options.layout.clone();
        layout.setup().await?;

        let store: Arc<dyn Store> = Arc::new(MemoryStore::open(layout.state_file()).await?);

        let orchestrator: Arc<dyn Orchestrator> = Arc::new(ComposeCli::new(
            options.docker.compose_command.clone(),
            layout.deployments_dir(),
            options.docker.compose_timeout,
        ));

        let templates = init_template_source(&options.templates, &layout)?;
        let tasks = TaskTracker::new();

        let lifecycle = DeploymentLifecycle::new(
            store.clone(),
            orchestrator,
            templates,
            tasks.clone(),
            options.deployments.clone(),
        );

        let storage = create_storage_backend(&options.backup_storage, layout.backups_dir())?;
        let backups = BackupEngine::new(
            store.clone(),
            lifecycle.clone(),
            storage,
            KeyStore::new(layout.keys_dir()),
            layout.staging_dir(),
            layout.scratch_dir(),
            tasks.clone(),
            options.backup.clone(),
        );

        lifecycle.recover_interrupted().await?;
        backups.recover_interrupted().await?;
        match backups.cleanup_orphans().await {
            Ok(removed) if !removed.is_empty() => {
                info!("Removed {} orphaned archives", removed.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to check for orphaned archives: {}", e),
        }

        Ok(Self {
            layout,
            store,
            lifecycle,
            backups,
            tasks,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), DockyardError> {
        info!("Shutting down application state...");
        if !self.tasks.is_empty() {
            // interrupted records are settled by recovery at the next start
            warn!("Cancelling {} background tasks", self.tasks.len());
            self.tasks.cancel_all();
        }
        Ok(())
    }
}

fn init_template_source(
    options: &TemplateOptions,
    layout: &StorageLayout,
) -> Result<Arc<dyn TemplateSource>, DockyardError> {
    if let Some(base_url) = &options.base_url {
        info!("Loading templates from {}", base_url);
        return Ok(Arc::new(HttpTemplateSource::new(base_url)?));
    }
    let dir = options
        .dir
        .clone()
        .unwrap_or_else(|| layout.templates_dir().path().to_path_buf());
    info!("Loading templates from {}", dir.display());
    Ok(Arc::new(DirTemplateSource::new(dir)))
}
