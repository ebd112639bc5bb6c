//! Backup engine.
//!
//! Capture and restore run as background tasks keyed `backup:<id>` and
//! `restore:<id>`. Capture works in an exclusive staging directory named by
//! the backup ID and always removes it. A failed capture leaves neither an
//! archive nor a key behind. Restore works in a fresh scratch directory that
//! is removed on every exit path.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::backup::archive::{create_archive, extract_archive, file_checksum, ArchiveSummary};
use crate::backup::encryption::{decrypt_file, encrypt_file, EncryptionKey, KeyStore};
use crate::backup::retention::plan_retention;
use crate::backup::schedules::ScheduleBook;
use crate::backup::storage::{cleanup_orphans, StorageBackend};
use crate::compose::document::VolumeSpec;
use crate::compose::ComposeDocument;
use crate::deploy::lifecycle::DeploymentLifecycle;
use crate::deploy::tasks::TaskTracker;
use crate::errors::DockyardError;
use crate::filesys::dir::Dir;
use crate::models::backup::{
    Backup, BackupMetadata, BackupOptions, BackupSelection, BackupStatus, BackupType,
    DeploymentManifest, RestoreAction, RestoreOutcome, RestoreReport, RestoreRequest,
    VolumeManifest, BACKUP_FORMAT_VERSION,
};
use crate::models::deployment::{Deployment, DeploymentOperation, DeploymentStatus};
use crate::storage::settings::RetentionSettings;
use crate::store::Store;
use crate::utils::{generate_uuid, sha256_hex, version_info};

const METADATA_FILE: &str = "metadata.json";
const MANIFEST_FILE: &str = "manifest.json";
const COMPOSE_FILE: &str = "docker-compose.yml";
const DEPLOYMENTS_DIR: &str = "deployments";

pub fn backup_task_key(backup_id: &str) -> String {
    format!("backup:{}", backup_id)
}

pub fn restore_task_key(backup_id: &str) -> String {
    format!("restore:{}", backup_id)
}

fn archive_name(backup_id: &str, encrypted: bool) -> String {
    if encrypted {
        format!("{}.tar.gz.enc", backup_id)
    } else {
        format!("{}.tar.gz", backup_id)
    }
}

/// Backup engine options
#[derive(Debug, Clone, Default)]
pub struct BackupEngineOptions {
    /// Derive archive keys from this passphrase instead of generating them
    pub passphrase: Option<String>,

    /// Encrypt every backup regardless of its own flag
    pub always_encrypt: bool,
}

/// What a successful capture produced
struct CaptureOutput {
    handle: String,
    size: u64,
    checksum: String,
}

#[derive(Clone)]
pub struct BackupEngine {
    store: Arc<dyn Store>,
    lifecycle: DeploymentLifecycle,
    storage: Arc<dyn StorageBackend>,
    keys: KeyStore,
    staging_root: Dir,
    scratch_root: Dir,
    tasks: TaskTracker,
    reports: Arc<DashMap<String, RestoreReport>>,
    schedules: ScheduleBook,
    options: Arc<BackupEngineOptions>,
}

impl BackupEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        lifecycle: DeploymentLifecycle,
        storage: Arc<dyn StorageBackend>,
        keys: KeyStore,
        staging_root: Dir,
        scratch_root: Dir,
        tasks: TaskTracker,
        options: BackupEngineOptions,
    ) -> Self {
        Self {
            schedules: ScheduleBook::new(store.clone()),
            store,
            lifecycle,
            storage,
            keys,
            staging_root,
            scratch_root,
            tasks,
            reports: Arc::new(DashMap::new()),
            options: Arc::new(options),
        }
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn schedules(&self) -> &ScheduleBook {
        &self.schedules
    }

    /// Write a `creating` record and start capturing in the background.
    ///
    /// Nothing is written when the selection resolves to no deployments.
    pub async fn create_backup(
        &self,
        selection: BackupSelection,
        mut options: BackupOptions,
    ) -> Result<Backup, DockyardError> {
        if options.name.trim().is_empty() {
            return Err(DockyardError::ValidationError(
                "backup name must not be empty".to_string(),
            ));
        }
        let deployment_ids = self.resolve_selection(&selection).await?;
        if deployment_ids.is_empty() {
            return Err(DockyardError::NoDeploymentsSelected);
        }
        options.encrypted |= self.options.always_encrypt;

        let backup = Backup::new(generate_uuid(), &options, deployment_ids);
        self.store.insert_backup(backup.clone()).await?;
        info!(
            "Created backup {} ({}) of {} deployments",
            backup.id,
            backup.name,
            backup.deployment_ids.len()
        );

        let this = self.clone();
        let record = backup.clone();
        if let Err(e) = self
            .tasks
            .spawn(backup_task_key(&backup.id), async move {
                this.run_capture(record).await;
            })
        {
            self.mark_failed(&backup, &e.to_string()).await;
            return Err(e);
        }
        Ok(backup)
    }

    async fn resolve_selection(
        &self,
        selection: &BackupSelection,
    ) -> Result<Vec<String>, DockyardError> {
        match selection {
            BackupSelection::AllRunning => Ok(self
                .lifecycle
                .list_deployments(Some(DeploymentStatus::Running))
                .await?
                .into_iter()
                .map(|d| d.id)
                .collect()),
            BackupSelection::Explicit(ids) => {
                let mut resolved: Vec<String> = Vec::with_capacity(ids.len());
                for id in ids {
                    if resolved.contains(id) {
                        continue;
                    }
                    self.lifecycle.get_deployment(id).await?;
                    resolved.push(id.clone());
                }
                Ok(resolved)
            }
        }
    }

    async fn run_capture(self, backup: Backup) {
        let staging = self.staging_root.subdir(&backup.id);
        let result = self.capture(&backup, &staging).await;
        if let Err(e) = staging.delete().await {
            warn!("Failed to clean staging for backup {}: {}", backup.id, e);
        }

        match result {
            Ok(output) => {
                let mut completed = backup.clone();
                completed.status = BackupStatus::Completed;
                completed.size_bytes = output.size;
                completed.storage_path = Some(output.handle);
                completed.checksum = Some(output.checksum);
                completed.completed_at = Some(Utc::now());

                match self
                    .store
                    .update_backup(BackupStatus::Creating, completed)
                    .await
                {
                    Ok(true) => info!("Backup {} completed ({} bytes)", backup.id, output.size),
                    Ok(false) => {
                        warn!("Backup {} changed status during capture", backup.id);
                        self.discard_outputs(&backup).await;
                    }
                    Err(e) => {
                        error!("Failed to record backup {} as completed: {}", backup.id, e);
                        self.discard_outputs(&backup).await;
                    }
                }
            }
            Err(e) => {
                error!("Backup {} failed: {}", backup.id, e);
                self.discard_outputs(&backup).await;
                self.mark_failed(&backup, &e.to_string()).await;
            }
        }
    }

    async fn capture(&self, backup: &Backup, staging: &Dir) -> Result<CaptureOutput, DockyardError> {
        staging.create_exclusive().await?;
        let content = staging.subdir("content");
        let deployments_dir = content.subdir(DEPLOYMENTS_DIR);
        deployments_dir.create().await?;

        let mut volume_count = 0;
        for id in &backup.deployment_ids {
            let deployment = self.lifecycle.get_deployment(id).await?;
            let manifest = self.build_manifest(&deployment, backup.include_volumes).await?;
            volume_count += manifest.volumes.len();

            let dir = deployments_dir.subdir(id);
            dir.create().await?;
            dir.file(MANIFEST_FILE).write_json(&manifest).await?;
            dir.file(COMPOSE_FILE)
                .write_string(&manifest.compose_source)
                .await?;
            debug!("Captured deployment {} into backup {}", id, backup.id);
        }

        let metadata = BackupMetadata {
            version: BACKUP_FORMAT_VERSION.to_string(),
            backup_id: backup.id.clone(),
            created_at: backup.created_at,
            app_version: version_info().version,
            deployment_count: backup.deployment_ids.len(),
            volume_count,
            deployment_ids: backup.deployment_ids.clone(),
            encrypted: backup.encrypted,
        };
        content.file(METADATA_FILE).write_json(&metadata).await?;

        let archive_path = staging.path().join("archive.tar.gz");
        let summary = {
            let src = content.path().to_path_buf();
            let dest = archive_path.clone();
            blocking(move || create_archive(&src, &dest)).await?
        };
        let ArchiveSummary { checksum, .. } = summary;

        let upload_path = if backup.encrypted {
            let key = match &self.options.passphrase {
                Some(passphrase) => EncryptionKey::derive_with_random_salt(passphrase),
                None => EncryptionKey::generate(),
            };
            self.keys.store(&backup.id, &key).await?;

            let encrypted_path = staging.path().join("archive.tar.gz.enc");
            let src = archive_path.clone();
            let dest = encrypted_path.clone();
            blocking(move || encrypt_file(&src, &dest, &key)).await?;
            encrypted_path
        } else {
            archive_path
        };

        let handle = self
            .storage
            .store(&archive_name(&backup.id, backup.encrypted), &upload_path)
            .await?;
        let size = self.storage.size(&handle).await?;

        Ok(CaptureOutput {
            handle,
            size,
            checksum,
        })
    }

    async fn build_manifest(
        &self,
        deployment: &Deployment,
        include_volumes: bool,
    ) -> Result<DeploymentManifest, DockyardError> {
        let compose_source = self.lifecycle.current_compose(deployment).await?;

        let volumes = if include_volumes {
            let doc = ComposeDocument::parse(&compose_source)?;
            doc.named_volume_usage()
                .into_iter()
                .map(|(name, services)| VolumeManifest {
                    driver: doc.volumes.get(&name).and_then(|v| v.driver.clone()),
                    name,
                    services,
                })
                .collect()
        } else {
            Vec::new()
        };

        let mut labels = std::collections::BTreeMap::new();
        labels.insert("status".to_string(), deployment.status.to_string());
        labels.insert("tunnel_active".to_string(), deployment.tunnel_active.to_string());

        Ok(DeploymentManifest {
            deployment_id: deployment.id.clone(),
            stack_name: deployment.stack_name.clone(),
            template_ref: deployment.template_ref.clone(),
            config: deployment.config.clone(),
            compose_checksum: sha256_hex(compose_source.as_bytes()),
            compose_source,
            volumes,
            labels,
        })
    }

    /// Remove any archive or key a capture may have produced
    async fn discard_outputs(&self, backup: &Backup) {
        for name in [archive_name(&backup.id, false), archive_name(&backup.id, true)] {
            if let Err(e) = self.storage.delete(&name).await {
                warn!("Failed to remove partial archive {}: {}", name, e);
            }
        }
        if let Err(e) = self.keys.delete(&backup.id).await {
            warn!("Failed to remove key of backup {}: {}", backup.id, e);
        }
    }

    async fn mark_failed(&self, backup: &Backup, reason: &str) {
        let mut failed = backup.clone();
        failed.status = BackupStatus::Failed;
        failed.size_bytes = 0;
        failed.storage_path = None;
        failed.checksum = None;
        failed.error = Some(reason.to_string());
        failed.completed_at = None;

        match self.store.update_backup(BackupStatus::Creating, failed).await {
            Ok(true) => {}
            Ok(false) => warn!("Backup {} left creating before it could be failed", backup.id),
            Err(e) => error!("Failed to mark backup {} as failed: {}", backup.id, e),
        }
    }

    pub async fn get_backup(&self, id: &str) -> Result<Backup, DockyardError> {
        self.store
            .get_backup(id)
            .await?
            .ok_or_else(|| DockyardError::NotFound(format!("backup {}", id)))
    }

    pub async fn list_backups(&self) -> Result<Vec<Backup>, DockyardError> {
        self.store.list_backups().await
    }

    /// Remove the archive, key and record of a finished backup
    pub async fn delete_backup(&self, id: &str) -> Result<(), DockyardError> {
        let backup = self.get_backup(id).await?;
        if backup.status == BackupStatus::Creating {
            return Err(DockyardError::Conflict(format!(
                "backup {} is still being created",
                id
            )));
        }
        if self.tasks.is_running(&restore_task_key(id)) {
            return Err(DockyardError::Conflict(format!(
                "backup {} is being restored",
                id
            )));
        }

        if let Some(handle) = &backup.storage_path {
            self.storage.delete(handle).await?;
        }
        self.keys.delete(id).await?;
        self.store.delete_backup(id).await?;
        self.reports.remove(id);
        info!("Deleted backup {} ({})", id, backup.name);
        Ok(())
    }

    /// Stored archive of a completed backup, exactly as kept by the backend.
    ///
    /// Encrypted backups are returned encrypted; the key never leaves the host.
    pub async fn download_backup(&self, id: &str) -> Result<(Backup, Vec<u8>), DockyardError> {
        let backup = self.get_backup(id).await?;
        let handle = match (&backup.status, &backup.storage_path) {
            (BackupStatus::Completed, Some(handle)) => handle.clone(),
            _ => {
                return Err(DockyardError::Conflict(format!(
                    "backup {} is {}, not completed",
                    id, backup.status
                )))
            }
        };

        let scratch = self
            .scratch_root
            .subdir(&format!("download-{}", generate_uuid()));
        let result = async {
            scratch.create_exclusive().await?;
            let file = scratch.file("archive.download");
            self.storage.retrieve(&handle, file.path()).await?;
            file.read_bytes().await
        }
        .await;
        if let Err(e) = scratch.delete().await {
            warn!("Failed to clean download scratch {}: {}", scratch.path().display(), e);
        }

        let bytes = result?;
        debug!("Serving backup {} ({} bytes)", id, bytes.len());
        Ok((backup, bytes))
    }

    /// Store an uploaded plaintext archive as a new completed backup.
    ///
    /// The archive must extract cleanly, carry a supported format version
    /// and hold an intact manifest for every deployment it lists.
    pub async fn import_backup(&self, bytes: &[u8]) -> Result<Backup, DockyardError> {
        if bytes.is_empty() {
            return Err(DockyardError::ValidationError(
                "uploaded archive is empty".to_string(),
            ));
        }

        let id = generate_uuid();
        let scratch = self.scratch_root.subdir(&format!("upload-{}", id));
        let result = self.import_into(&id, bytes, &scratch).await;
        if let Err(e) = scratch.delete().await {
            warn!("Failed to clean upload scratch {}: {}", scratch.path().display(), e);
        }
        let backup = result?;

        if let Err(e) = self.store.insert_backup(backup.clone()).await {
            if let Some(handle) = &backup.storage_path {
                if let Err(e) = self.storage.delete(handle).await {
                    warn!("Failed to remove archive of rejected upload {}: {}", id, e);
                }
            }
            return Err(e);
        }
        info!(
            "Imported backup {} of {} deployments",
            backup.id,
            backup.deployment_ids.len()
        );
        Ok(backup)
    }

    async fn import_into(
        &self,
        id: &str,
        bytes: &[u8],
        scratch: &Dir,
    ) -> Result<Backup, DockyardError> {
        scratch.create_exclusive().await?;
        let upload = scratch.file("archive.tar.gz");
        upload.write_bytes(bytes).await?;

        let content = scratch.subdir("content");
        let (metadata, checksum) = self
            .inspect_upload(upload.path().to_path_buf(), &content)
            .await
            .map_err(|e| {
                DockyardError::ValidationError(format!(
                    "uploaded archive is not a valid backup: {}",
                    e
                ))
            })?;

        let handle = self
            .storage
            .store(&archive_name(id, false), upload.path())
            .await?;
        let size = self.storage.size(&handle).await?;

        let options = BackupOptions {
            name: format!("imported-{}", metadata.backup_id),
            backup_type: BackupType::Manual,
            include_volumes: metadata.volume_count > 0,
            encrypted: false,
        };
        let mut backup = Backup::new(id, &options, metadata.deployment_ids);
        backup.status = BackupStatus::Completed;
        backup.size_bytes = size;
        backup.storage_path = Some(handle);
        backup.checksum = Some(checksum);
        backup.completed_at = Some(Utc::now());
        Ok(backup)
    }

    /// Extract and check an uploaded archive; returns its metadata and checksum
    async fn inspect_upload(
        &self,
        archive: PathBuf,
        content: &Dir,
    ) -> Result<(BackupMetadata, String), DockyardError> {
        let checksum = {
            let path = archive.clone();
            blocking(move || file_checksum(&path)).await?
        };
        {
            let dest = content.path().to_path_buf();
            blocking(move || extract_archive(&archive, &dest)).await?;
        }

        let metadata_file = content.file(METADATA_FILE);
        if !metadata_file.exists().await {
            return Err(DockyardError::IntegrityCheckFailed(
                "metadata is missing".to_string(),
            ));
        }
        let metadata: BackupMetadata = metadata_file.read_json().await?;
        if metadata.version != BACKUP_FORMAT_VERSION {
            return Err(DockyardError::IntegrityCheckFailed(format!(
                "unsupported backup format version {}",
                metadata.version
            )));
        }
        if metadata.deployment_ids.is_empty() {
            return Err(DockyardError::NoDeploymentsSelected);
        }

        let deployments_dir = content.subdir(DEPLOYMENTS_DIR);
        for deployment_id in &metadata.deployment_ids {
            self.load_manifest(&deployments_dir, deployment_id).await?;
        }
        Ok((metadata, checksum))
    }

    /// Report of the last restore started from a backup
    pub fn restore_report(&self, backup_id: &str) -> Option<RestoreReport> {
        self.reports.get(backup_id).map(|r| r.clone())
    }

    /// Validate the request and start restoring in the background.
    ///
    /// Only `completed` backups are restored; nothing is read from storage
    /// before that check passes.
    pub async fn restore_backup(
        &self,
        backup_id: &str,
        request: RestoreRequest,
    ) -> Result<(), DockyardError> {
        let backup = self.get_backup(backup_id).await?;
        if !backup.is_completed() {
            return Err(DockyardError::InvalidRestoreRequest(format!(
                "backup {} is {}, not completed",
                backup_id, backup.status
            )));
        }
        request.validate()?;

        let key = restore_task_key(backup_id);
        if self.tasks.is_running(&key) {
            return Err(DockyardError::Conflict(format!(
                "backup {} is already being restored",
                backup_id
            )));
        }

        info!(
            "Restoring backup {} (selective: {}, test: {})",
            backup_id, request.selective, request.test_restore
        );
        self.reports.insert(
            backup_id.to_string(),
            RestoreReport::new(backup_id, request.test_restore),
        );

        let this = self.clone();
        self.tasks.spawn(key, async move {
            this.run_restore(backup, request).await;
        })
    }

    async fn run_restore(self, backup: Backup, request: RestoreRequest) {
        let mut report = RestoreReport::new(&backup.id, request.test_restore);
        let scratch = self
            .scratch_root
            .subdir(&format!("{}-{}", backup.id, generate_uuid()));

        if let Err(e) = self.restore_into(&backup, &request, &scratch, &mut report).await {
            error!("Restore of backup {} failed: {}", backup.id, e);
            report.error = Some(e.to_string());
        }
        if let Err(e) = scratch.delete().await {
            warn!("Failed to clean restore scratch {}: {}", scratch.path().display(), e);
        }

        report.finished_at = Some(Utc::now());
        info!(
            "Restore of backup {} finished: {} deployments, {} failed",
            backup.id,
            report.outcomes.len(),
            report.failed_count()
        );
        self.reports.insert(backup.id.clone(), report);
    }

    async fn restore_into(
        &self,
        backup: &Backup,
        request: &RestoreRequest,
        scratch: &Dir,
        report: &mut RestoreReport,
    ) -> Result<(), DockyardError> {
        scratch.create_exclusive().await?;

        let handle = backup.storage_path.as_deref().ok_or_else(|| {
            DockyardError::IntegrityCheckFailed(format!("backup {} has no archive", backup.id))
        })?;
        let expected = backup.checksum.clone().ok_or_else(|| {
            DockyardError::IntegrityCheckFailed(format!("backup {} has no checksum", backup.id))
        })?;

        let downloaded = scratch.path().join("archive.download");
        self.storage.retrieve(handle, &downloaded).await?;

        let archive_path: PathBuf = if backup.encrypted {
            let key = self.keys.load(&backup.id).await?;
            let plain = scratch.path().join("archive.tar.gz");
            let src = downloaded.clone();
            let dest = plain.clone();
            blocking(move || decrypt_file(&src, &dest, &key)).await?;
            plain
        } else {
            downloaded
        };

        let actual = {
            let path = archive_path.clone();
            blocking(move || file_checksum(&path)).await?
        };
        if actual != expected {
            return Err(DockyardError::IntegrityCheckFailed(format!(
                "archive checksum mismatch for backup {}",
                backup.id
            )));
        }

        let content = scratch.subdir("content");
        {
            let src = archive_path.clone();
            let dest = content.path().to_path_buf();
            blocking(move || extract_archive(&src, &dest)).await?;
        }

        let metadata: BackupMetadata = content.file(METADATA_FILE).read_json().await?;
        if metadata.version != BACKUP_FORMAT_VERSION {
            return Err(DockyardError::IntegrityCheckFailed(format!(
                "unsupported backup format version {}",
                metadata.version
            )));
        }

        if request.selective {
            for id in &request.deployment_ids {
                if !metadata.deployment_ids.contains(id) {
                    report.outcomes.push(RestoreOutcome {
                        deployment_id: id.clone(),
                        stack_name: String::new(),
                        action: RestoreAction::Failed,
                        message: "deployment is not part of this backup".to_string(),
                    });
                }
            }
        }

        let deployments_dir = content.subdir(DEPLOYMENTS_DIR);
        for id in metadata.deployment_ids.iter().filter(|id| request.includes(id)) {
            let outcome = match self.load_manifest(&deployments_dir, id).await {
                Ok(manifest) => self.restore_one(manifest, request).await,
                Err(e) => RestoreOutcome {
                    deployment_id: id.clone(),
                    stack_name: String::new(),
                    action: RestoreAction::Failed,
                    message: e.to_string(),
                },
            };
            debug!(
                "Restore of {} from backup {}: {:?}",
                outcome.deployment_id, backup.id, outcome.action
            );
            report.outcomes.push(outcome);
        }
        Ok(())
    }

    async fn load_manifest(
        &self,
        deployments_dir: &Dir,
        id: &str,
    ) -> Result<DeploymentManifest, DockyardError> {
        let file = deployments_dir.subdir(id).file(MANIFEST_FILE);
        if !file.exists().await {
            return Err(DockyardError::IntegrityCheckFailed(format!(
                "manifest for deployment {} is missing",
                id
            )));
        }
        let manifest: DeploymentManifest = file.read_json().await?;
        if manifest.deployment_id != id {
            return Err(DockyardError::IntegrityCheckFailed(format!(
                "manifest in {} belongs to deployment {}",
                id, manifest.deployment_id
            )));
        }
        manifest.verify()?;
        Ok(manifest)
    }

    /// Existing deployment colliding with a manifest by ID or stack name
    async fn find_existing(
        &self,
        manifest: &DeploymentManifest,
    ) -> Result<Option<Deployment>, DockyardError> {
        match self.lifecycle.get_deployment(&manifest.deployment_id).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(DockyardError::NotFound(_)) => {
                self.lifecycle.find_by_stack_name(&manifest.stack_name).await
            }
            Err(e) => Err(e),
        }
    }

    async fn restore_one(
        &self,
        manifest: DeploymentManifest,
        request: &RestoreRequest,
    ) -> RestoreOutcome {
        let mut outcome = RestoreOutcome {
            deployment_id: manifest.deployment_id.clone(),
            stack_name: manifest.stack_name.clone(),
            action: RestoreAction::Failed,
            message: String::new(),
        };

        let existing = match self.find_existing(&manifest).await {
            Ok(existing) => existing,
            Err(e) => {
                outcome.message = e.to_string();
                return outcome;
            }
        };

        if request.test_restore {
            outcome.action = RestoreAction::Validated;
            outcome.message = match (&existing, request.overwrite_existing) {
                (None, _) => format!("would restore stack {}", manifest.stack_name),
                (Some(d), true) => format!("would overwrite deployment {}", d.id),
                (Some(d), false) => format!("would skip existing deployment {}", d.id),
            };
            return outcome;
        }

        let overwrote = match existing {
            Some(deployment) if !request.overwrite_existing => {
                outcome.action = RestoreAction::SkippedExisting;
                outcome.message = format!("deployment {} already exists", deployment.id);
                return outcome;
            }
            Some(deployment) => {
                if let Err(e) = self.remove_existing(&deployment).await {
                    outcome.message = format!("could not replace deployment {}: {}", deployment.id, e);
                    return outcome;
                }
                true
            }
            None => false,
        };

        let volume_count = manifest.volumes.len();
        let compose_source = if request.restore_volumes {
            manifest.compose_source
        } else {
            match default_volume_definitions(&manifest.compose_source) {
                Ok(Some(stripped)) => stripped,
                Ok(None) => manifest.compose_source,
                Err(e) => {
                    outcome.message = e.to_string();
                    return outcome;
                }
            }
        };
        match self
            .lifecycle
            .recreate_deployment(
                manifest.deployment_id,
                manifest.template_ref,
                manifest.stack_name,
                manifest.config,
                compose_source,
            )
            .await
        {
            Ok(_) => {
                outcome.action = if overwrote {
                    RestoreAction::Overwritten
                } else {
                    RestoreAction::Restored
                };
                outcome.message = if request.restore_volumes && volume_count > 0 {
                    format!(
                        "resubmitted for deployment with {} volume definitions",
                        volume_count
                    )
                } else {
                    "resubmitted for deployment".to_string()
                };
            }
            Err(e) => outcome.message = e.to_string(),
        }
        outcome
    }

    /// Stop if needed, then delete a deployment about to be replaced
    async fn remove_existing(&self, deployment: &Deployment) -> Result<(), DockyardError> {
        if matches!(
            deployment.status,
            DeploymentStatus::Running | DeploymentStatus::Deploying
        ) {
            self.lifecycle
                .transition_deployment(&deployment.id, DeploymentOperation::Stop)
                .await?;
        }
        self.lifecycle.delete_deployment(&deployment.id).await
    }

    /// Delete scheduled backups the retention policy no longer keeps
    pub async fn apply_retention(
        &self,
        policy: &RetentionSettings,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, DockyardError> {
        let backups = self.store.list_backups().await?;
        let mut deleted = Vec::new();
        for id in plan_retention(&backups, policy, now) {
            match self.delete_backup(&id).await {
                Ok(()) => deleted.push(id),
                Err(e) => warn!("Retention could not delete backup {}: {}", id, e),
            }
        }
        if !deleted.is_empty() {
            info!("Retention removed {} backups", deleted.len());
        }
        Ok(deleted)
    }

    /// Remove stored archives with no backup record
    pub async fn cleanup_orphans(&self) -> Result<Vec<String>, DockyardError> {
        let ids: Vec<String> = self
            .store
            .list_backups()
            .await?
            .into_iter()
            .map(|b| b.id)
            .collect();
        cleanup_orphans(self.storage.as_ref(), &ids).await
    }

    /// Fail records left `creating` by a previous process
    pub async fn recover_interrupted(&self) -> Result<(), DockyardError> {
        for backup in self.store.list_backups().await? {
            if backup.status == BackupStatus::Creating
                && !self.tasks.is_running(&backup_task_key(&backup.id))
            {
                warn!("Backup {} was interrupted while being created", backup.id);
                self.discard_outputs(&backup).await;
                self.staging_root.subdir(&backup.id).delete().await?;
                self.mark_failed(&backup, "Backup interrupted by server restart")
                    .await;
            }
        }
        Ok(())
    }
}

/// Reset every named volume to a default definition.
///
/// Returns `None` when the source already uses defaults only, so it is
/// resubmitted byte for byte.
fn default_volume_definitions(compose_source: &str) -> Result<Option<String>, DockyardError> {
    let mut doc = ComposeDocument::parse(compose_source)?;
    if doc.volumes.values().all(|v| *v == VolumeSpec::default()) {
        return Ok(None);
    }
    for volume in doc.volumes.values_mut() {
        *volume = VolumeSpec::default();
    }
    doc.to_yaml().map(Some)
}

/// Run blocking archive or crypto work off the async threads
async fn blocking<T, F>(f: F) -> Result<T, DockyardError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DockyardError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DockyardError::Internal(format!("blocking task failed: {}", e)))?
}
