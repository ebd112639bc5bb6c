//! Backup engine tests: capture, restore, encryption and housekeeping

use chrono::{TimeZone, Utc};

use dockyard::backup::engine::{backup_task_key, restore_task_key};
use dockyard::backup::{BackupEngineOptions, StorageBackend};
use dockyard::errors::DockyardError;
use dockyard::models::backup::{
    Backup, BackupOptions, BackupSelection, BackupStatus, BackupType, RestoreAction,
    RestoreReport, RestoreRequest,
};
use dockyard::models::deployment::{DeploymentOperation, DeploymentStatus};
use dockyard::storage::settings::RetentionSettings;
use dockyard::utils::sha256_hex;

use crate::common::{request, BackupHarness, DEPLOY, WORKER_TEMPLATE};

fn options(name: &str) -> BackupOptions {
    BackupOptions {
        name: name.to_string(),
        ..Default::default()
    }
}

async fn capture(bh: &BackupHarness, selection: BackupSelection, options: BackupOptions) -> Backup {
    let backup = bh.engine.create_backup(selection, options).await.unwrap();
    bh.engine.tasks().wait(&backup_task_key(&backup.id)).await;
    bh.engine.get_backup(&backup.id).await.unwrap()
}

async fn restore(bh: &BackupHarness, backup_id: &str, request: RestoreRequest) -> RestoreReport {
    bh.engine.restore_backup(backup_id, request).await.unwrap();
    bh.engine.tasks().wait(&restore_task_key(backup_id)).await;
    // restored deployments redeploy in the background
    bh.engine.tasks().wait_all().await;
    bh.engine.restore_report(backup_id).unwrap()
}

async fn stop_and_delete(bh: &BackupHarness, id: &str) {
    bh.harness
        .lifecycle
        .transition_deployment(id, DeploymentOperation::Stop)
        .await
        .unwrap();
    bh.harness.lifecycle.delete_deployment(id).await.unwrap();
}

// =================================== CAPTURE ==================================== //

#[tokio::test]
async fn test_empty_selection_writes_nothing() {
    let bh = BackupHarness::new();

    let err = bh
        .engine
        .create_backup(BackupSelection::AllRunning, options("nightly"))
        .await
        .unwrap_err();
    assert!(matches!(err, DockyardError::NoDeploymentsSelected));

    let err = bh
        .engine
        .create_backup(BackupSelection::Explicit(Vec::new()), options("nightly"))
        .await
        .unwrap_err();
    assert!(matches!(err, DockyardError::NoDeploymentsSelected));

    assert!(bh.engine.list_backups().await.unwrap().is_empty());
    assert!(bh.storage.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_deployment_is_rejected() {
    let bh = BackupHarness::new();
    let err = bh
        .engine
        .create_backup(
            BackupSelection::Explicit(vec!["missing".to_string()]),
            options("nightly"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DockyardError::NotFound(_)));
    assert!(bh.engine.list_backups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_capture_all_running() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", true).await;
    bh.harness.orchestrator.fail_on(DEPLOY);
    let broken = bh.harness.deploy("worker", "jobs", false).await;
    assert_eq!(broken.status, DeploymentStatus::Failed);

    let created = bh
        .engine
        .create_backup(BackupSelection::AllRunning, options("nightly"))
        .await
        .unwrap();
    assert_eq!(created.status, BackupStatus::Creating);
    assert_eq!(created.deployment_ids, vec![shop.id.clone()]);

    bh.engine.tasks().wait(&backup_task_key(&created.id)).await;
    let backup = bh.engine.get_backup(&created.id).await.unwrap();

    assert_eq!(backup.status, BackupStatus::Completed);
    assert!(!backup.encrypted);
    assert!(backup.size_bytes > 0);
    assert!(backup.completed_at.is_some());
    assert_eq!(backup.checksum.as_ref().map(String::len), Some(64));

    let handle = backup.storage_path.clone().unwrap();
    assert_eq!(handle, format!("{}.tar.gz", backup.id));
    assert!(bh.storage.exists(&handle).await.unwrap());
    assert_eq!(bh.storage.size(&handle).await.unwrap(), backup.size_bytes);
}

#[tokio::test]
async fn test_duplicate_ids_are_captured_once() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;

    let backup = capture(
        &bh,
        BackupSelection::Explicit(vec![shop.id.clone(), shop.id.clone()]),
        options("manual"),
    )
    .await;
    assert_eq!(backup.deployment_ids, vec![shop.id]);
}

#[tokio::test]
async fn test_encrypted_capture_stores_key() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;

    let backup = capture(
        &bh,
        BackupSelection::Explicit(vec![shop.id]),
        BackupOptions {
            encrypted: true,
            ..options("secret")
        },
    )
    .await;

    assert_eq!(backup.status, BackupStatus::Completed);
    assert!(backup.encrypted);
    assert_eq!(
        backup.storage_path.as_deref(),
        Some(format!("{}.tar.gz.enc", backup.id).as_str())
    );
    assert!(bh.keys.exists(&backup.id).await);
}

#[tokio::test]
async fn test_always_encrypt_option() {
    let bh = BackupHarness::with_options(BackupEngineOptions {
        passphrase: Some("correct horse battery staple".to_string()),
        always_encrypt: true,
    });
    let shop = bh.harness.deploy("web", "shop", false).await;

    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id]), options("plain")).await;
    assert!(backup.encrypted);
    assert!(bh.keys.exists(&backup.id).await);
}

#[tokio::test]
async fn test_capture_failure_leaves_no_archive() {
    let bh = BackupHarness::new();
    // never deployed, so the capture has to render the template
    let mut req = request("web", "shop", false);
    req.auto_start = false;
    let shop = bh.harness.lifecycle.create_deployment(req).await.unwrap();
    assert!(shop.compose_source.is_none());
    bh.harness.templates.insert("web", "services: {}\n");

    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id]), options("broken")).await;

    assert_eq!(backup.status, BackupStatus::Failed);
    assert!(backup.error.is_some());
    assert!(backup.storage_path.is_none());
    assert!(bh.storage.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_capture_ignores_template_changes_after_deploy() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    bh.harness.templates.insert("web", "");

    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id]), options("b")).await;

    assert_eq!(backup.status, BackupStatus::Completed, "{:?}", backup.error);
}

// =================================== RESTORE ==================================== //

#[tokio::test]
async fn test_restore_of_creating_backup_is_rejected() {
    let bh = BackupHarness::new();
    let backup = Backup::new("pending-backup", &options("in-flight"), vec!["d1".to_string()]);
    bh.harness.store.insert_backup(backup).await.unwrap();

    let err = bh
        .engine
        .restore_backup("pending-backup", RestoreRequest::default())
        .await
        .unwrap_err();

    assert!(matches!(err, DockyardError::InvalidRestoreRequest(_)));
    assert!(bh.engine.restore_report("pending-backup").is_none());
    assert!(!bh.engine.tasks().is_running(&restore_task_key("pending-backup")));
}

#[tokio::test]
async fn test_selective_restore_requires_ids() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id]), options("b")).await;

    let err = bh
        .engine
        .restore_backup(
            &backup.id,
            RestoreRequest {
                selective: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DockyardError::InvalidRestoreRequest(_)));
}

#[tokio::test]
async fn test_restore_deleted_deployment() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", true).await;
    let original_compose = bh.harness.orchestrator.deployed_compose("shop").unwrap();
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id.clone()]), options("b")).await;

    stop_and_delete(&bh, &shop.id).await;

    let report = restore(&bh, &backup.id, RestoreRequest::default()).await;
    assert!(report.error.is_none(), "{:?}", report.error);
    assert!(report.finished_at.is_some());
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].action, RestoreAction::Restored);

    let restored = bh.harness.lifecycle.get_deployment(&shop.id).await.unwrap();
    assert_eq!(restored.stack_name, "shop");
    assert_eq!(restored.status, DeploymentStatus::Running);
    assert_eq!(restored.config, shop.config);
    assert_eq!(
        bh.harness.orchestrator.deployed_compose("shop").unwrap(),
        original_compose
    );
}

#[tokio::test]
async fn test_restore_uses_deployed_compose() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", true).await;
    bh.harness.templates.insert("web", WORKER_TEMPLATE);
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id.clone()]), options("b")).await;

    stop_and_delete(&bh, &shop.id).await;
    let report = restore(&bh, &backup.id, RestoreRequest::default()).await;

    assert_eq!(report.outcomes[0].action, RestoreAction::Restored);
    let compose = bh.harness.orchestrator.deployed_compose("shop").unwrap();
    assert!(compose.contains("nginx"));
    assert!(!compose.contains("busybox"));
}

#[tokio::test]
async fn test_restore_volumes_controls_volume_definitions() {
    let bh = BackupHarness::new();
    bh.harness.templates.insert(
        "nfs",
        "services:\n  web:\n    image: nginx:1.27\n    volumes:\n      - shared:/data\nvolumes:\n  shared:\n    driver: nfs-driver\n",
    );
    let shop = bh.harness.deploy("nfs", "shop", false).await;
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id.clone()]), options("b")).await;

    stop_and_delete(&bh, &shop.id).await;
    let report = restore(&bh, &backup.id, RestoreRequest::default()).await;
    assert_eq!(report.outcomes[0].action, RestoreAction::Restored);
    let compose = bh.harness.orchestrator.deployed_compose("shop").unwrap();
    assert!(compose.contains("shared"));
    assert!(!compose.contains("nfs-driver"));

    stop_and_delete(&bh, &shop.id).await;
    let report = restore(
        &bh,
        &backup.id,
        RestoreRequest {
            restore_volumes: true,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(report.outcomes[0].action, RestoreAction::Restored);
    let compose = bh.harness.orchestrator.deployed_compose("shop").unwrap();
    assert!(compose.contains("nfs-driver"));
}

#[tokio::test]
async fn test_restore_skips_existing_without_overwrite() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id.clone()]), options("b")).await;
    let calls_before = bh.harness.orchestrator.calls().len();

    let report = restore(&bh, &backup.id, RestoreRequest::default()).await;

    assert_eq!(report.outcomes[0].action, RestoreAction::SkippedExisting);
    assert_eq!(bh.harness.orchestrator.calls().len(), calls_before);
    assert_eq!(
        bh.harness.lifecycle.get_deployment(&shop.id).await.unwrap().created_at,
        shop.created_at
    );
}

#[tokio::test]
async fn test_restore_with_overwrite() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id.clone()]), options("b")).await;

    let report = restore(
        &bh,
        &backup.id,
        RestoreRequest {
            overwrite_existing: true,
            ..Default::default()
        },
    )
    .await;

    assert_eq!(report.outcomes[0].action, RestoreAction::Overwritten);
    assert_eq!(
        bh.harness.orchestrator.calls(),
        vec!["deploy:shop", "stop:shop", "remove:shop", "deploy:shop"]
    );
    let restored = bh.harness.lifecycle.get_deployment(&shop.id).await.unwrap();
    assert_eq!(restored.status, DeploymentStatus::Running);
}

#[tokio::test]
async fn test_test_restore_changes_nothing() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id.clone()]), options("b")).await;

    let report = restore(
        &bh,
        &backup.id,
        RestoreRequest {
            overwrite_existing: true,
            test_restore: true,
            ..Default::default()
        },
    )
    .await;

    assert!(report.test_restore);
    assert_eq!(report.outcomes[0].action, RestoreAction::Validated);
    assert_eq!(
        report.outcomes[0].message,
        format!("would overwrite deployment {}", shop.id)
    );
    assert_eq!(bh.harness.orchestrator.calls(), vec!["deploy:shop"]);
}

#[tokio::test]
async fn test_selective_restore() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let jobs = bh.harness.deploy("worker", "jobs", false).await;
    let backup = capture(&bh, BackupSelection::AllRunning, options("b")).await;
    assert_eq!(backup.deployment_ids.len(), 2);

    stop_and_delete(&bh, &shop.id).await;
    stop_and_delete(&bh, &jobs.id).await;

    let report = restore(
        &bh,
        &backup.id,
        RestoreRequest {
            selective: true,
            deployment_ids: vec![jobs.id.clone(), "not-in-backup".to_string()],
            ..Default::default()
        },
    )
    .await;

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.failed_count(), 1);
    let missing = report
        .outcomes
        .iter()
        .find(|o| o.deployment_id == "not-in-backup")
        .unwrap();
    assert_eq!(missing.action, RestoreAction::Failed);
    let restored = report
        .outcomes
        .iter()
        .find(|o| o.deployment_id == jobs.id)
        .unwrap();
    assert_eq!(restored.action, RestoreAction::Restored);

    assert!(bh.harness.lifecycle.get_deployment(&jobs.id).await.is_ok());
    assert!(matches!(
        bh.harness.lifecycle.get_deployment(&shop.id).await,
        Err(DockyardError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_encrypted_restore_round_trip() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(
        &bh,
        BackupSelection::Explicit(vec![shop.id.clone()]),
        BackupOptions {
            encrypted: true,
            ..options("secret")
        },
    )
    .await;
    stop_and_delete(&bh, &shop.id).await;

    let report = restore(&bh, &backup.id, RestoreRequest::default()).await;
    assert!(report.error.is_none(), "{:?}", report.error);
    assert_eq!(report.outcomes[0].action, RestoreAction::Restored);
}

#[tokio::test]
async fn test_tampered_archive_fails_integrity_check() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id.clone()]), options("b")).await;
    stop_and_delete(&bh, &shop.id).await;

    let archive = bh.archives_dir().file(backup.storage_path.as_deref().unwrap());
    let mut bytes = tokio::fs::read(archive.path()).await.unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    tokio::fs::write(archive.path(), &bytes).await.unwrap();

    let report = restore(&bh, &backup.id, RestoreRequest::default()).await;

    let error = report.error.unwrap();
    assert!(error.contains("Integrity check failed"), "{}", error);
    assert!(report.outcomes.is_empty());
    assert!(bh.harness.lifecycle.list_deployments(None).await.unwrap().is_empty());

    // the backup record itself is left as it was
    let after = bh.engine.get_backup(&backup.id).await.unwrap();
    assert_eq!(after, backup);
}

#[tokio::test]
async fn test_tampered_encrypted_archive_fails_integrity_check() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(
        &bh,
        BackupSelection::Explicit(vec![shop.id.clone()]),
        BackupOptions {
            encrypted: true,
            ..options("secret")
        },
    )
    .await;

    let archive = bh.archives_dir().file(backup.storage_path.as_deref().unwrap());
    let mut bytes = tokio::fs::read(archive.path()).await.unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    tokio::fs::write(archive.path(), &bytes).await.unwrap();

    let report = restore(&bh, &backup.id, RestoreRequest::default()).await;
    let error = report.error.unwrap();
    assert!(error.contains("Integrity check failed"), "{}", error);
}

// ================================= MANAGEMENT =================================== //

// ================================== TRANSFER ==================================== //

#[tokio::test]
async fn test_download_returns_stored_archive() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id]), options("b")).await;

    let (record, bytes) = bh.engine.download_backup(&backup.id).await.unwrap();
    assert_eq!(record.id, backup.id);
    assert_eq!(bytes.len() as u64, backup.size_bytes);
    assert_eq!(Some(sha256_hex(&bytes)), backup.checksum);
}

#[tokio::test]
async fn test_download_requires_completed_backup() {
    let bh = BackupHarness::new();
    let backup = Backup::new("pending-backup", &options("in-flight"), vec!["d1".to_string()]);
    bh.harness.store.insert_backup(backup).await.unwrap();

    let err = bh.engine.download_backup("pending-backup").await.unwrap_err();
    assert!(matches!(err, DockyardError::Conflict(_)));
    assert!(matches!(
        bh.engine.download_backup("missing").await,
        Err(DockyardError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_uploaded_archive_restores() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", true).await;
    let original_compose = bh.harness.orchestrator.deployed_compose("shop").unwrap();
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id.clone()]), options("b")).await;
    let (_, bytes) = bh.engine.download_backup(&backup.id).await.unwrap();

    bh.engine.delete_backup(&backup.id).await.unwrap();
    stop_and_delete(&bh, &shop.id).await;

    let imported = bh.engine.import_backup(&bytes).await.unwrap();
    assert_ne!(imported.id, backup.id);
    assert_eq!(imported.status, BackupStatus::Completed);
    assert_eq!(imported.deployment_ids, vec![shop.id.clone()]);
    assert_eq!(imported.checksum, backup.checksum);
    assert!(bh
        .storage
        .exists(imported.storage_path.as_deref().unwrap())
        .await
        .unwrap());

    let report = restore(&bh, &imported.id, RestoreRequest::default()).await;
    assert!(report.error.is_none(), "{:?}", report.error);
    assert_eq!(report.outcomes[0].action, RestoreAction::Restored);
    assert_eq!(
        bh.harness.orchestrator.deployed_compose("shop").unwrap(),
        original_compose
    );
}

#[tokio::test]
async fn test_invalid_upload_is_rejected() {
    let bh = BackupHarness::new();

    for bytes in [&b""[..], &b"definitely not a tarball"[..]] {
        let err = bh.engine.import_backup(bytes).await.unwrap_err();
        assert!(matches!(err, DockyardError::ValidationError(_)), "{}", err);
    }

    assert!(bh.engine.list_backups().await.unwrap().is_empty());
    assert!(bh.storage.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_encrypted_download_cannot_be_imported() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(
        &bh,
        BackupSelection::Explicit(vec![shop.id]),
        BackupOptions {
            encrypted: true,
            ..options("secret")
        },
    )
    .await;
    let (_, bytes) = bh.engine.download_backup(&backup.id).await.unwrap();

    let err = bh.engine.import_backup(&bytes).await.unwrap_err();
    assert!(matches!(err, DockyardError::ValidationError(_)));
    assert_eq!(bh.engine.list_backups().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_backup_removes_archive_and_key() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(
        &bh,
        BackupSelection::Explicit(vec![shop.id]),
        BackupOptions {
            encrypted: true,
            ..options("secret")
        },
    )
    .await;
    let handle = backup.storage_path.clone().unwrap();

    bh.engine.delete_backup(&backup.id).await.unwrap();

    assert!(!bh.storage.exists(&handle).await.unwrap());
    assert!(!bh.keys.exists(&backup.id).await);
    assert!(matches!(
        bh.engine.get_backup(&backup.id).await,
        Err(DockyardError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_creating_backup_conflicts() {
    let bh = BackupHarness::new();
    let backup = Backup::new("in-flight", &options("in-flight"), vec!["d1".to_string()]);
    bh.harness.store.insert_backup(backup).await.unwrap();

    let err = bh.engine.delete_backup("in-flight").await.unwrap_err();
    assert!(matches!(err, DockyardError::Conflict(_)));
}

#[tokio::test]
async fn test_recover_interrupted_backup() {
    let bh = BackupHarness::new();
    let backup = Backup::new("in-flight", &options("in-flight"), vec!["d1".to_string()]);
    bh.harness.store.insert_backup(backup).await.unwrap();

    bh.engine.recover_interrupted().await.unwrap();

    let recovered = bh.engine.get_backup("in-flight").await.unwrap();
    assert_eq!(recovered.status, BackupStatus::Failed);
    assert!(recovered.error.is_some());
}

#[tokio::test]
async fn test_cleanup_orphans() {
    let bh = BackupHarness::new();
    let shop = bh.harness.deploy("web", "shop", false).await;
    let backup = capture(&bh, BackupSelection::Explicit(vec![shop.id]), options("b")).await;

    let orphan = bh.archives_dir().file("deadbeef.tar.gz");
    orphan.write_string("stale").await.unwrap();

    let removed = bh.engine.cleanup_orphans().await.unwrap();

    assert_eq!(removed, vec!["deadbeef.tar.gz"]);
    assert_eq!(
        bh.storage.list().await.unwrap(),
        vec![backup.storage_path.unwrap()]
    );
}

#[tokio::test]
async fn test_retention_only_touches_scheduled_backups() {
    let bh = BackupHarness::new();
    let at = |d: u32| Utc.with_ymd_and_hms(2024, 9, d, 10, 0, 0).unwrap();

    for (id, day, backup_type) in [
        ("old", 9, BackupType::Scheduled),
        ("new", 10, BackupType::Scheduled),
        ("manual", 3, BackupType::Manual),
    ] {
        let mut backup = Backup::new(
            id,
            &BackupOptions {
                backup_type,
                ..options(id)
            },
            vec!["d1".to_string()],
        );
        backup.status = BackupStatus::Completed;
        backup.created_at = at(day);
        bh.harness.store.insert_backup(backup).await.unwrap();
    }

    let policy = RetentionSettings {
        daily: 1,
        weekly: 0,
        monthly: 0,
    };
    let deleted = bh.engine.apply_retention(&policy, at(11)).await.unwrap();

    assert_eq!(deleted, vec!["old"]);
    let remaining: Vec<String> = bh
        .engine
        .list_backups()
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&"new".to_string()));
    assert!(remaining.contains(&"manual".to_string()));
}
