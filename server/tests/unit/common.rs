//! Shared fixtures for the integration tests

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use dockyard::backup::encryption::KeyStore;
use dockyard::backup::{BackupEngine, BackupEngineOptions, LocalStorage, StorageBackend};
use dockyard::deploy::lifecycle::deploy_task_key;
use dockyard::deploy::orchestrator::{Orchestrator, ServiceState};
use dockyard::deploy::tasks::TaskTracker;
use dockyard::deploy::{DeploymentLifecycle, LifecycleOptions};
use dockyard::errors::DockyardError;
use dockyard::filesys::dir::Dir;
use dockyard::models::deployment::{Deployment, DeploymentRequest, DeploymentStatus, TunnelConfig};
use dockyard::store::{MemoryStore, Store};
use dockyard::templates::StaticTemplateSource;

pub const WEB_TEMPLATE: &str = r#"
services:
  web:
    image: nginx:1.27
    ports:
      - "8080:80"
    volumes:
      - web_data:/usr/share/nginx/html
volumes:
  web_data:
"#;

pub const WORKER_TEMPLATE: &str = r#"
services:
  worker:
    image: busybox
    command: ["sleep", "infinity"]
"#;

pub fn tunnel_config() -> TunnelConfig {
    TunnelConfig {
        endpoint: "https://pangolin.example.com".to_string(),
        newt_id: "newt-123".to_string(),
        secret: "s3cret".to_string(),
        image: None,
    }
}

// ================================ ORCHESTRATOR ================================== //

/// Operation names used to script failures
pub const DEPLOY: &str = "deploy";
pub const STOP: &str = "stop";
pub const START: &str = "start";
pub const RESTART: &str = "restart";
pub const REMOVE: &str = "remove";

/// In-memory orchestrator recording every call
#[derive(Default)]
pub struct FakeOrchestrator {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    deployed: Mutex<BTreeMap<String, String>>,
    deploy_delay: Mutex<Option<Duration>>,
}

impl FakeOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later call of `operation` fail
    pub fn fail_on(&self, operation: &str) {
        self.failing.lock().unwrap().insert(operation.to_string());
    }

    pub fn recover(&self, operation: &str) {
        self.failing.lock().unwrap().remove(operation);
    }

    pub fn set_deploy_delay(&self, delay: Duration) {
        *self.deploy_delay.lock().unwrap() = Some(delay);
    }

    /// Calls as `<operation>:<stack>`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Compose source of the last deploy of a stack
    pub fn deployed_compose(&self, stack_name: &str) -> Option<String> {
        self.deployed.lock().unwrap().get(stack_name).cloned()
    }

    fn record(&self, operation: &str, stack_name: &str) -> Result<(), DockyardError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", operation, stack_name));
        if self.failing.lock().unwrap().contains(operation) {
            return Err(DockyardError::OrchestrationFailure(format!(
                "{} of {} failed",
                operation, stack_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn deploy(
        &self,
        stack_name: &str,
        compose_source: &str,
        _env: &BTreeMap<String, String>,
    ) -> Result<(), DockyardError> {
        let delay = *self.deploy_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(DEPLOY, stack_name)?;
        self.deployed
            .lock()
            .unwrap()
            .insert(stack_name.to_string(), compose_source.to_string());
        Ok(())
    }

    async fn stop(&self, stack_name: &str) -> Result<(), DockyardError> {
        self.record(STOP, stack_name)
    }

    async fn start(&self, stack_name: &str) -> Result<(), DockyardError> {
        self.record(START, stack_name)
    }

    async fn restart(&self, stack_name: &str) -> Result<(), DockyardError> {
        self.record(RESTART, stack_name)
    }

    async fn status(
        &self,
        stack_name: &str,
    ) -> Result<BTreeMap<String, ServiceState>, DockyardError> {
        let running = self.deployed.lock().unwrap().contains_key(stack_name);
        let mut services = BTreeMap::new();
        if running {
            services.insert(
                "newt".to_string(),
                ServiceState {
                    state: "running".to_string(),
                    health: Some("healthy".to_string()),
                },
            );
        }
        Ok(services)
    }

    async fn remove(&self, stack_name: &str, _remove_volumes: bool) -> Result<(), DockyardError> {
        self.record(REMOVE, stack_name)?;
        self.deployed.lock().unwrap().remove(stack_name);
        Ok(())
    }
}

// ================================== HARNESS ===================================== //

/// Lifecycle wired to an in-memory store and the fake orchestrator
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub templates: Arc<StaticTemplateSource>,
    pub tasks: TaskTracker,
    pub lifecycle: DeploymentLifecycle,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(LifecycleOptions::default())
    }

    pub fn with_options(options: LifecycleOptions) -> Self {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let orchestrator = FakeOrchestrator::new();
        let templates = Arc::new(
            StaticTemplateSource::new()
                .with_template("web", WEB_TEMPLATE)
                .with_template("worker", WORKER_TEMPLATE),
        );
        let tasks = TaskTracker::new();
        let lifecycle = DeploymentLifecycle::new(
            store.clone(),
            orchestrator.clone(),
            templates.clone(),
            tasks.clone(),
            options,
        );
        Self {
            store,
            orchestrator,
            templates,
            tasks,
            lifecycle,
        }
    }

    /// Create a deployment and wait for its first deploy to settle
    pub async fn deploy(&self, template_ref: &str, stack_name: &str, tunnel: bool) -> Deployment {
        let deployment = self
            .lifecycle
            .create_deployment(request(template_ref, stack_name, tunnel))
            .await
            .unwrap();
        self.settle(&deployment.id).await
    }

    /// Wait for the background deploy of `id` and return the record
    pub async fn settle(&self, id: &str) -> Deployment {
        self.tasks.wait(&deploy_task_key(id)).await;
        self.lifecycle.get_deployment(id).await.unwrap()
    }

    pub async fn status(&self, id: &str) -> DeploymentStatus {
        self.lifecycle.get_deployment(id).await.unwrap().status
    }
}

pub fn request(template_ref: &str, stack_name: &str, tunnel: bool) -> DeploymentRequest {
    DeploymentRequest {
        template_ref: template_ref.to_string(),
        stack_name: stack_name.to_string(),
        environment: BTreeMap::from([("APP_ENV".to_string(), "test".to_string())]),
        tunnel: tunnel.then(tunnel_config),
        auto_start: true,
        use_global_tunnel: false,
    }
}

/// Harness plus a backup engine over temporary directories
pub struct BackupHarness {
    pub harness: Harness,
    pub engine: BackupEngine,
    pub storage: Arc<LocalStorage>,
    pub keys: KeyStore,
    _dir: TempDir,
}

impl BackupHarness {
    pub fn new() -> Self {
        Self::with_options(BackupEngineOptions::default())
    }

    pub fn with_options(options: BackupEngineOptions) -> Self {
        let harness = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let root = Dir::new(dir.path().to_path_buf());

        let storage = Arc::new(LocalStorage::new(root.subdir("archives")));
        let backend: Arc<dyn StorageBackend> = storage.clone();
        let keys = KeyStore::new(root.subdir("keys"));
        let engine = BackupEngine::new(
            harness.store.clone(),
            harness.lifecycle.clone(),
            backend,
            keys.clone(),
            root.subdir("staging"),
            root.subdir("scratch"),
            harness.tasks.clone(),
            options,
        );

        Self {
            harness,
            engine,
            storage,
            keys,
            _dir: dir,
        }
    }

    pub fn archives_dir(&self) -> Dir {
        self.storage.root().clone()
    }
}
