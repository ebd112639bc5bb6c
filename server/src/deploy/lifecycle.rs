//! Deployment lifecycle.
//!
//! Owns every status change of a deployment. Each change goes through the
//! `fsm` transition table and is then written with a compare-and-set on the
//! status that was read, so two concurrent callers can never both win.
//! Deploys and starts run as background tasks registered in the
//! [`TaskTracker`]; stop, restart and delete run inline under a per-ID lock.
//! The compose source of every successful deploy is kept on the record, so
//! backups and later redeploys never depend on the template staying put.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::compose::{ComposeDocument, InjectorConfig, TunnelInjector};
use crate::deploy::events::{EventHub, LifecycleEvent, Subscription};
use crate::deploy::fsm::{next_status, DeploymentEvent};
use crate::deploy::orchestrator::{Orchestrator, ServiceState};
use crate::deploy::tasks::TaskTracker;
use crate::errors::DockyardError;
use crate::models::deployment::{
    validate_stack_name, Deployment, DeploymentConfig, DeploymentLog, DeploymentOperation,
    DeploymentRequest, DeploymentStatus, GlobalTunnelConfig, LogSeverity, TunnelConfig,
};
use crate::store::Store;
use crate::templates::TemplateSource;
use crate::utils::generate_uuid;

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Ceiling for one orchestrator call
    pub operation_timeout: Duration,

    /// Inject the tunnel agent into deployments with tunnel credentials
    pub tunnel_enabled: bool,

    /// Tunnel URLs are `https://<stack>.<tunnel_domain>`
    pub tunnel_domain: String,

    pub injector: InjectorConfig,

    /// Pass `remove_volumes` to the orchestrator on delete
    pub remove_volumes_on_delete: bool,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(300),
            tunnel_enabled: true,
            tunnel_domain: "tunnel.example.com".to_string(),
            injector: InjectorConfig::default(),
            remove_volumes_on_delete: true,
        }
    }
}

/// Tunnel state of a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub deployment_id: String,
    pub stack_name: String,
    pub status: DeploymentStatus,
    pub tunnel_active: bool,
    /// Last known URL, kept after the stack stops
    pub tunnel_url: Option<String>,
    /// Runtime state of the agent container while running
    pub agent: Option<ServiceState>,
}

/// Tunnel state across every deployment that carries the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelStatus {
    /// A global tunnel configuration is saved
    pub configured: bool,
    /// Agent injection is switched on for this server
    pub enabled: bool,
    pub agent_image: String,
    pub total: usize,
    /// Deployments whose agent container reports `running`
    pub active: usize,
    pub deployments: Vec<TunnelInfo>,
}

/// How a background deploy brings the stack up
#[derive(Debug, Clone, Copy)]
enum DeployMode {
    /// Full deploy from the stored compose source, or the template when the
    /// record has never been deployed
    Fresh,

    /// Start the containers of a stopped stack
    Resume,
}

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Held for the length of one operation on a deployment
struct OperationGuard {
    id: String,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // only the map itself still refers to an idle mutex
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

pub fn deploy_task_key(deployment_id: &str) -> String {
    format!("deploy:{}", deployment_id)
}

/// Deployment lifecycle component
#[derive(Clone)]
pub struct DeploymentLifecycle {
    store: Arc<dyn Store>,
    orchestrator: Arc<dyn Orchestrator>,
    templates: Arc<dyn TemplateSource>,
    events: EventHub,
    tasks: TaskTracker,
    locks: Arc<LockMap>,
    options: Arc<LifecycleOptions>,
}

impl DeploymentLifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<dyn Orchestrator>,
        templates: Arc<dyn TemplateSource>,
        tasks: TaskTracker,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            store,
            orchestrator,
            templates,
            events: EventHub::default(),
            tasks,
            locks: Arc::new(DashMap::new()),
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &LifecycleOptions {
        &self.options
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Live status changes and log entries of one deployment
    pub fn subscribe(&self, deployment_id: &str) -> Subscription {
        self.events.subscribe(deployment_id)
    }

    /// Deployments with an operation in flight
    pub fn locked_count(&self) -> usize {
        self.locks.len()
    }

    /// Create a `pending` deployment; with `auto_start` the first deploy
    /// begins in the background
    pub async fn create_deployment(
        &self,
        request: DeploymentRequest,
    ) -> Result<Deployment, DockyardError> {
        let request = self.apply_global_tunnel(request).await?;
        let (template_ref, stack_name, config) = request.into_parts()?;
        let auto_start = config.auto_start;
        self.create_record(generate_uuid(), template_ref, stack_name, config, auto_start, None)
            .await
    }

    /// Recreate a deployment under a known ID from captured compose source
    /// and begin deploying it
    pub async fn recreate_deployment(
        &self,
        id: String,
        template_ref: String,
        stack_name: String,
        config: DeploymentConfig,
        compose_source: String,
    ) -> Result<Deployment, DockyardError> {
        self.create_record(id, template_ref, stack_name, config, true, Some(compose_source))
            .await
    }

    async fn create_record(
        &self,
        id: String,
        template_ref: String,
        stack_name: String,
        config: DeploymentConfig,
        begin: bool,
        compose_source: Option<String>,
    ) -> Result<Deployment, DockyardError> {
        validate_stack_name(&stack_name)?;
        config.validate()?;

        let mut deployment = Deployment::new(id, template_ref, stack_name, config);
        deployment.tunnel_active =
            self.options.tunnel_enabled && deployment.config.tunnel.is_some();
        deployment.compose_source = compose_source;
        self.store.insert_deployment(deployment.clone()).await?;

        info!(
            "Created deployment {} for stack {}",
            deployment.id, deployment.stack_name
        );
        self.log(
            &deployment.id,
            LogSeverity::Info,
            &format!("Deployment created from template {}", deployment.template_ref),
        )
        .await;

        if begin {
            self.spawn_deploy(&deployment.id, true, DeployMode::Fresh)?;
        }
        Ok(deployment)
    }

    /// Apply a caller-visible operation.
    ///
    /// `deploy` and `start` return once the background task is registered;
    /// `stop` and `restart` return after the orchestrator call.
    pub async fn transition_deployment(
        &self,
        id: &str,
        operation: DeploymentOperation,
    ) -> Result<Deployment, DockyardError> {
        let _guard = self.lock(id)?;
        let deployment = self.get_deployment(id).await?;
        let current = deployment.status;

        match operation {
            DeploymentOperation::Deploy => {
                next_status(current, DeploymentEvent::BeginDeploy)?;
                self.spawn_deploy(id, true, DeployMode::Fresh)?;
            }
            DeploymentOperation::Start => {
                let target = next_status(current, DeploymentEvent::Start)?;
                if self.tasks.is_running(&deploy_task_key(id)) {
                    return Err(DockyardError::Conflict(format!(
                        "an earlier deploy of {} has not finished yet",
                        id
                    )));
                }
                if !self.set_status(id, current, target, None).await? {
                    return Err(status_changed(id));
                }
                let mode = if current == DeploymentStatus::Stopped {
                    DeployMode::Resume
                } else {
                    DeployMode::Fresh
                };
                if let Err(e) = self.spawn_deploy(id, false, mode) {
                    // nothing will ever finish this deploy; put the record back
                    match self.set_status(id, target, current, None).await {
                        Ok(true) => {}
                        Ok(false) => warn!("Deployment {} changed status while starting", id),
                        Err(revert) => {
                            error!("Failed to revert deployment {} to {}: {}", id, current, revert)
                        }
                    }
                    return Err(e);
                }
            }
            DeploymentOperation::Stop => {
                let target = next_status(current, DeploymentEvent::Stop)?;
                if current == DeploymentStatus::Deploying {
                    self.tasks.cancel(&deploy_task_key(id));
                }
                let stack_name = deployment.stack_name.clone();
                if let Err(e) = self
                    .with_timeout("stop", self.orchestrator.stop(&stack_name))
                    .await
                {
                    self.fail(
                        id,
                        current,
                        DeploymentEvent::OperationFailed,
                        &format!("Failed to stop deployment: {}", e),
                    )
                    .await;
                    return Err(e);
                }
                if !self.set_status(id, current, target, None).await? {
                    return Err(status_changed(id));
                }
                self.log(id, LogSeverity::Info, "Deployment stopped").await;
            }
            DeploymentOperation::Restart => {
                next_status(current, DeploymentEvent::Restart)?;
                let stack_name = deployment.stack_name.clone();
                if let Err(e) = self
                    .with_timeout("restart", self.orchestrator.restart(&stack_name))
                    .await
                {
                    self.fail(
                        id,
                        current,
                        DeploymentEvent::OperationFailed,
                        &format!("Failed to restart deployment: {}", e),
                    )
                    .await;
                    return Err(e);
                }
                self.log(id, LogSeverity::Info, "Deployment restarted").await;
            }
        }

        self.get_deployment(id).await
    }

    /// Tear the stack down and remove the record.
    ///
    /// Only `stopped` and `failed` deployments can be deleted.
    pub async fn delete_deployment(&self, id: &str) -> Result<(), DockyardError> {
        let _guard = self.lock(id)?;
        let deployment = self.get_deployment(id).await?;
        let current = deployment.status;
        next_status(current, DeploymentEvent::Delete)?;

        if let Err(e) = self
            .with_timeout(
                "remove",
                self.orchestrator
                    .remove(&deployment.stack_name, self.options.remove_volumes_on_delete),
            )
            .await
        {
            self.fail(
                id,
                current,
                DeploymentEvent::OperationFailed,
                &format!("Failed to remove stack: {}", e),
            )
            .await;
            return Err(e);
        }

        if !self.store.delete_deployment(id, current).await? {
            return Err(status_changed(id));
        }
        info!("Deleted deployment {} ({})", id, deployment.stack_name);
        self.events.publish(
            id,
            LifecycleEvent::Deleted {
                deployment_id: id.to_string(),
            },
        );
        Ok(())
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Deployment, DockyardError> {
        self.store
            .get_deployment(id)
            .await?
            .ok_or_else(|| DockyardError::NotFound(format!("deployment {}", id)))
    }

    pub async fn find_by_stack_name(
        &self,
        stack_name: &str,
    ) -> Result<Option<Deployment>, DockyardError> {
        self.store.find_by_stack_name(stack_name).await
    }

    pub async fn list_deployments(
        &self,
        status: Option<DeploymentStatus>,
    ) -> Result<Vec<Deployment>, DockyardError> {
        self.store.list_deployments(status).await
    }

    /// Log entries in timestamp order
    pub async fn deployment_logs(&self, id: &str) -> Result<Vec<DeploymentLog>, DockyardError> {
        self.get_deployment(id).await?;
        self.store.logs(id).await
    }

    pub async fn tunnel_info(&self, id: &str) -> Result<TunnelInfo, DockyardError> {
        let deployment = self.get_deployment(id).await?;
        let agent = if deployment.tunnel_active && deployment.is_running() {
            match self
                .with_timeout("status", self.orchestrator.status(&deployment.stack_name))
                .await
            {
                Ok(mut services) => services.remove(&self.options.injector.service_name),
                Err(e) => {
                    warn!("Could not query status of {}: {}", deployment.stack_name, e);
                    None
                }
            }
        } else {
            None
        };

        Ok(TunnelInfo {
            deployment_id: deployment.id,
            stack_name: deployment.stack_name,
            status: deployment.status,
            tunnel_active: deployment.tunnel_active,
            tunnel_url: deployment.tunnel_url,
            agent,
        })
    }

    // ===================== GLOBAL TUNNEL CONFIGURATION ====================== //

    /// Saved server-wide tunnel credentials
    pub async fn global_tunnel_config(&self) -> Result<Option<GlobalTunnelConfig>, DockyardError> {
        self.store.tunnel_config().await
    }

    /// Validate and save server-wide tunnel credentials.
    ///
    /// Existing deployments keep the credentials they were created with.
    pub async fn set_global_tunnel_config(
        &self,
        credentials: TunnelConfig,
    ) -> Result<GlobalTunnelConfig, DockyardError> {
        credentials.validate()?;
        let config = GlobalTunnelConfig {
            credentials,
            updated_at: chrono::Utc::now(),
        };
        self.store.set_tunnel_config(config.clone()).await?;
        info!(
            "Saved global tunnel configuration for agent {}",
            config.credentials.newt_id
        );
        Ok(config)
    }

    /// Tunnel state of every deployment carrying the agent
    pub async fn tunnel_status(&self) -> Result<TunnelStatus, DockyardError> {
        let configured = self.store.tunnel_config().await?.is_some();
        let mut deployments = Vec::new();
        for deployment in self.store.list_deployments(None).await? {
            if !deployment.tunnel_active {
                continue;
            }
            match self.tunnel_info(&deployment.id).await {
                Ok(info) => deployments.push(info),
                Err(DockyardError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let active = deployments
            .iter()
            .filter(|info| info.agent.as_ref().map_or(false, |a| a.state == "running"))
            .count();

        Ok(TunnelStatus {
            configured,
            enabled: self.options.tunnel_enabled,
            agent_image: self.options.injector.image.clone(),
            total: deployments.len(),
            active,
            deployments,
        })
    }

    async fn apply_global_tunnel(
        &self,
        mut request: DeploymentRequest,
    ) -> Result<DeploymentRequest, DockyardError> {
        if request.use_global_tunnel && request.tunnel.is_none() {
            let config = self.store.tunnel_config().await?.ok_or_else(|| {
                DockyardError::ValidationError(
                    "no global tunnel configuration has been saved".to_string(),
                )
            })?;
            request.tunnel = Some(config.credentials);
        }
        Ok(request)
    }

    /// Compose source as it will be handed to the orchestrator: parsed, and
    /// with the tunnel agent injected when the deployment uses one.
    ///
    /// Returns the source and any validation warnings.
    pub fn prepare_compose(
        &self,
        deployment: &Deployment,
        source: &str,
    ) -> Result<(String, Vec<String>), DockyardError> {
        let doc = ComposeDocument::parse(source)?;

        match (&deployment.config.tunnel, deployment.tunnel_active) {
            (Some(tunnel), true) => {
                let injector = TunnelInjector::new(self.options.injector.clone(), tunnel.clone());
                let (doc, report) = injector.inject(doc);
                if !report.valid {
                    return Err(DockyardError::ValidationError(format!(
                        "compose validation failed: {}",
                        report.issues.join("; ")
                    )));
                }
                Ok((doc.to_yaml()?, report.warnings))
            }
            _ => {
                if doc.services.is_empty() {
                    return Err(DockyardError::ValidationError(
                        "No services defined in docker-compose file".to_string(),
                    ));
                }
                Ok((source.to_string(), Vec::new()))
            }
        }
    }

    /// Fetch a deployment's template and prepare it
    pub async fn render_compose(&self, deployment: &Deployment) -> Result<String, DockyardError> {
        let source = self
            .templates
            .fetch_compose_source(&deployment.template_ref)
            .await?;
        Ok(self.prepare_compose(deployment, &source)?.0)
    }

    /// Compose source the stack runs from: the copy kept from the last
    /// successful deploy, rendered from the template otherwise
    pub async fn current_compose(&self, deployment: &Deployment) -> Result<String, DockyardError> {
        match &deployment.compose_source {
            Some(source) => Ok(source.clone()),
            None => self.render_compose(deployment).await,
        }
    }

    /// Settle records left in a transient status by a previous process
    pub async fn recover_interrupted(&self) -> Result<(), DockyardError> {
        for deployment in self
            .store
            .list_deployments(Some(DeploymentStatus::Deploying))
            .await?
        {
            warn!("Deployment {} was interrupted while deploying", deployment.id);
            self.fail(
                &deployment.id,
                DeploymentStatus::Deploying,
                DeploymentEvent::DeployFailed,
                "Deployment interrupted by server restart",
            )
            .await;
        }

        for deployment in self
            .store
            .list_deployments(Some(DeploymentStatus::Pending))
            .await?
        {
            if deployment.config.auto_start {
                info!("Resuming pending deployment {}", deployment.id);
                self.spawn_deploy(&deployment.id, true, DeployMode::Fresh)?;
            }
        }
        Ok(())
    }

    fn spawn_deploy(
        &self,
        id: &str,
        claim_pending: bool,
        mode: DeployMode,
    ) -> Result<(), DockyardError> {
        let this = self.clone();
        let deployment_id = id.to_string();
        self.tasks.spawn(deploy_task_key(id), async move {
            this.run_deploy(deployment_id, claim_pending, mode).await;
        })
    }

    async fn run_deploy(self, id: String, claim_pending: bool, mode: DeployMode) {
        if claim_pending {
            match self
                .set_status(&id, DeploymentStatus::Pending, DeploymentStatus::Deploying, None)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Deployment {} left pending before it could be deployed", id);
                    return;
                }
                Err(e) => {
                    error!("Failed to begin deployment {}: {}", id, e);
                    return;
                }
            }
        }

        match self.execute_deploy(&id, mode).await {
            Ok(tunnel_url) => {
                let running = match next_status(
                    DeploymentStatus::Deploying,
                    DeploymentEvent::DeploySucceeded,
                ) {
                    Ok(running) => running,
                    Err(e) => {
                        error!("Deployment {} cannot complete: {}", id, e);
                        return;
                    }
                };
                self.log(&id, LogSeverity::Info, "Deployment completed successfully")
                    .await;
                match self
                    .set_status(&id, DeploymentStatus::Deploying, running, tunnel_url)
                    .await
                {
                    Ok(true) => info!("Deployment {} is running", id),
                    Ok(false) => warn!("Deployment {} changed status while deploying", id),
                    Err(e) => error!("Failed to record deployment {} as running: {}", id, e),
                }
            }
            Err(e) => {
                error!("Deployment {} failed: {}", id, e);
                self.fail(
                    &id,
                    DeploymentStatus::Deploying,
                    DeploymentEvent::DeployFailed,
                    &format!("Deployment failed: {}", e),
                )
                .await;
            }
        }
    }

    /// Bring the stack up; returns the tunnel URL to record
    async fn execute_deploy(
        &self,
        id: &str,
        mode: DeployMode,
    ) -> Result<Option<String>, DockyardError> {
        let deployment = self.get_deployment(id).await?;
        self.log(id, LogSeverity::Info, "Starting deployment process")
            .await;

        match mode {
            DeployMode::Resume => {
                self.with_timeout("start", self.orchestrator.start(&deployment.stack_name))
                    .await?;
            }
            DeployMode::Fresh => {
                let source = match &deployment.compose_source {
                    Some(source) => source.clone(),
                    None => {
                        self.templates
                            .fetch_compose_source(&deployment.template_ref)
                            .await?
                    }
                };
                let (compose, warnings) = self.prepare_compose(&deployment, &source)?;
                for warning in warnings {
                    self.log(id, LogSeverity::Warning, &warning).await;
                }
                self.with_timeout(
                    "deploy",
                    self.orchestrator.deploy(
                        &deployment.stack_name,
                        &compose,
                        &deployment.config.environment,
                    ),
                )
                .await?;
                if let Err(e) = self.store.set_compose_source(id, compose).await {
                    warn!("Failed to keep compose source of deployment {}: {}", id, e);
                }
            }
        }

        Ok(self.tunnel_url(&deployment))
    }

    fn tunnel_url(&self, deployment: &Deployment) -> Option<String> {
        deployment.tunnel_active.then(|| {
            format!(
                "https://{}.{}",
                deployment.compose_project_name(),
                self.options.tunnel_domain
            )
        })
    }

    /// Compare-and-set through the store, publishing on success
    async fn set_status(
        &self,
        id: &str,
        from: DeploymentStatus,
        to: DeploymentStatus,
        tunnel_url: Option<String>,
    ) -> Result<bool, DockyardError> {
        let changed = self
            .store
            .compare_and_set_status(id, from, to, tunnel_url)
            .await?;
        if changed && from != to {
            self.events.publish(
                id,
                LifecycleEvent::StatusChanged {
                    deployment_id: id.to_string(),
                    from,
                    to,
                    at: chrono::Utc::now(),
                },
            );
        }
        Ok(changed)
    }

    /// Record why a deployment failed, then drive it to `failed`.
    ///
    /// The log entry lands first so anyone who observes the status can read
    /// the reason.
    async fn fail(&self, id: &str, from: DeploymentStatus, event: DeploymentEvent, message: &str) {
        self.log(id, LogSeverity::Error, message).await;
        let target = match next_status(from, event) {
            Ok(target) => target,
            Err(_) => DeploymentStatus::Failed,
        };
        match self.set_status(id, from, target, None).await {
            Ok(true) => {}
            Ok(false) => warn!("Deployment {} changed status before it could be failed", id),
            Err(e) => error!("Failed to mark deployment {} as failed: {}", id, e),
        }
    }

    async fn log(&self, id: &str, level: LogSeverity, message: &str) {
        match self.store.append_log(id, level, message).await {
            Ok(entry) => self.events.publish(id, LifecycleEvent::Log(entry)),
            Err(e) => warn!("Failed to append log for deployment {}: {}", id, e),
        }
    }

    /// Run an orchestrator call under the configured ceiling
    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> Result<T, DockyardError>
    where
        F: std::future::Future<Output = Result<T, DockyardError>>,
    {
        match tokio::time::timeout(self.options.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DockyardError::OrchestrationFailure(format!(
                "{} timed out after {:?}",
                operation, self.options.operation_timeout
            ))),
        }
    }

    /// Per-ID guard; a second concurrent operation is rejected, not queued
    fn lock(&self, id: &str) -> Result<OperationGuard, DockyardError> {
        let mutex = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let mut guard = OperationGuard {
            id: id.to_string(),
            locks: Arc::clone(&self.locks),
            guard: None,
        };
        guard.guard = Some(mutex.try_lock_owned().map_err(|_| {
            DockyardError::Conflict(format!(
                "another operation on deployment {} is in progress",
                id
            ))
        })?);
        Ok(guard)
    }
}

fn status_changed(id: &str) -> DockyardError {
    DockyardError::Conflict(format!(
        "deployment {} changed status concurrently; re-fetch and retry",
        id
    ))
}
