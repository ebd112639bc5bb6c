//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::app::state::AppState;
use crate::errors::DockyardError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::scheduler;

/// Run the Dockyard server until `shutdown_signal` resolves
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DockyardError> {
    info!("Initializing Dockyard...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.max_shutdown_delay);

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start Dockyard: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, DockyardError> {
    let app_state = Arc::new(AppState::init(options).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    if options.enable_server {
        init_server(options, app_state.clone(), shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    if options.enable_scheduler {
        init_scheduler_worker(
            options.scheduler.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    Ok(app_state)
}

fn init_scheduler_worker(
    options: scheduler::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DockyardError> {
    info!("Initializing backup scheduler...");

    let engine = app_state.backups.clone();
    let handle = tokio::spawn(async move {
        scheduler::run(
            &options,
            &engine,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_scheduler_handle(handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DockyardError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(
        app_state.lifecycle.clone(),
        app_state.backups.clone(),
        options.deployments.injector.clone(),
    );

    let handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    max_shutdown_delay: Duration,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), DockyardError>>>,
    scheduler_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>, max_shutdown_delay: Duration) -> Self {
        Self {
            shutdown_tx,
            max_shutdown_delay,
            app_state: None,
            server_handle: None,
            scheduler_handle: None,
        }
    }

    fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), DockyardError> {
        if self.app_state.is_some() {
            return Err(DockyardError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    fn with_scheduler_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DockyardError> {
        if self.scheduler_handle.is_some() {
            return Err(DockyardError::ShutdownError("scheduler_handle already set".to_string()));
        }
        self.scheduler_handle = Some(handle);
        Ok(())
    }

    fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), DockyardError>>,
    ) -> Result<(), DockyardError> {
        if self.server_handle.is_some() {
            return Err(DockyardError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), DockyardError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DockyardError> {
        info!("Shutting down Dockyard...");

        // 1. Scheduler, so no new backups start
        if let Some(handle) = self.scheduler_handle.take() {
            handle
                .await
                .map_err(|e| DockyardError::ShutdownError(e.to_string()))?;
        }

        // 2. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| DockyardError::ShutdownError(e.to_string()))??;
        }

        // 3. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
