//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::DockyardError;
use crate::server::handlers::{
    compose_inject_handler, compose_preview_handler, create_backup_handler,
    create_deployment_handler, create_schedule_handler, delete_backup_handler,
    delete_deployment_handler, delete_schedule_handler, deployment_logs_handler,
    download_backup_handler, get_backup_handler, get_deployment_handler, get_schedule_handler,
    get_tunnel_config_handler, health_handler, list_backups_handler, list_deployments_handler,
    list_schedules_handler, restore_backup_handler, restore_report_handler,
    set_tunnel_config_handler, transition_deployment_handler, tunnel_info_handler,
    tunnel_status_handler, update_schedule_handler, upload_backup_handler,
    validate_tunnel_config_handler, version_handler,
};
use crate::server::state::ServerState;

/// Largest backup archive accepted by the upload endpoint
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

/// Build the API router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Deployments
        .route(
            "/deployments",
            get(list_deployments_handler).post(create_deployment_handler),
        )
        .route(
            "/deployments/{id}",
            get(get_deployment_handler).delete(delete_deployment_handler),
        )
        .route(
            "/deployments/{id}/transition",
            post(transition_deployment_handler),
        )
        .route("/deployments/{id}/logs", get(deployment_logs_handler))
        .route("/deployments/{id}/tunnel", get(tunnel_info_handler))
        // Backups
        .route(
            "/backups",
            get(list_backups_handler).post(create_backup_handler),
        )
        .route(
            "/backups/{id}",
            get(get_backup_handler).delete(delete_backup_handler),
        )
        .route("/backups/{id}/restore", post(restore_backup_handler))
        .route("/backups/{id}/restore-report", get(restore_report_handler))
        .route("/backups/{id}/download", get(download_backup_handler))
        .route(
            "/backups/upload",
            post(upload_backup_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        // Backup schedules
        .route(
            "/backup-schedules",
            get(list_schedules_handler).post(create_schedule_handler),
        )
        .route(
            "/backup-schedules/{id}",
            get(get_schedule_handler)
                .put(update_schedule_handler)
                .delete(delete_schedule_handler),
        )
        // Global tunnel configuration
        .route(
            "/tunnel/config",
            get(get_tunnel_config_handler).put(set_tunnel_config_handler),
        )
        .route("/tunnel/validate", post(validate_tunnel_config_handler))
        .route("/tunnel/status", get(tunnel_status_handler))
        // Compose
        .route("/compose/inject", post(compose_inject_handler))
        .route("/compose/preview", post(compose_preview_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), DockyardError>>, DockyardError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DockyardError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DockyardError::ServerError(e.to_string()))
    });

    Ok(handle)
}
