//! HTTP request handlers

use std::sync::Arc;

use api_models::{
    AcceptedResponse, BackupScheduleRequest, ComposeInjectResponse, ComposeRequest,
    CreateBackupRequest, CreateDeploymentRequest, DeploymentListQuery, ErrorResponse,
    HealthResponse, ListResponse, RestoreBackupRequest, TransitionRequest, TunnelCredentials,
    TunnelValidationResponse, VersionResponse,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::warn;

use crate::compose::{ChangeSummary, ComposeDocument, TunnelInjector, ValidationReport};
use crate::deploy::lifecycle::{TunnelInfo, TunnelStatus};
use crate::errors::DockyardError;
use crate::models::backup::{
    Backup, BackupOptions, BackupSchedule, BackupSelection, RestoreReport, RestoreRequest,
    ScheduleRequest,
};
use crate::models::deployment::{
    Deployment, DeploymentLog, DeploymentOperation, DeploymentRequest, DeploymentStatus,
    GlobalTunnelConfig, TunnelConfig,
};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error wrapper mapping the error taxonomy onto status codes
pub struct ApiError(pub DockyardError);

impl From<DockyardError> for ApiError {
    fn from(err: DockyardError) -> Self {
        Self(err)
    }
}

/// Status code and stable code string for an error
pub fn classify_error(err: &DockyardError) -> (StatusCode, &'static str) {
    match err {
        DockyardError::ValidationError(_) => (StatusCode::BAD_REQUEST, "validation"),
        DockyardError::ParseError(_) => (StatusCode::BAD_REQUEST, "parse"),
        DockyardError::JsonError(_) => (StatusCode::BAD_REQUEST, "parse"),
        DockyardError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        DockyardError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
        DockyardError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        DockyardError::NoDeploymentsSelected => {
            (StatusCode::UNPROCESSABLE_ENTITY, "no_deployments_selected")
        }
        DockyardError::InvalidRestoreRequest(_) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "invalid_restore_request")
        }
        DockyardError::OrchestrationFailure(_) => (StatusCode::BAD_GATEWAY, "orchestration"),
        DockyardError::HttpError(_) => (StatusCode::BAD_GATEWAY, "upstream"),
        DockyardError::IntegrityCheckFailed(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "integrity_check_failed")
        }
        DockyardError::StorageFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = classify_error(&self.0);
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            code: code.to_string(),
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn tunnel_config(credentials: TunnelCredentials) -> TunnelConfig {
    TunnelConfig {
        endpoint: credentials.endpoint,
        newt_id: credentials.newt_id,
        secret: credentials.secret,
        image: credentials.image,
    }
}

// ================================= SERVICE ====================================== //

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "dockyard".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// =============================== DEPLOYMENTS ==================================== //

pub async fn create_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateDeploymentRequest>,
) -> ApiResult<(StatusCode, Json<Deployment>)> {
    let request = DeploymentRequest {
        template_ref: request.template_ref,
        stack_name: request.stack_name,
        environment: request.environment,
        tunnel: request.tunnel.map(tunnel_config),
        auto_start: request.auto_start.unwrap_or(true),
        use_global_tunnel: request.use_global_tunnel,
    };
    let deployment = state.lifecycle.create_deployment(request).await?;
    Ok((StatusCode::ACCEPTED, Json(deployment)))
}

pub async fn list_deployments_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<DeploymentListQuery>,
) -> ApiResult<Json<ListResponse<Deployment>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DeploymentStatus>)
        .transpose()?;
    let deployments = state.lifecycle.list_deployments(status).await?;
    Ok(Json(deployments.into()))
}

pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deployment>> {
    Ok(Json(state.lifecycle.get_deployment(&id).await?))
}

pub async fn delete_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.lifecycle.delete_deployment(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn transition_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<Json<Deployment>> {
    let operation: DeploymentOperation = request.operation.parse()?;
    Ok(Json(
        state.lifecycle.transition_deployment(&id, operation).await?,
    ))
}

pub async fn deployment_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ListResponse<DeploymentLog>>> {
    Ok(Json(state.lifecycle.deployment_logs(&id).await?.into()))
}

pub async fn tunnel_info_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TunnelInfo>> {
    Ok(Json(state.lifecycle.tunnel_info(&id).await?))
}

// ================================= BACKUPS ====================================== //

pub async fn create_backup_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateBackupRequest>,
) -> ApiResult<(StatusCode, Json<Backup>)> {
    let selection = BackupSelection::from_request(request.all_deployments, request.deployment_ids);
    let defaults = BackupOptions::default();
    let options = BackupOptions {
        name: request.name.unwrap_or(defaults.name),
        include_volumes: request.include_volumes,
        encrypted: request.encrypted,
        ..defaults
    };
    let backup = state.backups.create_backup(selection, options).await?;
    Ok((StatusCode::ACCEPTED, Json(backup)))
}

pub async fn list_backups_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<ListResponse<Backup>>> {
    Ok(Json(state.backups.list_backups().await?.into()))
}

pub async fn get_backup_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Backup>> {
    Ok(Json(state.backups.get_backup(&id).await?))
}

pub async fn delete_backup_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.backups.delete_backup(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stored archive as an attachment; encrypted archives stay encrypted
pub async fn download_backup_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let (backup, bytes) = state.backups.download_backup(&id).await?;
    let (content_type, extension) = if backup.encrypted {
        ("application/octet-stream", "tar.gz.enc")
    } else {
        ("application/gzip", "tar.gz")
    };
    let disposition = format!("attachment; filename=\"backup-{}.{}\"", backup.id, extension);
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

pub async fn upload_backup_handler(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Backup>)> {
    let backup = state.backups.import_backup(&body).await?;
    Ok((StatusCode::CREATED, Json(backup)))
}

pub async fn restore_backup_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<RestoreBackupRequest>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    let request = RestoreRequest {
        selective: request.selective,
        deployment_ids: request.deployment_ids,
        overwrite_existing: request.overwrite_existing,
        restore_volumes: request.restore_volumes,
        test_restore: request.test_restore,
    };
    state.backups.restore_backup(&id, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            success: true,
            message: format!("Restore of backup {} started", id),
        }),
    ))
}

pub async fn restore_report_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RestoreReport>> {
    state.backups.get_backup(&id).await?;
    state
        .backups
        .restore_report(&id)
        .map(Json)
        .ok_or_else(|| ApiError(DockyardError::NotFound(format!("restore report for backup {}", id))))
}

// ============================= BACKUP SCHEDULES ================================= //

fn schedule_request(request: BackupScheduleRequest) -> ScheduleRequest {
    ScheduleRequest {
        name: request.name,
        cron_expression: request.cron_expression,
        include_volumes: request.include_volumes,
        encrypted: request.encrypted,
        enabled: request.enabled.unwrap_or(true),
    }
}

pub async fn create_schedule_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<BackupScheduleRequest>,
) -> ApiResult<(StatusCode, Json<BackupSchedule>)> {
    let schedule = state
        .backups
        .schedules()
        .create(schedule_request(request))
        .await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

pub async fn list_schedules_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<ListResponse<BackupSchedule>>> {
    Ok(Json(state.backups.schedules().list().await?.into()))
}

pub async fn get_schedule_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<BackupSchedule>> {
    Ok(Json(state.backups.schedules().get(&id).await?))
}

pub async fn update_schedule_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(request): Json<BackupScheduleRequest>,
) -> ApiResult<Json<BackupSchedule>> {
    Ok(Json(
        state
            .backups
            .schedules()
            .update(&id, schedule_request(request))
            .await?,
    ))
}

pub async fn delete_schedule_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.backups.schedules().delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================== GLOBAL TUNNEL =================================== //

/// Saved credentials with the secret masked
pub async fn get_tunnel_config_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<GlobalTunnelConfig>> {
    let config = state
        .lifecycle
        .global_tunnel_config()
        .await?
        .ok_or_else(|| DockyardError::NotFound("global tunnel configuration".to_string()))?;
    Ok(Json(GlobalTunnelConfig {
        credentials: config.credentials.masked(),
        updated_at: config.updated_at,
    }))
}

pub async fn set_tunnel_config_handler(
    State(state): State<Arc<ServerState>>,
    Json(credentials): Json<TunnelCredentials>,
) -> ApiResult<Json<GlobalTunnelConfig>> {
    let config = state
        .lifecycle
        .set_global_tunnel_config(tunnel_config(credentials))
        .await?;
    Ok(Json(GlobalTunnelConfig {
        credentials: config.credentials.masked(),
        updated_at: config.updated_at,
    }))
}

pub async fn validate_tunnel_config_handler(
    Json(credentials): Json<TunnelCredentials>,
) -> Json<TunnelValidationResponse> {
    let issues = tunnel_config(credentials).issues();
    Json(TunnelValidationResponse {
        valid: issues.is_empty(),
        issues,
    })
}

pub async fn tunnel_status_handler(
    State(state): State<Arc<ServerState>>,
) -> ApiResult<Json<TunnelStatus>> {
    Ok(Json(state.lifecycle.tunnel_status().await?))
}

// ================================= COMPOSE ====================================== //

/// Preview response
#[derive(Debug, Serialize)]
pub struct ComposePreviewResponse {
    /// Validation of the document as submitted
    pub report: ValidationReport,
    pub changes: ChangeSummary,
}

pub async fn compose_inject_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ComposeRequest>,
) -> ApiResult<Json<ComposeInjectResponse<ValidationReport>>> {
    let tunnel = tunnel_config(request.tunnel);
    tunnel.validate()?;
    let injector = TunnelInjector::new(state.injector.clone(), tunnel);
    let (compose, report) = injector.inject_source(&request.compose)?;
    Ok(Json(ComposeInjectResponse { compose, report }))
}

pub async fn compose_preview_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ComposeRequest>,
) -> ApiResult<Json<ComposePreviewResponse>> {
    let tunnel = tunnel_config(request.tunnel);
    tunnel.validate()?;
    let injector = TunnelInjector::new(state.injector.clone(), tunnel);
    let doc = ComposeDocument::parse(&request.compose)?;
    Ok(Json(ComposePreviewResponse {
        report: injector.validate(&doc),
        changes: injector.preview(&doc),
    }))
}
