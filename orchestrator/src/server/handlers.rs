//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use openapi_server::models::{
    AcceptedResponse, AppStatusResponse, CreateBackupRequest, CreateDatabaseRequest,
    DeployRequest as DeployBody, ExecRequest, ExecResponse, HealthResponse, LogsQuery,
    LogsResponse, RollbackRequest, VersionResponse,
};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

use crate::backup::NewBackup;
use crate::database::{DatabaseAction, NewDatabase};
use crate::deploy::{DeployRequest, NewApp};
use crate::errors::OrchestratorError;
use crate::events::{Event, Topic};
use crate::models::app::AppStatus;
use crate::models::backup::{BackupKind, BackupStatus};
use crate::models::host::ProvisioningStatus;
use crate::provision::NewHost;
use crate::server::error::ApiError;
use crate::server::state::ServerState;
use crate::utils::version_info;

type ApiResult<T> = Result<T, ApiError>;

const DEFAULT_LOG_TAIL: usize = 200;
const DEFAULT_OPERATOR: &str = "api";

fn accepted(operation: &str, topic: Topic, subject_id: &str) -> (StatusCode, Json<AcceptedResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            operation: operation.to_string(),
            subject_id: subject_id.to_string(),
            events_url: format!("/events/{}/{}", topic, subject_id),
            accepted_at: Utc::now(),
        }),
    )
}

/// Serde name of a unit enum variant
fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn operator(operator: Option<String>) -> String {
    operator.unwrap_or_else(|| DEFAULT_OPERATOR.to_string())
}

// ================================= SERVICE ====================================== //

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "dockhand".to_string(),
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

// ================================== HOSTS ======================================= //

pub async fn create_host_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<NewHost>,
) -> ApiResult<impl IntoResponse> {
    let host = state.provisioning.register_host(body).await?;
    Ok((StatusCode::CREATED, Json(host)))
}

pub async fn list_hosts_handler(State(state): State<Arc<ServerState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.provisioning.list_hosts().await?))
}

pub async fn get_host_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.provisioning.get_host(&id).await?))
}

pub async fn provision_host_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let host = state.provisioning.get_host(&id).await?;
    if host.provisioning_status == ProvisioningStatus::Provisioning {
        return Err(OrchestratorError::InvalidTransition(format!(
            "host {} is already provisioning",
            id
        ))
        .into());
    }

    let provisioning = state.provisioning.clone();
    let host_id = id.clone();
    tokio::spawn(async move {
        if let Err(e) = provisioning.provision(&host_id).await {
            error!("Provisioning of host {} failed: {}", host_id, e);
        }
    });
    Ok(accepted("provision", Topic::Host, &id))
}

pub async fn host_health_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.provisioning.check_health(&id).await?))
}

// =================================== APPS ======================================= //

pub async fn create_app_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<NewApp>,
) -> ApiResult<impl IntoResponse> {
    let app = state.deployer.register_app(body).await?;
    Ok((StatusCode::CREATED, Json(app)))
}

pub async fn list_apps_handler(State(state): State<Arc<ServerState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.deployer.list_apps().await?))
}

pub async fn delete_app_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let Some(_guard) = state.try_lock_app(&id).await else {
        return Err(busy(&id));
    };
    state.deployer.delete_app(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn busy(app_id: &str) -> ApiError {
    OrchestratorError::InvalidTransition(format!("app {} has an operation in progress", app_id)).into()
}

pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Option<Json<DeployBody>>,
) -> ApiResult<impl IntoResponse> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let Some(guard) = state.try_lock_app(&id).await else {
        return Err(busy(&id));
    };
    let app = state.deployer.get_app(&id).await?;
    if app.status == AppStatus::Deploying {
        return Err(busy(&id));
    }

    let request = DeployRequest {
        branch: body.branch,
        commit: body.commit,
        operator: operator(body.operator),
    };
    let deployer = state.deployer.clone();
    let app_id = id.clone();
    tokio::spawn(async move {
        let _guard = guard;
        match deployer.deploy(&app_id, request).await {
            Ok(deployment) => info!("Deployed {} of app {}", deployment.version, app_id),
            Err(e) => error!("Deploy of app {} failed: {}", app_id, e),
        }
    });
    Ok(accepted("deploy", Topic::App, &id))
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Option<Json<RollbackRequest>>,
) -> ApiResult<impl IntoResponse> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let Some(guard) = state.try_lock_app(&id).await else {
        return Err(busy(&id));
    };
    let operator = operator(body.operator);

    match body.deployment_index {
        // Swapping instances is quick enough to answer inline
        None => {
            let app = state.deployer.rollback(&id, None, &operator).await?;
            drop(guard);
            Ok(Json(app).into_response())
        }
        Some(index) => {
            let app = state.deployer.get_app(&id).await?;
            if index >= app.deployments.len() {
                return Err(OrchestratorError::NotFound(format!(
                    "deployment #{} of app {}",
                    index, id
                ))
                .into());
            }
            let deployer = state.deployer.clone();
            let app_id = id.clone();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = deployer.rollback(&app_id, Some(index), &operator).await {
                    error!("Rollback of app {} failed: {}", app_id, e);
                }
            });
            Ok(accepted("rollback", Topic::App, &id).into_response())
        }
    }
}

pub async fn app_status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let app = state.deployer.get_app(&id).await?;
    let instance_state = match state.deployer.instance_state(&id).await {
        Ok(s) => s.to_string(),
        Err(e) => {
            debug!("Instance state of app {} unavailable: {}", id, e);
            "unknown".to_string()
        }
    };
    Ok(Json(AppStatusResponse {
        app_id: app.id.clone(),
        status: label(&app.status),
        instance_id: app.current_instance_id.clone(),
        instance_state,
        can_fast_rollback: app.can_fast_rollback(),
        update_available: app.update_available,
        latest_upstream_commit: app.latest_upstream_commit.clone(),
    }))
}

pub async fn app_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL);
    let logs = state.deployer.logs(&id, tail).await?;
    Ok(Json(LogsResponse { app_id: id, logs }))
}

pub async fn app_exec_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(body): Json<ExecRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.command.trim().is_empty() {
        return Err(OrchestratorError::ValidationError("empty command".to_string()).into());
    }
    let output = state.deployer.exec(&id, &body.command).await?.ok_or_else(|| {
        OrchestratorError::NotFound(format!("app {} has no running instance", id))
    })?;
    Ok(Json(ExecResponse {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.exit_code,
    }))
}

pub async fn app_instance_handler(
    State(state): State<Arc<ServerState>>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let Some(_guard) = state.try_lock_app(&id).await else {
        return Err(busy(&id));
    };
    match action.as_str() {
        "start" => state.deployer.start_instance(&id).await?,
        "stop" => state.deployer.stop_instance(&id).await?,
        "restart" => state.deployer.restart_instance(&id).await?,
        "prune" => {
            let removed = state.deployer.prune_instances(&id).await?;
            return Ok(Json(removed).into_response());
        }
        other => {
            return Err(OrchestratorError::ValidationError(format!(
                "unknown instance action: {}",
                other
            ))
            .into())
        }
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ================================ DATABASES ===================================== //

pub async fn create_database_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateDatabaseRequest>,
) -> ApiResult<impl IntoResponse> {
    let database = state
        .databases
        .register(NewDatabase {
            name: body.name,
            engine: body.engine,
            version: body.version,
            host_id: body.host_id,
            domain: body.domain,
        })
        .await?;

    let databases = state.databases.clone();
    let id = database.id.clone();
    tokio::spawn(async move {
        if let Err(e) = databases.provision(&id).await {
            error!("Provisioning of database {} failed: {}", id, e);
        }
    });
    Ok(accepted("create_database", Topic::Database, &database.id))
}

pub async fn list_databases_handler(State(state): State<Arc<ServerState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.databases.list().await?))
}

pub async fn get_database_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.databases.get(&id).await?))
}

pub async fn database_action_handler(
    State(state): State<Arc<ServerState>>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let action: DatabaseAction = action.parse()?;
    Ok(Json(state.databases.control(&id, action).await?))
}

pub async fn delete_database_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.databases.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ================================= BACKUPS ====================================== //

fn parse_backup_kind(kind: &str) -> Result<BackupKind, OrchestratorError> {
    serde_json::from_value(serde_json::Value::String(kind.to_string()))
        .map_err(|_| OrchestratorError::ValidationError(format!("unknown backup kind: {}", kind)))
}

pub async fn create_backup_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateBackupRequest>,
) -> ApiResult<impl IntoResponse> {
    let kind = parse_backup_kind(&body.kind)?;
    let backup = state
        .backups
        .begin(NewBackup {
            kind,
            subject_id: body.subject_id,
        })
        .await?;

    let backups = state.backups.clone();
    let id = backup.id.clone();
    tokio::spawn(async move {
        if let Err(e) = backups.complete(&id).await {
            error!("Backup {} failed: {}", id, e);
        }
    });
    Ok(accepted("backup", Topic::Backup, &backup.id))
}

pub async fn list_backups_handler(State(state): State<Arc<ServerState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.backups.list().await?))
}

pub async fn get_backup_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.backups.get(&id).await?))
}

pub async fn restore_backup_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let backup = state.backups.get(&id).await?;
    backup.status.transition(BackupStatus::Restoring)?;

    let backups = state.backups.clone();
    let backup_id = id.clone();
    tokio::spawn(async move {
        if let Err(e) = backups.restore(&backup_id).await {
            error!("Restore of backup {} failed: {}", backup_id, e);
        }
    });
    Ok(accepted("restore", Topic::Backup, &id))
}

pub async fn delete_backup_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.backups.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ================================== EVENTS ====================================== //

fn to_sse(event: &Event) -> SseEvent {
    let name = match &event.kind {
        crate::events::EventKind::Log { .. } => "log",
        crate::events::EventKind::Progress { .. } => "progress",
        crate::events::EventKind::Status { .. } => "status",
    };
    match SseEvent::default().event(name).json_data(event) {
        Ok(sse) => sse,
        Err(e) => SseEvent::default().event("error").data(e.to_string()),
    }
}

/// Server-sent events for one subject until the client leaves or the
/// server shuts down
pub async fn events_handler(
    State(state): State<Arc<ServerState>>,
    Path((kind, id)): Path<(String, String)>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let topic: Topic = kind
        .parse()
        .map_err(|e: String| OrchestratorError::ValidationError(e))?;
    let receiver = state.events.subscribe(topic, &id);
    let mut shutdown_rx = state.shutdown_receiver();

    let events = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((Ok(to_sse(&event)), receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backup_kind() {
        assert_eq!(parse_backup_kind("composite_app").unwrap(), BackupKind::CompositeApp);
        assert_eq!(parse_backup_kind("database").unwrap(), BackupKind::Database);
        assert!(parse_backup_kind("volume").is_err());
    }

    #[test]
    fn test_label_uses_serde_names() {
        assert_eq!(label(&AppStatus::Deploying), "deploying");
        assert_eq!(label(&BackupKind::CompositeApp), "composite_app");
    }

    #[test]
    fn test_accepted_points_at_event_stream() {
        let (status, Json(body)) = accepted("deploy", Topic::App, "a1");
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.events_url, "/events/app/a1");
    }
}
