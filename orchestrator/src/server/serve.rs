//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::OrchestratorError;
use crate::server::handlers::{
    app_exec_handler, app_instance_handler, app_logs_handler, app_status_handler,
    create_app_handler, create_backup_handler, create_database_handler, create_host_handler,
    database_action_handler, delete_app_handler, delete_backup_handler, delete_database_handler,
    deploy_handler, events_handler, get_backup_handler, get_database_handler, get_host_handler,
    health_handler, host_health_handler, list_apps_handler, list_backups_handler,
    list_databases_handler, list_hosts_handler, provision_host_handler, restore_backup_handler,
    rollback_handler, version_handler,
};
use crate::server::state::ServerState;

/// Control API routes
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Hosts
        .route("/hosts", get(list_hosts_handler).post(create_host_handler))
        .route("/hosts/{id}", get(get_host_handler))
        .route("/hosts/{id}/provision", post(provision_host_handler))
        .route("/hosts/{id}/health", post(host_health_handler))
        // Apps
        .route("/apps", get(list_apps_handler).post(create_app_handler))
        .route("/apps/{id}", delete(delete_app_handler))
        .route("/apps/{id}/deploy", post(deploy_handler))
        .route("/apps/{id}/rollback", post(rollback_handler))
        .route("/apps/{id}/status", get(app_status_handler))
        .route("/apps/{id}/logs", get(app_logs_handler))
        .route("/apps/{id}/exec", post(app_exec_handler))
        .route("/apps/{id}/instance/{action}", post(app_instance_handler))
        // Databases
        .route("/databases", get(list_databases_handler).post(create_database_handler))
        .route(
            "/databases/{id}",
            get(get_database_handler).delete(delete_database_handler),
        )
        .route("/databases/{id}/{action}", post(database_action_handler))
        // Backups
        .route("/backups", get(list_backups_handler).post(create_backup_handler))
        .route(
            "/backups/{id}",
            get(get_backup_handler).delete(delete_backup_handler),
        )
        .route("/backups/{id}/restore", post(restore_backup_handler))
        // Event streams
        .route("/events/{kind}/{id}", get(events_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), OrchestratorError>>, OrchestratorError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting control API on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| OrchestratorError::ServerError(e.to_string()))
    });

    Ok(handle)
}
