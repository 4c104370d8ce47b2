//! Control API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Returned by long operations that continue in the background
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub operation: String,
    pub subject_id: String,

    /// Server-sent event stream following the operation
    pub events_url: String,
    pub accepted_at: DateTime<Utc>,
}

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,

    /// Present when a failed deploy reports what happened to the old instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<String>,
}

/// Deploy request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
}

/// Rollback request. Without an index the previous instance is swapped back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub deployment_index: Option<usize>,
    #[serde(default)]
    pub operator: Option<String>,
}

/// Command to run in an app's current instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// App status with the observed state of its current instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatusResponse {
    pub app_id: String,
    pub status: String,
    pub instance_id: Option<String>,
    pub instance_state: String,
    pub can_fast_rollback: bool,
    pub update_available: bool,
    pub latest_upstream_commit: Option<String>,
}

/// Query of the logs endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub app_id: String,

    /// `None` when the app has no instance to read from
    pub logs: Option<String>,
}

/// Managed database creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDatabaseRequest {
    pub name: String,
    pub engine: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Backup creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBackupRequest {
    /// `database`, `app` or `composite_app`
    pub kind: String,
    pub subject_id: String,
}
