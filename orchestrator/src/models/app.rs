//! App and deployment models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Record;

/// Where an app's source lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub repo_url: String,
    pub branch: String,

    /// Private repositories get the provider token embedded at fetch time
    #[serde(default)]
    pub private: bool,
}

/// App lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Inactive,
    Deploying,
    Active,
    Error,
}

/// Outcome of a deployment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Success,
    Failed,
}

/// Immutable record of one deploy attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// `v<N>`, one-based
    pub version: String,
    pub branch: String,

    /// Empty when the deploy failed before the commit was resolved
    pub commit: String,
    pub deployed_at: DateTime<Utc>,
    pub status: DeploymentStatus,
    pub logs: String,
    pub operator: String,

    /// Absent if the deploy failed before an instance existed
    pub instance_id: Option<String>,
}

/// A deployable unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,

    /// Absent means the app runs on the orchestrator's own engine
    pub host_id: Option<String>,
    pub source: SourceRef,
    pub domain: Option<String>,
    pub port: u16,

    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,

    pub current_instance_id: Option<String>,
    pub previous_instance_id: Option<String>,
    pub status: AppStatus,

    #[serde(default)]
    pub deployments: Vec<Deployment>,

    #[serde(default)]
    pub update_available: bool,
    pub latest_upstream_commit: Option<String>,
    pub last_update_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl App {
    /// Docker image repository for this app (lowercase, registry-safe)
    pub fn image_repo(&self) -> String {
        let sanitized: String = self
            .id
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!("dockhand-{}", sanitized)
    }

    /// Label value identifying every container that belongs to this app
    pub fn instance_label(&self) -> String {
        format!("dockhand.app={}", self.id)
    }

    /// Commit of the most recent successful deployment
    pub fn deployed_commit(&self) -> Option<&str> {
        self.deployments
            .iter()
            .rev()
            .find(|d| d.status == DeploymentStatus::Success)
            .map(|d| d.commit.as_str())
    }

    pub fn next_version(&self) -> String {
        format!("v{}", self.deployments.len() + 1)
    }

    pub fn can_fast_rollback(&self) -> bool {
        self.previous_instance_id.is_some()
    }

    /// Recompute the update flag after `commit` went live
    pub fn refresh_update_flag(&mut self, commit: &str) {
        self.update_available = self
            .latest_upstream_commit
            .as_deref()
            .is_some_and(|latest| latest != commit);
    }
}

impl Record for App {
    const COLLECTION: &'static str = "apps";

    fn id(&self) -> &str {
        &self.id
    }
}
