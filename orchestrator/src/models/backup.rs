//! Backup models and status machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::store::Record;

/// What a backup captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Database,
    App,
    CompositeApp,
}

/// Where the archive is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    LocalOnly,
    Uploaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Creating,
    Completed,
    Failed,
    Restoring,
}

impl BackupStatus {
    /// Allowed moves: creating to completed or failed, completed to restoring,
    /// restoring back to completed or to failed.
    pub fn transition(self, next: BackupStatus) -> Result<BackupStatus, OrchestratorError> {
        use BackupStatus::*;
        match (self, next) {
            (Creating, Completed) | (Creating, Failed) => Ok(next),
            (Completed, Restoring) => Ok(next),
            (Restoring, Completed) | (Restoring, Failed) => Ok(next),
            (from, to) => Err(OrchestratorError::InvalidTransition(format!(
                "backup cannot move from {:?} to {:?}",
                from, to
            ))),
        }
    }
}

/// A backup record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub kind: BackupKind,

    /// App id or database id
    pub subject_id: String,
    pub status: BackupStatus,
    pub storage_mode: StorageMode,
    pub local_path: Option<String>,
    pub remote_key: Option<String>,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Backup {
    pub fn set_status(&mut self, next: BackupStatus) -> Result<(), OrchestratorError> {
        self.status = self.status.transition(next)?;
        Ok(())
    }
}

impl Record for Backup {
    const COLLECTION: &'static str = "backups";

    fn id(&self) -> &str {
        &self.id
    }
}
