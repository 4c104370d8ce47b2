//! Managed database models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::store::Record;

/// Closed set of supported engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    MongoDb,
    Postgres,
    MySql,
    Redis,
    Minio,
}

impl DbEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbEngine::MongoDb => "mongodb",
            DbEngine::Postgres => "postgres",
            DbEngine::MySql => "mysql",
            DbEngine::Redis => "redis",
            DbEngine::Minio => "minio",
        }
    }
}

impl fmt::Display for DbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbEngine {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mongodb" | "mongo" => Ok(DbEngine::MongoDb),
            "postgres" | "postgresql" => Ok(DbEngine::Postgres),
            "mysql" => Ok(DbEngine::MySql),
            "redis" => Ok(DbEngine::Redis),
            "minio" => Ok(DbEngine::Minio),
            other => Err(OrchestratorError::ValidationError(format!(
                "Unsupported database engine: {}",
                other
            ))),
        }
    }
}

/// Database instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

/// Generated credentials. The password never leaves the vault in clear form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbCredentials {
    pub username: String,
    pub encrypted_password: String,
    pub database: String,
}

/// A provisioned database instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedDatabase {
    pub id: String,
    pub name: String,
    pub engine: DbEngine,
    pub version: String,

    /// Absent means the orchestrator's own engine
    pub host_id: Option<String>,
    pub credentials: DbCredentials,

    /// Sealed; assembled from the generated credentials
    pub encrypted_connection_string: String,
    pub port: u16,
    pub instance_id: String,
    pub volume_path: String,
    pub domain: Option<String>,
    pub status: DatabaseStatus,
    pub created_at: DateTime<Utc>,
}

impl Record for ManagedDatabase {
    const COLLECTION: &'static str = "databases";

    fn id(&self) -> &str {
        &self.id
    }
}
