//! Host models

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Record;

/// How the orchestrator authenticates to a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    PrivateKey,
}

/// Remote shell connection details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub address: String,
    pub port: u16,
    pub user: String,
    pub auth_method: AuthMethod,

    /// Password or private key, sealed by the credential vault
    pub encrypted_secret: String,
}

/// Provisioning lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningStatus {
    Pending,
    Provisioning,
    Ready,
    Error,
}

/// Supported OS variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Ubuntu,
    Debian,
    Centos,
    Rhel,
    Unknown,
}

impl OsFamily {
    pub fn is_debian_like(&self) -> bool {
        matches!(self, OsFamily::Ubuntu | OsFamily::Debian)
    }

    pub fn is_redhat_like(&self) -> bool {
        matches!(self, OsFamily::Centos | OsFamily::Rhel)
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OsFamily::Ubuntu => "ubuntu",
            OsFamily::Debian => "debian",
            OsFamily::Centos => "centos",
            OsFamily::Rhel => "rhel",
            OsFamily::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Capabilities a host must have before it can be `ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ContainerEngine,
    ComposeTool,
    VcsClient,
    LanguageRuntime,
    Directories,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::ContainerEngine,
        Capability::ComposeTool,
        Capability::VcsClient,
        Capability::LanguageRuntime,
        Capability::Directories,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::ContainerEngine => "container_engine",
            Capability::ComposeTool => "compose_tool",
            Capability::VcsClient => "vcs_client",
            Capability::LanguageRuntime => "language_runtime",
            Capability::Directories => "directories",
        };
        f.write_str(name)
    }
}

/// Last observed reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unreachable,
}

/// A registered deploy target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub connection: ConnectionInfo,
    pub provisioning_status: ProvisioningStatus,
    pub provisioning_progress: u8,

    /// Append-only
    #[serde(default)]
    pub provisioning_log: Vec<String>,

    pub os_family: Option<OsFamily>,
    pub os_version: Option<String>,

    #[serde(default)]
    pub capabilities: BTreeMap<Capability, bool>,

    #[serde(default)]
    pub health: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Host {
    pub fn is_ready(&self) -> bool {
        self.provisioning_status == ProvisioningStatus::Ready
    }

    pub fn missing_capabilities(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| !self.capabilities.get(c).copied().unwrap_or(false))
            .collect()
    }
}

impl Record for Host {
    const COLLECTION: &'static str = "hosts";

    fn id(&self) -> &str {
        &self.id
    }
}
