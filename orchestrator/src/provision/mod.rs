//! Host provisioning
//!
//! Turns a registered host into a deploy target: detects the OS, runs the
//! matching install script while streaming its progress, then verifies every
//! required capability before marking the host `ready`.

pub mod os;
pub mod progress;
pub mod script;

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::errors::OrchestratorError;
use crate::events::{EventBus, EventKind, LogStream, Topic};
use crate::models::host::{
    AuthMethod, Capability, ConnectionInfo, HealthStatus, Host, OsFamily, ProvisioningStatus,
};
use crate::remote::{Shell, ShellProvider};
use crate::store::Repository;
use crate::utils::generate_id;
use crate::vault::CredentialVault;

use self::os::parse_os_release;
use self::progress::{is_done, parse_progress};
use self::script::{capability_probe, install_script};

/// Registration request for a new host
#[derive(Debug, Deserialize)]
pub struct NewHost {
    pub name: String,
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub auth_method: AuthMethod,
    pub secret: SecretString,
}

fn default_ssh_port() -> u16 {
    22
}

fn validate_new_host(host: &NewHost) -> Result<(), OrchestratorError> {
    static USER_RE: OnceLock<Option<Regex>> = OnceLock::new();

    if host.address.is_empty()
        || !host
            .address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ".-:_".contains(c))
    {
        return Err(OrchestratorError::ValidationError(format!(
            "Invalid host address: '{}'",
            host.address
        )));
    }
    if host.port == 0 {
        return Err(OrchestratorError::ValidationError(
            "SSH port must be non-zero".to_string(),
        ));
    }
    let user_ok = USER_RE
        .get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").ok())
        .as_ref()
        .map(|re| re.is_match(&host.user))
        .unwrap_or(false);
    if !user_ok {
        return Err(OrchestratorError::ValidationError(format!(
            "Invalid SSH user: '{}'",
            host.user
        )));
    }
    Ok(())
}

pub struct ProvisioningEngine {
    hosts: Repository<Host>,
    shells: Arc<dyn ShellProvider>,
    vault: CredentialVault,
    events: EventBus,
}

impl ProvisioningEngine {
    pub fn new(
        hosts: Repository<Host>,
        shells: Arc<dyn ShellProvider>,
        vault: CredentialVault,
        events: EventBus,
    ) -> Self {
        Self {
            hosts,
            shells,
            vault,
            events,
        }
    }

    /// Validate and store a `pending` host with its secret sealed
    pub async fn register_host(&self, new_host: NewHost) -> Result<Host, OrchestratorError> {
        validate_new_host(&new_host)?;

        let host = Host {
            id: generate_id(),
            name: new_host.name,
            connection: ConnectionInfo {
                address: new_host.address,
                port: new_host.port,
                user: new_host.user,
                auth_method: new_host.auth_method,
                encrypted_secret: self.vault.seal_secret(&new_host.secret)?,
            },
            provisioning_status: ProvisioningStatus::Pending,
            provisioning_progress: 0,
            provisioning_log: Vec::new(),
            os_family: None,
            os_version: None,
            capabilities: BTreeMap::new(),
            health: HealthStatus::Unknown,
            last_health_check: None,
            created_at: Utc::now(),
        };
        self.hosts.put(&host).await?;
        info!("Registered host {} ({})", host.name, host.id);
        Ok(host)
    }

    /// Drive a host to `ready`. Failures leave it in `error`; re-invoking retries.
    pub async fn provision(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        let host = self
            .hosts
            .update(host_id, |h| {
                if h.provisioning_status == ProvisioningStatus::Provisioning {
                    return Err(OrchestratorError::InvalidTransition(format!(
                        "host {} is already provisioning",
                        h.id
                    )));
                }
                h.provisioning_status = ProvisioningStatus::Provisioning;
                h.provisioning_progress = 0;
                Ok(())
            })
            .await?;
        self.events
            .status(Topic::Host, host_id, ProvisioningStatus::Provisioning);
        info!("Provisioning host {} ({})", host.name, host.id);

        match self.run_provisioning(&host).await {
            Ok(()) => {
                let host = self
                    .hosts
                    .update(host_id, |h| {
                        h.provisioning_status = ProvisioningStatus::Ready;
                        h.provisioning_progress = 100;
                        Ok(())
                    })
                    .await?;
                self.events.status(Topic::Host, host_id, ProvisioningStatus::Ready);
                info!("Host {} is ready", host_id);
                Ok(host)
            }
            Err(e) => {
                error!("Provisioning host {} failed: {}", host_id, e);
                let message = format!("ERROR: {}", e);
                self.hosts
                    .update(host_id, |h| {
                        h.provisioning_status = ProvisioningStatus::Error;
                        h.provisioning_log.push(message.clone());
                        Ok(())
                    })
                    .await?;
                self.events.publish(
                    Topic::Host,
                    host_id,
                    EventKind::Log { line: message },
                );
                self.events.status(Topic::Host, host_id, ProvisioningStatus::Error);
                Err(e)
            }
        }
    }

    async fn run_provisioning(&self, host: &Host) -> Result<(), OrchestratorError> {
        let shell = self.shells.shell(Some(host)).await?;

        let os_release = shell.run("cat /etc/os-release", None).await?;
        let release = parse_os_release(&os_release);
        self.hosts
            .update(&host.id, |h| {
                h.os_family = Some(release.family);
                h.os_version = release.version.clone();
                Ok(())
            })
            .await?;

        let script = install_script(release.family).ok_or_else(|| {
            OrchestratorError::ValidationError(format!(
                "Unsupported operating system on host {}",
                host.id
            ))
        })?;
        info!(
            "Host {} runs {} {}",
            host.id,
            release.family,
            release.version.as_deref().unwrap_or("")
        );

        self.run_install_script(shell.as_ref(), &host.id, &script)
            .await?;
        self.verify_capabilities(shell.as_ref(), &host.id).await
    }

    /// Run the script while a consumer applies each line to the host record.
    /// The tap sender lives inside the runner, so the consumer ends with it.
    async fn run_install_script(
        &self,
        shell: &dyn Shell,
        host_id: &str,
        script: &str,
    ) -> Result<(), OrchestratorError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let log = LogStream::new(&self.events, Topic::Host, host_id).with_tap(tx);

        let runner = async move {
            let result = shell.run(script, Some(&log)).await;
            drop(log);
            result
        };

        let consumer = async {
            let mut saw_done = false;
            while let Some(line) = rx.recv().await {
                saw_done |= is_done(&line);
                let progress = parse_progress(&line);
                if let Some(p) = &progress {
                    self.events.publish(
                        Topic::Host,
                        host_id,
                        EventKind::Progress {
                            percent: p.percent,
                            message: p.message.clone(),
                        },
                    );
                }
                let result = self
                    .hosts
                    .update(host_id, |h| {
                        h.provisioning_log.push(line);
                        if let Some(p) = progress {
                            h.provisioning_progress = p.percent;
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = result {
                    warn!("Failed to record provisioning output for {}: {}", host_id, e);
                }
            }
            saw_done
        };

        let (result, saw_done) = tokio::join!(runner, consumer);
        result?;
        if !saw_done {
            return Err(OrchestratorError::ExecutionError {
                command: "provisioning script".to_string(),
                exit_code: 0,
                output_tail: "script exited without reporting DONE".to_string(),
            });
        }
        Ok(())
    }

    async fn verify_capabilities(&self, shell: &dyn Shell, host_id: &str) -> Result<(), OrchestratorError> {
        let mut found = BTreeMap::new();
        for capability in Capability::ALL {
            let output = shell.execute(&capability_probe(capability), None).await?;
            found.insert(capability, output.success());
        }

        let host = self
            .hosts
            .update(host_id, |h| {
                h.capabilities = found;
                Ok(())
            })
            .await?;

        let missing = host.missing_capabilities();
        if missing.is_empty() {
            return Ok(());
        }
        Err(OrchestratorError::MissingCapabilities(
            missing
                .iter()
                .map(Capability::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        ))
    }

    pub async fn get_host(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        self.hosts.get(host_id).await
    }

    pub async fn list_hosts(&self) -> Result<Vec<Host>, OrchestratorError> {
        self.hosts.list().await
    }

    /// Connect and run a trivial command, recording the outcome
    pub async fn check_health(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        let host = self.hosts.get(host_id).await?;
        let health = match self.probe(&host).await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                warn!("Health check for host {} failed: {}", host_id, e);
                HealthStatus::Unreachable
            }
        };
        let host = self
            .hosts
            .update(host_id, |h| {
                h.health = health;
                h.last_health_check = Some(Utc::now());
                Ok(())
            })
            .await?;
        self.events.status(Topic::Host, host_id, health);
        Ok(host)
    }

    async fn probe(&self, host: &Host) -> Result<(), OrchestratorError> {
        let shell = self.shells.shell(Some(host)).await?;
        shell.run("true", None).await?;
        Ok(())
    }

    /// Require a provisioned host for placement. `None` is the local engine.
    pub async fn require_ready(&self, host_id: Option<&str>) -> Result<Option<Host>, OrchestratorError> {
        ready_host(&self.hosts, host_id).await
    }
}

/// Look up a placement target, rejecting hosts that are not `ready`.
/// `None` stands for the orchestrator's own engine.
pub async fn ready_host(
    hosts: &Repository<Host>,
    host_id: Option<&str>,
) -> Result<Option<Host>, OrchestratorError> {
    let Some(host_id) = host_id else {
        return Ok(None);
    };
    let host = hosts.get(host_id).await?;
    if !host.is_ready() {
        return Err(OrchestratorError::ValidationError(format!(
            "host {} is not ready (status: {:?})",
            host_id, host.provisioning_status
        )));
    }
    if host.os_family == Some(OsFamily::Unknown) {
        return Err(OrchestratorError::ValidationError(format!(
            "host {} has an unsupported OS",
            host_id
        )));
    }
    Ok(Some(host))
}
