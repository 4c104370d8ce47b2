//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use tempfile::TempDir;

use dockhand::backup::BackupOrchestrator;
use dockhand::database::{DatabaseOptions, DatabaseProvisioner};
use dockhand::deploy::{DeployOptions, DeployOrchestrator};
use dockhand::errors::OrchestratorError;
use dockhand::events::{EventBus, LogStream};
use dockhand::filesys::dir::Dir;
use dockhand::models::host::{
    AuthMethod, Capability, ConnectionInfo, HealthStatus, Host, OsFamily, ProvisioningStatus,
};
use dockhand::provision::ProvisioningEngine;
use dockhand::proxy::ProxyConfigurator;
use dockhand::remote::{ExecOutput, Shell, ShellProvider};
use dockhand::runtime::PollOptions;
use dockhand::scm::SourceControl;
use dockhand::storage::settings::ProxySettings;
use dockhand::store::{MemoryStore, MetadataStore, Record, Repository};
use dockhand::vault::{AesGcmCipher, CredentialVault};

pub const COMMIT: &str = "4f2c9e1a7b3d5f60718293a4b5c6d7e8f9012345";

enum Matcher {
    Contains(String),
    StartsWith(String),
}

impl Matcher {
    fn matches(&self, command: &str) -> bool {
        match self {
            Matcher::Contains(s) => command.contains(s.as_str()),
            Matcher::StartsWith(s) => command.starts_with(s.as_str()),
        }
    }
}

struct Rule {
    matcher: Matcher,
    output: ExecOutput,
}

/// A shell answering commands from scripted rules. The most recently added
/// matching rule wins; unmatched commands succeed with no output.
pub struct ScriptedShell {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    pushed: Mutex<Vec<String>>,
    remote: bool,
}

impl ScriptedShell {
    fn new(remote: bool) -> Arc<Self> {
        Arc::new(Self {
            rules: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            pushed: Mutex::new(Vec::new()),
            remote,
        })
    }

    pub fn local() -> Arc<Self> {
        Self::new(false)
    }

    pub fn remote() -> Arc<Self> {
        Self::new(true)
    }

    fn add(&self, matcher: Matcher, output: ExecOutput) {
        self.rules.lock().unwrap().push(Rule { matcher, output });
    }

    /// Answer commands containing `pattern` with `stdout`
    pub fn on(&self, pattern: &str, stdout: &str) {
        self.add(
            Matcher::Contains(pattern.to_string()),
            ExecOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            },
        );
    }

    /// Answer commands starting with `prefix` with `stdout`
    pub fn on_start(&self, prefix: &str, stdout: &str) {
        self.add(
            Matcher::StartsWith(prefix.to_string()),
            ExecOutput {
                stdout: stdout.to_string(),
                ..Default::default()
            },
        );
    }

    /// Fail commands containing `pattern`
    pub fn fail(&self, pattern: &str, exit_code: i32, stderr: &str) {
        self.add(
            Matcher::Contains(pattern.to_string()),
            ExecOutput {
                stderr: stderr.to_string(),
                exit_code,
                ..Default::default()
            },
        );
    }

    /// Fail commands starting with `prefix`
    pub fn fail_start(&self, prefix: &str, exit_code: i32) {
        self.add(
            Matcher::StartsWith(prefix.to_string()),
            ExecOutput {
                exit_code,
                ..Default::default()
            },
        );
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.position(pattern).is_some()
    }

    /// Index of the first command containing `pattern`
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(pattern))
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(pattern)).count()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Shell for ScriptedShell {
    async fn execute(
        &self,
        command: &str,
        log: Option<&LogStream>,
    ) -> Result<ExecOutput, OrchestratorError> {
        self.commands.lock().unwrap().push(command.to_string());
        let output = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.matcher.matches(command))
            .map(|r| r.output.clone())
            .unwrap_or_default();
        if let Some(log) = log {
            for line in output.stdout.lines() {
                log.line(line);
            }
        }
        Ok(output)
    }

    async fn fetch_file(&self, remote: &str, local: &Path) -> Result<(), OrchestratorError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, format!("archive fetched from {}", remote)).await?;
        Ok(())
    }

    async fn push_file(&self, _local: &Path, remote: &str) -> Result<(), OrchestratorError> {
        self.pushed.lock().unwrap().push(remote.to_string());
        Ok(())
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    fn describe(&self) -> String {
        if self.remote {
            "deploy@10.0.0.5".to_string()
        } else {
            "local".to_string()
        }
    }
}

/// Hands out the same scripted shell for every host
pub struct FakeShells {
    shell: Arc<ScriptedShell>,
    requested: Mutex<Vec<Option<String>>>,
}

impl FakeShells {
    pub fn new(shell: Arc<ScriptedShell>) -> Arc<Self> {
        Arc::new(Self {
            shell,
            requested: Mutex::new(Vec::new()),
        })
    }

    /// Host ids shells were requested for, `None` for the local machine
    pub fn requested(&self) -> Vec<Option<String>> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl ShellProvider for FakeShells {
    async fn shell(&self, host: Option<&Host>) -> Result<Arc<dyn Shell>, OrchestratorError> {
        self.requested
            .lock()
            .unwrap()
            .push(host.map(|h| h.id.clone()));
        Ok(self.shell.clone())
    }
}

/// Source control that knows every repository as public on `main`
pub struct FakeScm;

#[async_trait]
impl SourceControl for FakeScm {
    async fn list_branches(&self, _repo_url: &str) -> Result<Vec<String>, OrchestratorError> {
        Ok(vec!["main".to_string(), "develop".to_string()])
    }

    async fn default_branch(&self, _repo_url: &str) -> Result<String, OrchestratorError> {
        Ok("main".to_string())
    }

    async fn is_private(&self, _repo_url: &str) -> Result<bool, OrchestratorError> {
        Ok(false)
    }

    async fn access_token(&self) -> Result<Option<SecretString>, OrchestratorError> {
        Ok(None)
    }
}

pub fn fast_poll() -> PollOptions {
    PollOptions {
        interval: Duration::from_millis(5),
        timeout: Duration::from_millis(100),
    }
}

/// Every component wired to one in-memory store and one scripted shell
pub struct Harness {
    pub store: Arc<dyn MetadataStore>,
    pub events: EventBus,
    pub vault: CredentialVault,
    pub shell: Arc<ScriptedShell>,
    pub shells: Arc<FakeShells>,
    pub proxy: Arc<ProxyConfigurator>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(shell: Arc<ScriptedShell>) -> Self {
        let cipher = AesGcmCipher::new(&[7u8; 32]).unwrap();
        Self {
            store: Arc::new(MemoryStore::new()),
            events: EventBus::new(),
            vault: CredentialVault::new(Arc::new(cipher)),
            shells: FakeShells::new(shell.clone()),
            shell,
            proxy: Arc::new(ProxyConfigurator::new(ProxySettings::default())),
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn repo<T: Record>(&self) -> Repository<T> {
        Repository::new(self.store.clone())
    }

    pub fn deployer(&self) -> DeployOrchestrator {
        DeployOrchestrator::new(
            self.repo(),
            self.repo(),
            self.shells.clone(),
            self.proxy.clone(),
            Arc::new(FakeScm),
            self.events.clone(),
            DeployOptions {
                local_repos_dir: self.dir.path().join("repos"),
                poll: fast_poll(),
                ..Default::default()
            },
        )
    }

    pub fn provisioning(&self) -> ProvisioningEngine {
        ProvisioningEngine::new(
            self.repo(),
            self.shells.clone(),
            self.vault.clone(),
            self.events.clone(),
        )
    }

    pub fn databases(&self) -> DatabaseProvisioner {
        DatabaseProvisioner::new(
            self.repo(),
            self.repo(),
            self.shells.clone(),
            self.vault.clone(),
            self.proxy.clone(),
            self.events.clone(),
            DatabaseOptions {
                local_root: self.dir.path().join("databases"),
                poll: fast_poll(),
                ..Default::default()
            },
        )
    }

    pub fn backup_dir(&self) -> Dir {
        Dir::new(self.dir.path().join("backups"))
    }

    pub fn backups(&self) -> BackupOrchestrator {
        BackupOrchestrator::new(
            self.repo(),
            self.repo(),
            self.repo(),
            self.repo(),
            self.shells.clone(),
            None,
            self.events.clone(),
            self.backup_dir(),
        )
    }

    /// Store a provisioned Ubuntu host
    pub async fn ready_host(&self) -> Host {
        let host = Host {
            id: "host-1".to_string(),
            name: "web-1".to_string(),
            connection: ConnectionInfo {
                address: "10.0.0.5".to_string(),
                port: 22,
                user: "deploy".to_string(),
                auth_method: AuthMethod::Password,
                encrypted_secret: self.vault.seal("hunter2").unwrap(),
            },
            provisioning_status: ProvisioningStatus::Ready,
            provisioning_progress: 100,
            provisioning_log: Vec::new(),
            os_family: Some(OsFamily::Ubuntu),
            os_version: Some("22.04".to_string()),
            capabilities: Capability::ALL.into_iter().map(|c| (c, true)).collect::<BTreeMap<_, _>>(),
            health: HealthStatus::Healthy,
            last_health_check: Some(Utc::now()),
            created_at: Utc::now(),
        };
        self.repo::<Host>().put(&host).await.unwrap();
        host
    }
}
