//! Managed database lifecycle
//!
//! Databases run as single containers on a ready host (or the local engine)
//! with generated credentials and a dedicated volume. Everything the caller
//! supplies is validated before the first side effect.

pub mod credentials;
pub mod engine;

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::errors::OrchestratorError;
use crate::events::{EventBus, EventKind, LogStream, Topic};
use crate::models::database::{DatabaseStatus, DbCredentials, DbEngine, ManagedDatabase};
use crate::models::host::Host;
use crate::provision::ready_host;
use crate::provision::script::REMOTE_ROOT;
use crate::proxy::{validate_domain, ProxyConfigurator, Route};
use crate::remote::ShellProvider;
use crate::runtime::{DockerCli, PollOptions, RunSpec};
use crate::store::Repository;
use crate::utils::{generate_id, shell_quote, write_file_command};
use crate::vault::CredentialVault;

use self::engine::{
    assemble_connection_string, ConnectionParts, EngineProfile, GeneratedCredentials, MINIO_CONSOLE_PORT,
};

/// Label carrying the owning database id
pub const DATABASE_LABEL: &str = "dockhand.database";

/// Creation request. Credentials are never accepted from the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDatabase {
    pub name: String,

    /// Parsed against the supported engines
    pub engine: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub host_id: Option<String>,

    /// Object store only: routes `s3.<domain>` and `console.<domain>`
    #[serde(default)]
    pub domain: Option<String>,
}

/// Lifecycle actions on an existing database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseAction {
    Start,
    Stop,
    Restart,
}

impl std::str::FromStr for DatabaseAction {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(DatabaseAction::Start),
            "stop" => Ok(DatabaseAction::Stop),
            "restart" => Ok(DatabaseAction::Restart),
            other => Err(OrchestratorError::ValidationError(format!(
                "unknown database action: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Volume root on remote hosts
    pub remote_root: String,

    /// Volume root on the orchestrator's own machine
    pub local_root: PathBuf,
    pub network: String,
    pub poll: PollOptions,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            remote_root: format!("{}/databases", REMOTE_ROOT),
            local_root: PathBuf::from("/var/lib/dockhand/databases"),
            network: "dockhand".to_string(),
            poll: PollOptions::default(),
        }
    }
}

struct Validated {
    engine: DbEngine,
    profile: EngineProfile,
    version: String,
    host: Option<Host>,
}

pub struct DatabaseProvisioner {
    databases: Repository<ManagedDatabase>,
    hosts: Repository<Host>,
    shells: Arc<dyn ShellProvider>,
    vault: CredentialVault,
    proxy: Arc<ProxyConfigurator>,
    events: EventBus,
    options: DatabaseOptions,
}

fn validate_name(name: &str) -> Result<(), OrchestratorError> {
    static NAME_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let valid = NAME_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,62}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::ValidationError(format!(
            "Invalid database name: {}",
            name
        )))
    }
}

fn validate_version(version: &str) -> Result<(), OrchestratorError> {
    static VERSION_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let valid = VERSION_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(version));
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::ValidationError(format!(
            "Invalid engine version: {}",
            version
        )))
    }
}

impl DatabaseProvisioner {
    pub fn new(
        databases: Repository<ManagedDatabase>,
        hosts: Repository<Host>,
        shells: Arc<dyn ShellProvider>,
        vault: CredentialVault,
        proxy: Arc<ProxyConfigurator>,
        events: EventBus,
        options: DatabaseOptions,
    ) -> Self {
        Self {
            databases,
            hosts,
            shells,
            vault,
            proxy,
            events,
            options,
        }
    }

    fn volume_root(&self, remote: bool) -> String {
        if remote {
            self.options.remote_root.trim_end_matches('/').to_string()
        } else {
            self.options
                .local_root
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string()
        }
    }

    async fn validate(&self, request: &NewDatabase) -> Result<Validated, OrchestratorError> {
        let engine: DbEngine = request.engine.parse()?;
        let profile = EngineProfile::for_engine(engine);
        validate_name(&request.name)?;
        let version = request
            .version
            .clone()
            .unwrap_or_else(|| profile.default_version.to_string());
        validate_version(&version)?;
        if let Some(domain) = &request.domain {
            if engine != DbEngine::Minio {
                return Err(OrchestratorError::ValidationError(format!(
                    "domain routing is not supported for {}",
                    engine
                )));
            }
            validate_domain(domain)?;
        }
        let host = ready_host(&self.hosts, request.host_id.as_deref()).await?;
        Ok(Validated {
            engine,
            profile,
            version,
            host,
        })
    }

    fn routes(db: &ManagedDatabase) -> Vec<Route> {
        match (&db.domain, db.engine) {
            (Some(domain), DbEngine::Minio) => vec![
                Route::new(format!("db-{}-s3", db.id), format!("s3.{}", domain), db.port),
                Route::new(
                    format!("db-{}-console", db.id),
                    format!("console.{}", domain),
                    MINIO_CONSOLE_PORT,
                ),
            ],
            _ => Vec::new(),
        }
    }

    /// Validate and provision a new database. Returns the record in
    /// `running` state.
    pub async fn create(&self, request: NewDatabase) -> Result<ManagedDatabase, OrchestratorError> {
        let db = self.register(request).await?;
        self.provision(&db.id).await
    }

    /// Validate the request and store a `creating` record with freshly
    /// generated, sealed credentials. Nothing runs on the host yet.
    pub async fn register(&self, request: NewDatabase) -> Result<ManagedDatabase, OrchestratorError> {
        let validated = self.validate(&request).await?;

        let id = generate_id();
        let creds = credentials::generate(validated.engine, &request.name);
        let volume_path = format!("{}/{}", self.volume_root(validated.host.is_some()), id);
        let short_id: String = id.chars().take(8).collect();

        let db = ManagedDatabase {
            id: id.clone(),
            name: request.name,
            engine: validated.engine,
            version: validated.version,
            host_id: request.host_id,
            credentials: DbCredentials {
                username: creds.username,
                encrypted_password: self.vault.seal_secret(&creds.password)?,
                database: creds.database,
            },
            encrypted_connection_string: String::new(),
            port: validated.profile.port,
            instance_id: format!("dockhand-db-{}-{}", validated.engine, short_id),
            volume_path,
            domain: request.domain,
            status: DatabaseStatus::Creating,
            created_at: Utc::now(),
        };
        self.databases.put(&db).await?;
        self.events.status(Topic::Database, &id, DatabaseStatus::Creating);
        Ok(db)
    }

    /// Start the instance of a `creating` database, wait for it and store the
    /// sealed connection string
    pub async fn provision(&self, id: &str) -> Result<ManagedDatabase, OrchestratorError> {
        let db = self.databases.get(id).await?;
        if db.status != DatabaseStatus::Creating {
            return Err(OrchestratorError::InvalidTransition(format!(
                "database {} is {:?}, not creating",
                id, db.status
            )));
        }
        let log = LogStream::new(&self.events, Topic::Database, id);

        match self.launch(&db, &log).await {
            Ok(connection) => {
                let sealed = self.vault.seal(connection.expose_secret())?;
                let db = self
                    .databases
                    .update(id, move |d| {
                        d.encrypted_connection_string = sealed;
                        d.status = DatabaseStatus::Running;
                        Ok(())
                    })
                    .await?;
                log.line("Database is running");
                self.events.status(Topic::Database, id, DatabaseStatus::Running);
                info!("Created {} database {} ({})", db.engine, db.name, db.id);
                Ok(db)
            }
            Err(e) => {
                error!("Failed to create database {}: {}", id, e);
                log.line(format!("ERROR: {}", e));
                if let Err(update_err) = self
                    .databases
                    .update(id, |d| {
                        d.status = DatabaseStatus::Error;
                        Ok(())
                    })
                    .await
                {
                    warn!("Failed to mark database {} as error: {}", id, update_err);
                }
                self.events.status(Topic::Database, id, DatabaseStatus::Error);
                Err(e)
            }
        }
    }

    /// Returns the connection string of the running instance
    async fn launch(&self, db: &ManagedDatabase, log: &LogStream) -> Result<SecretString, OrchestratorError> {
        let host = ready_host(&self.hosts, db.host_id.as_deref()).await?;
        let shell = self.shells.shell(host.as_ref()).await?;
        let docker = DockerCli::new(shell.clone());
        let profile = EngineProfile::for_engine(db.engine);
        let creds = GeneratedCredentials {
            username: db.credentials.username.clone(),
            password: self.vault.open(&db.credentials.encrypted_password)?,
            database: db.credentials.database.clone(),
        };
        log.line(format!(
            "Creating {} {} on {}",
            db.engine,
            db.version,
            shell.describe()
        ));

        let data_dir = format!("{}/data", db.volume_path);
        let env_path = format!("{}/.env", db.volume_path);
        let env_contents: String = profile
            .environment(&creds)
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect();

        let prepare = format!(
            "mkdir -p {data} && touch {env} && chmod 600 {env} && {write}",
            data = shell_quote(&data_dir),
            env = shell_quote(&env_path),
            write = write_file_command(&env_path, &env_contents)
        );
        shell.run(&prepare, None).await?;

        docker.ensure_network(&self.options.network).await?;

        let mut spec = RunSpec {
            name: db.instance_id.clone(),
            image: profile.image_ref(&db.version),
            network: Some(self.options.network.clone()),
            env_file: Some(env_path),
            restart_policy: Some("unless-stopped".to_string()),
            volumes: vec![format!("{}:{}", data_dir, profile.data_dir)],
            args: profile.args(),
            ..Default::default()
        };
        spec.labels.insert(DATABASE_LABEL.to_string(), db.id.clone());

        // no host port is published: peers reach the instance by name on the
        // shared network, so databases on one host never collide on a port
        let routes = Self::routes(db);
        let strategy = if routes.is_empty() {
            None
        } else {
            let strategy = self.proxy.ensure_ready(&shell).await?;
            self.proxy.prepare_run_spec(strategy, &routes, &mut spec);
            Some(strategy)
        };

        log.progress(40, "Starting instance");
        docker.run(&spec, Some(log)).await?;
        if let Some(strategy) = strategy {
            self.proxy
                .publish(&shell, strategy, &owner_key(&db.id), &db.instance_id, &routes)
                .await?;
        }

        log.progress(80, "Waiting for instance to run");
        docker.wait_running(&db.instance_id, self.options.poll).await?;

        let connection = assemble_connection_string(&ConnectionParts {
            engine: db.engine,
            host: db.instance_id.clone(),
            port: db.port,
            username: creds.username,
            password: creds.password,
            database: creds.database,
        })?;
        Ok(SecretString::from(connection))
    }

    pub async fn get(&self, id: &str) -> Result<ManagedDatabase, OrchestratorError> {
        self.databases.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<ManagedDatabase>, OrchestratorError> {
        self.databases.list().await
    }

    async fn docker_for(&self, db: &ManagedDatabase) -> Result<DockerCli, OrchestratorError> {
        let host = ready_host(&self.hosts, db.host_id.as_deref()).await?;
        Ok(DockerCli::new(self.shells.shell(host.as_ref()).await?))
    }

    /// Start, stop or restart the database instance
    pub async fn control(&self, id: &str, action: DatabaseAction) -> Result<ManagedDatabase, OrchestratorError> {
        let db = self.databases.get(id).await?;
        let docker = self.docker_for(&db).await?;
        let status = match action {
            DatabaseAction::Start => {
                docker.start(&db.instance_id).await?;
                DatabaseStatus::Running
            }
            DatabaseAction::Stop => {
                docker.stop(&db.instance_id).await?;
                DatabaseStatus::Stopped
            }
            DatabaseAction::Restart => {
                docker.restart(&db.instance_id).await?;
                DatabaseStatus::Running
            }
        };
        let db = self
            .databases
            .update(id, move |d| {
                d.status = status;
                Ok(())
            })
            .await?;
        self.events.status(Topic::Database, id, status);
        info!("Database {} {:?}", id, action);
        Ok(db)
    }

    pub async fn start(&self, id: &str) -> Result<ManagedDatabase, OrchestratorError> {
        self.control(id, DatabaseAction::Start).await
    }

    pub async fn stop(&self, id: &str) -> Result<ManagedDatabase, OrchestratorError> {
        self.control(id, DatabaseAction::Stop).await
    }

    pub async fn restart(&self, id: &str) -> Result<ManagedDatabase, OrchestratorError> {
        self.control(id, DatabaseAction::Restart).await
    }

    /// Stop and remove the instance, purge its volume, then drop the record.
    /// The purge is irreversible and never retried; if it fails the record
    /// stays so the operator can see what is left.
    pub async fn delete(&self, id: &str) -> Result<(), OrchestratorError> {
        let db = self.databases.get(id).await?;
        let host = ready_host(&self.hosts, db.host_id.as_deref()).await?;
        let shell = self.shells.shell(host.as_ref()).await?;
        let docker = DockerCli::new(shell.clone());

        match docker.stop(&db.instance_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => warn!("Instance {} is already gone", db.instance_id),
            Err(e) => return Err(e),
        }
        match docker.remove(&db.instance_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        if !Self::routes(&db).is_empty() {
            self.proxy.retract(&shell, &owner_key(&db.id)).await?;
        }

        let root = self.volume_root(db.host_id.is_some());
        if !is_purgeable(&root, &db) {
            return Err(OrchestratorError::ValidationError(format!(
                "refusing to purge {} outside {}",
                db.volume_path, root
            )));
        }
        shell
            .run(&format!("rm -rf {}", shell_quote(&db.volume_path)), None)
            .await?;

        self.databases.delete(id).await?;
        self.events.publish(
            Topic::Database,
            id,
            EventKind::Status {
                status: "deleted".to_string(),
            },
        );
        info!("Deleted database {} and purged {}", id, db.volume_path);
        Ok(())
    }

    /// Decrypted connection string
    pub async fn connection_string(&self, id: &str) -> Result<SecretString, OrchestratorError> {
        let db = self.databases.get(id).await?;
        if db.encrypted_connection_string.is_empty() {
            return Err(OrchestratorError::NotFound(format!(
                "connection string of database {}",
                id
            )));
        }
        self.vault.open(&db.encrypted_connection_string)
    }
}

fn owner_key(id: &str) -> String {
    format!("db-{}", id)
}

/// The volume must be exactly `<root>/<id>`
fn is_purgeable(root: &str, db: &ManagedDatabase) -> bool {
    !root.is_empty() && db.volume_path == format!("{}/{}", root, db.id) && !db.id.contains("..")
}
