//! Application state management

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::backup::object_store::{ObjectStore, S3ObjectStore};
use crate::backup::BackupOrchestrator;
use crate::database::{DatabaseOptions, DatabaseProvisioner};
use crate::deploy::DeployOrchestrator;
use crate::errors::OrchestratorError;
use crate::events::EventBus;
use crate::provision::ProvisioningEngine;
use crate::proxy::ProxyConfigurator;
use crate::remote::executor::RemoteExecutor;
use crate::remote::ShellProvider;
use crate::scm::github::GitHubSourceControl;
use crate::scm::SourceControl;
use crate::store::json_file::JsonFileStore;
use crate::store::{MetadataStore, Repository};
use crate::vault::{AesGcmCipher, CredentialVault};
use crate::workers::update_watcher::UpdateWatcher;

/// Main application state
pub struct AppState {
    /// Operator event fan-out
    pub events: EventBus,

    /// Pooled SSH sessions and the local shell
    pub executor: Arc<RemoteExecutor>,

    pub provisioning: Arc<ProvisioningEngine>,
    pub deployer: Arc<DeployOrchestrator>,
    pub databases: Arc<DatabaseProvisioner>,
    pub backups: Arc<BackupOrchestrator>,
    pub update_watcher: Arc<UpdateWatcher>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, OrchestratorError> {
        info!("Initializing application state...");
        let layout = &options.layout;

        let cipher = AesGcmCipher::load_or_create(&layout.vault_key_file()).await?;
        let vault = CredentialVault::new(Arc::new(cipher));
        info!("Credential vault ready (key {})", vault.key_id());

        let store: Arc<dyn MetadataStore> = Arc::new(JsonFileStore::new(layout.state_dir()));
        let hosts = Repository::new(store.clone());
        let apps = Repository::new(store.clone());
        let databases = Repository::new(store.clone());
        let backups = Repository::new(store);

        let events = EventBus::new();
        let executor = Arc::new(RemoteExecutor::new(
            vault.clone(),
            layout.ssh_dir().path().to_path_buf(),
        ));
        let shells: Arc<dyn ShellProvider> = executor.clone();
        let proxy = Arc::new(ProxyConfigurator::new(options.proxy.clone()));

        let token = options
            .source_control
            .token
            .as_ref()
            .map(|t| SecretString::from(t.expose_secret().to_string()));
        let scm: Arc<dyn SourceControl> = Arc::new(GitHubSourceControl::new(
            &options.source_control.api_base_url,
            token,
        )?);

        let object_store = match &options.object_storage {
            Some(settings) => {
                let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(settings)?);
                info!("Backups will be uploaded to bucket {}", settings.bucket);
                Some(store)
            }
            None => {
                warn!("No object storage configured, backups stay local only");
                None
            }
        };

        let provisioning = Arc::new(ProvisioningEngine::new(
            hosts.clone(),
            shells.clone(),
            vault.clone(),
            events.clone(),
        ));

        let deployer = Arc::new(DeployOrchestrator::new(
            apps.clone(),
            hosts.clone(),
            shells.clone(),
            proxy.clone(),
            scm.clone(),
            events.clone(),
            options.deploy.deploy_options(layout),
        ));

        let database_options = DatabaseOptions {
            local_root: layout.base_dir.join("databases"),
            network: options.proxy.network.clone(),
            poll: options.deploy.poll(),
            ..Default::default()
        };
        let database_provisioner = Arc::new(DatabaseProvisioner::new(
            databases.clone(),
            hosts.clone(),
            shells.clone(),
            vault,
            proxy,
            events.clone(),
            database_options,
        ));

        let backup_orchestrator = Arc::new(BackupOrchestrator::new(
            backups,
            apps.clone(),
            databases,
            hosts,
            shells.clone(),
            object_store,
            events.clone(),
            layout.backups_dir(),
        ));

        let update_watcher = Arc::new(UpdateWatcher::new(
            apps,
            shells,
            scm,
            layout.repos_dir().path().to_path_buf(),
        ));

        Ok(Self {
            events,
            executor,
            provisioning,
            deployer,
            databases: database_provisioner,
            backups: backup_orchestrator,
            update_watcher,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        info!("Shutting down application state...");
        self.executor.disconnect_all().await;
        Ok(())
    }
}
