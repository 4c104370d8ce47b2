//! Server state

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

use crate::backup::BackupOrchestrator;
use crate::database::DatabaseProvisioner;
use crate::deploy::DeployOrchestrator;
use crate::events::EventBus;
use crate::provision::ProvisioningEngine;

/// Server state shared across handlers
pub struct ServerState {
    pub events: EventBus,
    pub provisioning: Arc<ProvisioningEngine>,
    pub deployer: Arc<DeployOrchestrator>,
    pub databases: Arc<DatabaseProvisioner>,
    pub backups: Arc<BackupOrchestrator>,

    /// One lock per app; deploys and rollbacks of an app run one at a time
    app_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    /// Ends open event streams so graceful shutdown can complete
    shutdown_tx: broadcast::Sender<()>,
}

impl ServerState {
    pub fn new(
        events: EventBus,
        provisioning: Arc<ProvisioningEngine>,
        deployer: Arc<DeployOrchestrator>,
        databases: Arc<DatabaseProvisioner>,
        backups: Arc<BackupOrchestrator>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            events,
            provisioning,
            deployer,
            databases,
            backups,
            app_locks: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Exclusive use of `app_id` if nobody holds it
    pub async fn try_lock_app(&self, app_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.app_locks.lock().await;
            locks
                .entry(app_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().ok()
    }
}
