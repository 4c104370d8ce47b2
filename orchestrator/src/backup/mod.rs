//! Backup and restore of databases and app volumes
//!
//! The strategy is picked by the backup kind. Hosted resources are captured
//! into a temp path on the host and transferred home; local ones are written
//! straight into the backup directory. Completed archives are optionally
//! uploaded to object storage.

pub mod object_store;
pub mod strategy;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::errors::OrchestratorError;
use crate::events::{EventBus, EventKind, LogStream, Topic};
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::app::App;
use crate::models::backup::{Backup, BackupKind, BackupStatus, StorageMode};
use crate::models::database::ManagedDatabase;
use crate::models::host::Host;
use crate::provision::ready_host;
use crate::remote::{Shell, ShellProvider};
use crate::runtime::DockerCli;
use crate::store::Repository;
use crate::utils::{generate_id, shell_quote};

use self::object_store::ObjectStore;
use self::strategy::{composite_instances, BackupStrategy, DatabaseDump, VolumeArchive};

const REMOTE_TMP_DIR: &str = "/tmp";

/// Request to back up one resource
#[derive(Debug, Clone, Deserialize)]
pub struct NewBackup {
    pub kind: BackupKind,
    pub subject_id: String,
}

/// A resolved subject: where it lives and how to archive it
struct Plan {
    strategy: Box<dyn BackupStrategy>,
    shell: Arc<dyn Shell>,
}

pub struct BackupOrchestrator {
    backups: Repository<Backup>,
    apps: Repository<App>,
    databases: Repository<ManagedDatabase>,
    hosts: Repository<Host>,
    shells: Arc<dyn ShellProvider>,
    object_store: Option<Arc<dyn ObjectStore>>,
    events: EventBus,
    backup_dir: Dir,
}

impl BackupOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backups: Repository<Backup>,
        apps: Repository<App>,
        databases: Repository<ManagedDatabase>,
        hosts: Repository<Host>,
        shells: Arc<dyn ShellProvider>,
        object_store: Option<Arc<dyn ObjectStore>>,
        events: EventBus,
        backup_dir: Dir,
    ) -> Self {
        Self {
            backups,
            apps,
            databases,
            hosts,
            shells,
            object_store,
            events,
            backup_dir,
        }
    }

    async fn plan(&self, kind: BackupKind, subject_id: &str) -> Result<Plan, OrchestratorError> {
        match kind {
            BackupKind::Database => {
                let db = self.databases.get(subject_id).await?;
                let host = ready_host(&self.hosts, db.host_id.as_deref()).await?;
                Ok(Plan {
                    strategy: Box::new(DatabaseDump::new(&db)),
                    shell: self.shells.shell(host.as_ref()).await?,
                })
            }
            BackupKind::App | BackupKind::CompositeApp => {
                let app = self.apps.get(subject_id).await?;
                let current = app.current_instance_id.clone().ok_or_else(|| {
                    OrchestratorError::ValidationError(format!(
                        "app {} has no running instance to back up",
                        subject_id
                    ))
                })?;
                let host = ready_host(&self.hosts, app.host_id.as_deref()).await?;
                let shell = self.shells.shell(host.as_ref()).await?;
                let instances = if kind == BackupKind::CompositeApp {
                    composite_instances(&DockerCli::new(shell.clone()), &app.id, &current).await?
                } else {
                    vec![current]
                };
                Ok(Plan {
                    strategy: Box::new(VolumeArchive::new(instances)),
                    shell,
                })
            }
        }
    }

    fn archive_file(&self, backup_id: &str, extension: &str) -> File {
        self.backup_dir.file(&format!("{}.{}", backup_id, extension))
    }

    fn remote_archive(backup_id: &str, extension: &str) -> String {
        format!("{}/dockhand-backup-{}.{}", REMOTE_TMP_DIR, backup_id, extension)
    }

    fn object_key(backup: &Backup, file_name: &str) -> String {
        let kind = match backup.kind {
            BackupKind::Database => "databases",
            BackupKind::App => "apps",
            BackupKind::CompositeApp => "composite-apps",
        };
        format!("backups/{}/{}/{}", kind, backup.subject_id, file_name)
    }

    fn publish_status(&self, id: &str, status: BackupStatus) {
        self.events.status(Topic::Backup, id, status);
    }

    /// Capture a new backup. A failed upload leaves it `completed` and
    /// `local_only`.
    pub async fn create(&self, request: NewBackup) -> Result<Backup, OrchestratorError> {
        let backup = self.begin(request).await?;
        self.complete(&backup.id).await
    }

    /// Check the subject can be backed up and store a `creating` record
    pub async fn begin(&self, request: NewBackup) -> Result<Backup, OrchestratorError> {
        self.plan(request.kind, &request.subject_id).await?;
        let backup = Backup {
            id: generate_id(),
            kind: request.kind,
            subject_id: request.subject_id,
            status: BackupStatus::Creating,
            storage_mode: StorageMode::LocalOnly,
            local_path: None,
            remote_key: None,
            size_bytes: None,
            error: None,
            created_at: Utc::now(),
        };
        self.backups.put(&backup).await?;
        self.publish_status(&backup.id, backup.status);
        Ok(backup)
    }

    /// Capture the archive of a `creating` backup, then upload it if object
    /// storage is configured
    pub async fn complete(&self, id: &str) -> Result<Backup, OrchestratorError> {
        let backup = self.backups.get(id).await?;
        if backup.status != BackupStatus::Creating {
            return Err(OrchestratorError::InvalidTransition(format!(
                "backup {} is {:?}, not creating",
                id, backup.status
            )));
        }
        let log = LogStream::new(&self.events, Topic::Backup, id);

        let archive = match self.capture_archive(&backup, &log).await {
            Ok(archive) => archive,
            Err(e) => {
                error!("Backup {} failed: {}", id, e);
                log.line(format!("ERROR: {}", e));
                let message = e.to_string();
                self.backups
                    .update(id, move |b| {
                        b.set_status(BackupStatus::Failed)?;
                        b.error = Some(message);
                        Ok(())
                    })
                    .await?;
                self.publish_status(id, BackupStatus::Failed);
                return Err(e);
            }
        };

        let size = archive.size().await?;
        let local_path = archive.path().to_string_lossy().to_string();
        let mut backup = self
            .backups
            .update(id, move |b| {
                b.set_status(BackupStatus::Completed)?;
                b.local_path = Some(local_path);
                b.size_bytes = Some(size);
                Ok(())
            })
            .await?;
        log.line(format!("Captured {} bytes", size));
        self.publish_status(id, BackupStatus::Completed);

        if let Some(store) = &self.object_store {
            backup = self.upload(store.as_ref(), backup, &archive, &log).await?;
        }
        info!("Backup {} completed ({:?})", id, backup.storage_mode);
        Ok(backup)
    }

    async fn capture_archive(&self, backup: &Backup, log: &LogStream) -> Result<File, OrchestratorError> {
        let plan = self.plan(backup.kind, &backup.subject_id).await?;
        self.backup_dir.create().await?;
        let archive = self.archive_file(&backup.id, plan.strategy.extension());
        log.line(format!(
            "Backing up {:?} {} on {}",
            backup.kind,
            backup.subject_id,
            plan.shell.describe()
        ));
        if let Err(e) = self.capture(&plan, &backup.id, &archive, log).await {
            if let Err(cleanup) = archive.delete().await {
                warn!("Failed to remove partial archive: {}", cleanup);
            }
            return Err(e);
        }
        Ok(archive)
    }

    async fn capture(
        &self,
        plan: &Plan,
        backup_id: &str,
        archive: &File,
        log: &LogStream,
    ) -> Result<(), OrchestratorError> {
        let docker = DockerCli::new(plan.shell.clone());
        if !plan.shell.is_remote() {
            let path = archive.path().to_string_lossy().to_string();
            return plan.strategy.capture(&docker, &path, log).await;
        }

        let remote = Self::remote_archive(backup_id, plan.strategy.extension());
        let captured = match plan.strategy.capture(&docker, &remote, log).await {
            Ok(()) => {
                log.line("Transferring archive");
                plan.shell.fetch_file(&remote, archive.path()).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = plan
            .shell
            .run(&format!("rm -f {}", shell_quote(&remote)), None)
            .await
        {
            warn!("Failed to remove {} on {}: {}", remote, plan.shell.describe(), e);
        }
        captured
    }

    async fn upload(
        &self,
        store: &dyn ObjectStore,
        backup: Backup,
        archive: &File,
        log: &LogStream,
    ) -> Result<Backup, OrchestratorError> {
        let file_name = archive
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| backup.id.clone());
        let key = Self::object_key(&backup, &file_name);

        let uploaded = match store.ensure_bucket().await {
            Ok(()) => store.put(&key, archive.path()).await,
            Err(e) => Err(e),
        };
        match uploaded {
            Ok(()) => {
                log.line(format!("Uploaded to {}", key));
                self.backups
                    .update(&backup.id, move |b| {
                        b.storage_mode = StorageMode::Uploaded;
                        b.remote_key = Some(key);
                        Ok(())
                    })
                    .await
            }
            Err(e) => {
                warn!("Upload of backup {} failed, keeping it local: {}", backup.id, e);
                log.line(format!("Upload failed, backup kept locally: {}", e));
                Ok(backup)
            }
        }
    }

    /// Restore a completed backup into its subject
    pub async fn restore(&self, id: &str) -> Result<Backup, OrchestratorError> {
        let backup = self
            .backups
            .update(id, |b| b.set_status(BackupStatus::Restoring))
            .await?;
        self.publish_status(id, BackupStatus::Restoring);
        let log = LogStream::new(&self.events, Topic::Backup, id);

        match self.run_restore(&backup, &log).await {
            Ok(()) => {
                log.line("Restore completed");
                let backup = self
                    .backups
                    .update(id, |b| {
                        b.set_status(BackupStatus::Completed)?;
                        b.error = None;
                        Ok(())
                    })
                    .await?;
                self.publish_status(id, BackupStatus::Completed);
                info!("Restored backup {}", id);
                Ok(backup)
            }
            Err(e) => {
                error!("Restore of backup {} failed: {}", id, e);
                log.line(format!("ERROR: {}", e));
                let message = e.to_string();
                self.backups
                    .update(id, move |b| {
                        b.set_status(BackupStatus::Failed)?;
                        b.error = Some(message);
                        Ok(())
                    })
                    .await?;
                self.publish_status(id, BackupStatus::Failed);
                Err(e)
            }
        }
    }

    async fn run_restore(&self, backup: &Backup, log: &LogStream) -> Result<(), OrchestratorError> {
        let plan = self.plan(backup.kind, &backup.subject_id).await?;
        let archive = match &backup.local_path {
            Some(path) => File::new(path),
            None => self.archive_file(&backup.id, plan.strategy.extension()),
        };
        self.ensure_local_archive(backup, &archive, log).await?;

        let docker = DockerCli::new(plan.shell.clone());
        if !plan.shell.is_remote() {
            let path = archive.path().to_string_lossy().to_string();
            return plan.strategy.restore(&docker, &path, log).await;
        }

        let remote = Self::remote_archive(&backup.id, plan.strategy.extension());
        log.line("Transferring archive");
        plan.shell.push_file(archive.path(), &remote).await?;
        let restored = plan.strategy.restore(&docker, &remote, log).await;
        if let Err(e) = plan
            .shell
            .run(&format!("rm -f {}", shell_quote(&remote)), None)
            .await
        {
            warn!("Failed to remove {} on {}: {}", remote, plan.shell.describe(), e);
        }
        restored
    }

    /// Re-download a missing archive from object storage
    async fn ensure_local_archive(
        &self,
        backup: &Backup,
        archive: &File,
        log: &LogStream,
    ) -> Result<(), OrchestratorError> {
        if archive.exists().await {
            return Ok(());
        }
        match (&backup.remote_key, &self.object_store) {
            (Some(key), Some(store)) => {
                log.line(format!("Local archive missing, downloading {}", key));
                if let Some(parent) = archive.path().parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                store.get(key, archive.path()).await
            }
            _ => Err(OrchestratorError::NotFound(format!(
                "archive of backup {} at {}",
                backup.id,
                archive.path().display()
            ))),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Backup, OrchestratorError> {
        self.backups.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Backup>, OrchestratorError> {
        self.backups.list().await
    }

    /// Remove the local archive and the record. Uploaded copies are kept.
    pub async fn delete(&self, id: &str) -> Result<(), OrchestratorError> {
        let backup = self.backups.get(id).await?;
        if backup.status == BackupStatus::Restoring {
            return Err(OrchestratorError::InvalidTransition(format!(
                "backup {} is being restored",
                id
            )));
        }
        if let Some(path) = &backup.local_path {
            if Path::new(path).starts_with(self.backup_dir.path()) {
                File::new(path).delete().await?;
            } else {
                warn!("Not deleting {} outside the backup directory", path);
            }
        }
        self.backups.delete(id).await?;
        self.events.publish(
            Topic::Backup,
            id,
            EventKind::Status {
                status: "deleted".to_string(),
            },
        );
        info!("Deleted backup {}", id);
        Ok(())
    }
}
