//! Backup and restore tests against a scripted shell

mod common;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio_test::assert_err;

use dockhand::backup::object_store::ObjectStore;
use dockhand::backup::{BackupOrchestrator, NewBackup};
use dockhand::database::NewDatabase;
use dockhand::errors::OrchestratorError;
use dockhand::models::app::{App, AppStatus, SourceRef};
use dockhand::models::backup::{BackupKind, BackupStatus, StorageMode};
use dockhand::models::database::ManagedDatabase;

use common::{Harness, ScriptedShell};

#[derive(Default)]
struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    unreachable: bool,
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self) -> Result<(), OrchestratorError> {
        if self.unreachable {
            return Err(OrchestratorError::ConnectionError(
                "object storage unreachable".to_string(),
            ));
        }
        Ok(())
    }

    async fn put(&self, key: &str, local: &Path) -> Result<(), OrchestratorError> {
        let bytes = tokio::fs::read(local).await?;
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str, local: &Path) -> Result<(), OrchestratorError> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(key.to_string()))?;
        tokio::fs::write(local, bytes).await?;
        Ok(())
    }
}

fn backups_with_store(harness: &Harness, store: Arc<MemoryObjectStore>) -> BackupOrchestrator {
    BackupOrchestrator::new(
        harness.repo(),
        harness.repo(),
        harness.repo(),
        harness.repo(),
        harness.shells.clone(),
        Some(store as Arc<dyn ObjectStore>),
        harness.events.clone(),
        harness.backup_dir(),
    )
}

async fn postgres(harness: &Harness) -> ManagedDatabase {
    let host = harness.ready_host().await;
    harness
        .databases()
        .create(NewDatabase {
            name: "shop".to_string(),
            engine: "postgres".to_string(),
            version: None,
            host_id: Some(host.id),
            domain: None,
        })
        .await
        .unwrap()
}

async fn hosted_app(harness: &Harness, current: Option<&str>) -> App {
    let host = harness.ready_host().await;
    let app = App {
        id: "app-1".to_string(),
        name: "shop".to_string(),
        host_id: Some(host.id),
        source: SourceRef {
            repo_url: "https://github.com/acme/shop.git".to_string(),
            branch: "main".to_string(),
            private: false,
        },
        domain: None,
        port: 8080,
        env_vars: BTreeMap::new(),
        current_instance_id: current.map(str::to_string),
        previous_instance_id: None,
        status: AppStatus::Active,
        deployments: Vec::new(),
        update_available: false,
        latest_upstream_commit: None,
        last_update_check: None,
        created_at: Utc::now(),
    };
    harness.repo::<App>().put(&app).await.unwrap();
    app
}

fn database_backup(db: &ManagedDatabase) -> NewBackup {
    NewBackup {
        kind: BackupKind::Database,
        subject_id: db.id.clone(),
    }
}

fn running_shell() -> Arc<ScriptedShell> {
    let shell = ScriptedShell::remote();
    shell.on("State.Status", "running\n");
    shell
}

#[tokio::test]
async fn test_database_backup_is_fetched_and_cleaned_up() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let db = postgres(&harness).await;
    let backups = harness.backups();

    let backup = backups.create(database_backup(&db)).await.unwrap();
    assert_eq!(backup.status, BackupStatus::Completed);
    assert_eq!(backup.storage_mode, StorageMode::LocalOnly);
    assert!(backup.size_bytes.unwrap() > 0);

    let local_path = backup.local_path.clone().unwrap();
    assert!(local_path.ends_with(&format!("{}.sql.gz", backup.id)));
    assert!(Path::new(&local_path).starts_with(harness.backup_dir().path()));
    assert!(Path::new(&local_path).exists());

    let remote = format!("/tmp/dockhand-backup-{}.sql.gz", backup.id);
    let capture = shell.position(&format!("gzip > {}", remote)).unwrap();
    let cleanup = shell.position(&format!("rm -f {}", remote)).unwrap();
    assert!(capture < cleanup);
    assert!(shell.commands()[capture].contains(&format!("docker exec {}", db.instance_id)));
}

#[tokio::test]
async fn test_failed_capture_marks_backup_failed() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let db = postgres(&harness).await;
    shell.fail("| gzip >", 1, "pg_dump: error: connection refused");
    let backups = harness.backups();

    let backup = backups.begin(database_backup(&db)).await.unwrap();
    assert_eq!(backup.status, BackupStatus::Creating);
    assert_err!(backups.complete(&backup.id).await);

    let backup = backups.get(&backup.id).await.unwrap();
    assert_eq!(backup.status, BackupStatus::Failed);
    assert!(backup.error.unwrap().contains("exit code 1"));
    assert!(backup.local_path.is_none());
    assert!(shell.ran(&format!("rm -f /tmp/dockhand-backup-{}", backup.id)));

    // a failed backup can't be restored
    assert!(matches!(
        backups.restore(&backup.id).await,
        Err(OrchestratorError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn test_restore_pushes_archive_and_loads_it() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let db = postgres(&harness).await;
    let backups = harness.backups();
    let backup = backups.create(database_backup(&db)).await.unwrap();

    let restored = backups.restore(&backup.id).await.unwrap();
    assert_eq!(restored.status, BackupStatus::Completed);

    let remote = format!("/tmp/dockhand-backup-{}.sql.gz", backup.id);
    assert_eq!(shell.pushed(), vec![remote.clone()]);
    assert!(shell.ran(&format!("gunzip -c {} | docker exec -i {}", remote, db.instance_id)));
    assert!(shell.ran("psql -q -v ON_ERROR_STOP=1"));
    assert!(shell.ran("pg_dump --clean --if-exists"));
}

#[tokio::test]
async fn test_failed_restore_keeps_error() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let db = postgres(&harness).await;
    let backups = harness.backups();
    let backup = backups.create(database_backup(&db)).await.unwrap();

    shell.fail("gunzip -c", 1, "psql: error: relation already exists");
    assert_err!(backups.restore(&backup.id).await);
    let backup = backups.get(&backup.id).await.unwrap();
    assert_eq!(backup.status, BackupStatus::Failed);
    assert!(backup.error.is_some());
}

#[tokio::test]
async fn test_app_backup_requires_running_instance() {
    let harness = Harness::new(running_shell());
    let app = hosted_app(&harness, None).await;
    let backups = harness.backups();

    let err = backups
        .begin(NewBackup {
            kind: BackupKind::App,
            subject_id: app.id.clone(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ValidationError(_)));
    assert!(backups.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_composite_app_backup_archives_every_project_volume() {
    let shell = running_shell();
    shell.on("index .Config.Labels", "shop\n");
    shell.on("docker ps -a --filter", "shop-web-1\nshop-db-1\n");
    shell.on(
        ".Mounts",
        r#"[{"Source":"/opt/dockhand/apps/app-1/uploads","Destination":"/app/uploads"},{"Source":"/var/lib/docker/volumes/shop_db/_data","Destination":"/var/lib/mysql"}]"#,
    );
    let harness = Harness::new(shell.clone());
    let app = hosted_app(&harness, Some("shop-web-1")).await;
    let backups = harness.backups();

    let backup = backups
        .create(NewBackup {
            kind: BackupKind::CompositeApp,
            subject_id: app.id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(backup.status, BackupStatus::Completed);

    let tar = shell
        .commands()
        .into_iter()
        .find(|c| c.starts_with("tar -czf"))
        .unwrap();
    assert!(tar.contains("opt/dockhand/apps/app-1/uploads"));
    assert!(tar.contains("var/lib/docker/volumes/shop_db/_data"));
    assert_eq!(tar.matches("uploads").count(), 1);

    backups.restore(&backup.id).await.unwrap();
    let stop_web = shell.position("docker stop shop-web-1").unwrap();
    let extract = shell.position("tar -xzf").unwrap();
    let start_db = shell.position("docker start shop-db-1").unwrap();
    assert!(stop_web < extract && extract < start_db);
}

#[tokio::test]
async fn test_composite_app_without_compose_groups_app_labelled_containers() {
    let shell = running_shell();
    shell.on(
        "docker ps --filter status=running --filter label=dockhand.app=app-1",
        "shop-cache-1\nshop-a1b2c3d-xyzw\n",
    );
    shell.on(
        ".Mounts",
        r#"[{"Source":"/opt/dockhand/apps/app-1/data","Destination":"/data"}]"#,
    );
    let harness = Harness::new(shell.clone());
    let app = hosted_app(&harness, Some("shop-a1b2c3d-xyzw")).await;
    let backups = harness.backups();

    let backup = backups
        .create(NewBackup {
            kind: BackupKind::CompositeApp,
            subject_id: app.id.clone(),
        })
        .await
        .unwrap();
    assert_eq!(backup.status, BackupStatus::Completed);
    assert!(!shell.ran("docker ps -a"));
    assert!(shell.ran("docker inspect -f '{{json .Mounts}}' shop-a1b2c3d-xyzw"));
    assert!(shell.ran("docker inspect -f '{{json .Mounts}}' shop-cache-1"));

    backups.restore(&backup.id).await.unwrap();
    assert!(shell.ran("docker stop shop-cache-1"));
    let stop_current = shell.position("docker stop shop-a1b2c3d-xyzw").unwrap();
    let start_cache = shell.position("docker start shop-cache-1").unwrap();
    assert!(stop_current < start_cache);
}

#[tokio::test]
async fn test_upload_and_redownload_from_object_storage() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let db = postgres(&harness).await;
    let store = Arc::new(MemoryObjectStore::default());
    let backups = backups_with_store(&harness, store.clone());

    let backup = backups.create(database_backup(&db)).await.unwrap();
    assert_eq!(backup.storage_mode, StorageMode::Uploaded);
    let key = backup.remote_key.clone().unwrap();
    assert_eq!(
        key,
        format!("backups/databases/{}/{}.sql.gz", db.id, backup.id)
    );
    assert!(store.objects.lock().unwrap().contains_key(&key));

    tokio::fs::remove_file(backup.local_path.as_ref().unwrap()).await.unwrap();
    let restored = backups.restore(&backup.id).await.unwrap();
    assert_eq!(restored.status, BackupStatus::Completed);
    assert!(Path::new(backup.local_path.as_ref().unwrap()).exists());
}

#[tokio::test]
async fn test_failed_upload_stays_local_only() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let db = postgres(&harness).await;
    let store = Arc::new(MemoryObjectStore {
        unreachable: true,
        ..Default::default()
    });
    let backups = backups_with_store(&harness, store);

    let backup = backups.create(database_backup(&db)).await.unwrap();
    assert_eq!(backup.status, BackupStatus::Completed);
    assert_eq!(backup.storage_mode, StorageMode::LocalOnly);
    assert!(backup.remote_key.is_none());
}

#[tokio::test]
async fn test_delete_removes_archive_and_record() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let db = postgres(&harness).await;
    let backups = harness.backups();
    let backup = backups.create(database_backup(&db)).await.unwrap();
    let local_path = backup.local_path.clone().unwrap();

    backups.delete(&backup.id).await.unwrap();
    assert!(!Path::new(&local_path).exists());
    assert!(backups.get(&backup.id).await.unwrap_err().is_not_found());
}
