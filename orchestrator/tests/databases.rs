//! Managed database tests against a scripted shell

mod common;

use secrecy::ExposeSecret;
use tokio_test::{assert_err, assert_ok};

use dockhand::database::{DatabaseAction, NewDatabase};
use dockhand::errors::OrchestratorError;
use dockhand::models::database::{DatabaseStatus, DbEngine};

use common::{Harness, ScriptedShell};

fn new_database(engine: &str, host_id: Option<&str>) -> NewDatabase {
    NewDatabase {
        name: "shop".to_string(),
        engine: engine.to_string(),
        version: None,
        host_id: host_id.map(str::to_string),
        domain: None,
    }
}

fn running_shell() -> std::sync::Arc<ScriptedShell> {
    let shell = ScriptedShell::remote();
    shell.on("State.Status", "running\n");
    shell
}

#[tokio::test]
async fn test_create_postgres_on_host() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let host = harness.ready_host().await;
    let databases = harness.databases();

    let db = databases
        .create(new_database("postgresql", Some(&host.id)))
        .await
        .unwrap();
    assert_eq!(db.engine, DbEngine::Postgres);
    assert_eq!(db.status, DatabaseStatus::Running);
    assert_eq!(db.port, 5432);
    assert_eq!(db.volume_path, format!("/opt/dockhand/databases/{}", db.id));
    assert!(db.instance_id.starts_with("dockhand-db-postgres-"));

    let run = shell
        .commands()
        .into_iter()
        .find(|c| c.starts_with("docker run -d"))
        .unwrap();
    assert!(!run.contains(" -p "));
    assert!(run.contains("--network dockhand"));
    assert!(run.contains(&format!("dockhand.database={}", db.id)));
    assert!(run.contains("/var/lib/postgresql/data"));

    let password = harness.vault.open(&db.credentials.encrypted_password).unwrap();
    assert!(!run.contains(password.expose_secret()));

    let connection = databases.connection_string(&db.id).await.unwrap();
    let connection = connection.expose_secret();
    assert!(connection.starts_with("postgresql://"));
    assert!(connection.contains(&format!("@{}:5432/", db.instance_id)));
    assert!(connection.contains(password.expose_secret()));
}

#[tokio::test]
async fn test_two_databases_share_a_host_without_port_conflicts() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let host = harness.ready_host().await;
    let databases = harness.databases();

    let first = assert_ok!(databases.create(new_database("postgresql", Some(&host.id))).await);
    let second = assert_ok!(databases.create(new_database("postgresql", Some(&host.id))).await);
    assert_ne!(first.instance_id, second.instance_id);
    assert_eq!(second.status, DatabaseStatus::Running);

    let runs: Vec<String> = shell
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("docker run -d"))
        .collect();
    assert_eq!(runs.len(), 2);
    for run in &runs {
        assert!(!run.contains(" -p "), "{}", run);
        assert!(!run.contains("0.0.0.0"), "{}", run);
    }

    let a = databases.connection_string(&first.id).await.unwrap();
    let b = databases.connection_string(&second.id).await.unwrap();
    assert_ne!(a.expose_secret(), b.expose_secret());
    assert!(a.expose_secret().contains(&first.instance_id));
    assert!(b.expose_secret().contains(&second.instance_id));
}

#[tokio::test]
async fn test_validation_happens_before_side_effects() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let host = harness.ready_host().await;
    let databases = harness.databases();

    let unsupported = databases
        .create(new_database("cassandra", Some(&host.id)))
        .await;
    assert!(matches!(unsupported, Err(OrchestratorError::ValidationError(_))));

    let mut bad_name = new_database("redis", Some(&host.id));
    bad_name.name = "shop; rm -rf /".to_string();
    assert!(databases.create(bad_name).await.is_err());

    let mut routed_postgres = new_database("postgres", Some(&host.id));
    routed_postgres.domain = Some("db.example.com".to_string());
    assert!(databases.create(routed_postgres).await.is_err());

    assert!(databases
        .create(new_database("redis", Some("no-such-host")))
        .await
        .unwrap_err()
        .is_not_found());

    assert!(shell.commands().is_empty());
    assert!(databases.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_start_marks_error() {
    let shell = running_shell();
    shell.fail("docker run -d", 125, "docker: Error response from daemon: port is already allocated");
    let harness = Harness::new(shell.clone());
    let host = harness.ready_host().await;
    let databases = harness.databases();

    let db = databases
        .register(new_database("mysql", Some(&host.id)))
        .await
        .unwrap();
    assert_eq!(db.status, DatabaseStatus::Creating);
    assert_err!(databases.provision(&db.id).await);

    let db = databases.get(&db.id).await.unwrap();
    assert_eq!(db.status, DatabaseStatus::Error);
    assert!(db.encrypted_connection_string.is_empty());
    assert!(databases.connection_string(&db.id).await.unwrap_err().is_not_found());

    // provisioning only runs from creating
    assert!(matches!(
        databases.provision(&db.id).await,
        Err(OrchestratorError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn test_lifecycle_actions_update_status() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let host = harness.ready_host().await;
    let databases = harness.databases();
    let db = databases
        .create(new_database("redis", Some(&host.id)))
        .await
        .unwrap();

    let stopped = databases.control(&db.id, DatabaseAction::Stop).await.unwrap();
    assert_eq!(stopped.status, DatabaseStatus::Stopped);
    assert!(shell.ran(&format!("docker stop {}", db.instance_id)));

    let started = databases.control(&db.id, "start".parse().unwrap()).await.unwrap();
    assert_eq!(started.status, DatabaseStatus::Running);

    let restarted = databases.restart(&db.id).await.unwrap();
    assert_eq!(restarted.status, DatabaseStatus::Running);
    assert!(shell.ran(&format!("docker restart {}", db.instance_id)));

    assert!("drop".parse::<DatabaseAction>().is_err());
}

#[tokio::test]
async fn test_delete_purges_volume_and_record() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let host = harness.ready_host().await;
    let databases = harness.databases();
    let db = databases
        .create(new_database("mongodb", Some(&host.id)))
        .await
        .unwrap();

    databases.delete(&db.id).await.unwrap();
    assert!(shell.ran(&format!("docker rm -f {}", db.instance_id)));
    assert!(shell.ran(&format!("rm -rf {}", db.volume_path)));
    assert!(databases.get(&db.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_delete_tolerates_missing_instance() {
    let shell = running_shell();
    let harness = Harness::new(shell.clone());
    let host = harness.ready_host().await;
    let databases = harness.databases();
    let db = databases
        .create(new_database("redis", Some(&host.id)))
        .await
        .unwrap();

    shell.fail("docker stop", 1, "Error response from daemon: No such container: x");
    shell.fail("docker rm -f", 1, "Error: No such container: x");
    assert_ok!(databases.delete(&db.id).await);
    assert!(databases.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_local_database_lives_under_local_root() {
    let shell = ScriptedShell::local();
    shell.on("State.Status", "running\n");
    let harness = Harness::new(shell.clone());
    let databases = harness.databases();

    let db = databases.create(new_database("redis", None)).await.unwrap();
    let root = harness.dir.path().join("databases");
    assert_eq!(
        db.volume_path,
        format!("{}/{}", root.to_string_lossy(), db.id)
    );
    let connection = databases.connection_string(&db.id).await.unwrap();
    assert!(connection
        .expose_secret()
        .contains(&format!("@{}:6379", db.instance_id)));
}
