//! Capture and restore strategies, one per resource kind

use async_trait::async_trait;
use tracing::info;

use crate::errors::OrchestratorError;
use crate::deploy::APP_LABEL;
use crate::events::LogStream;
use crate::models::database::{DbEngine, ManagedDatabase};
use crate::runtime::DockerCli;
use crate::utils::shell_quote;

/// Label docker compose puts on every container of a project
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Moves a resource's state into an archive and back. Paths are on the
/// machine the docker CLI runs on.
#[async_trait]
pub trait BackupStrategy: Send + Sync {
    /// Archive file extension, without a leading dot
    fn extension(&self) -> &'static str;

    async fn capture(&self, docker: &DockerCli, archive: &str, log: &LogStream) -> Result<(), OrchestratorError>;

    async fn restore(&self, docker: &DockerCli, archive: &str, log: &LogStream) -> Result<(), OrchestratorError>;
}

/// Engine-native dump for relational and document engines, volume archive
/// for the key-value and object stores
pub struct DatabaseDump {
    engine: DbEngine,
    instance: String,
    data_dir: String,
}

impl DatabaseDump {
    pub fn new(db: &ManagedDatabase) -> Self {
        Self {
            engine: db.engine,
            instance: db.instance_id.clone(),
            data_dir: format!("{}/data", db.volume_path),
        }
    }

    /// Command run inside the container; credentials come from its own env
    fn dump_command(&self) -> Option<&'static str> {
        match self.engine {
            DbEngine::Postgres => Some(r#"PGPASSWORD="$POSTGRES_PASSWORD" exec pg_dump --clean --if-exists -U "$POSTGRES_USER" "$POSTGRES_DB""#),
            DbEngine::MySql => Some(r#"exec mysqldump --no-tablespaces --add-drop-table -u"$MYSQL_USER" -p"$MYSQL_PASSWORD" "$MYSQL_DATABASE""#),
            DbEngine::MongoDb => Some(r#"exec mongodump --archive --gzip -u "$MONGO_INITDB_ROOT_USERNAME" -p "$MONGO_INITDB_ROOT_PASSWORD" --authenticationDatabase admin"#),
            DbEngine::Redis | DbEngine::Minio => None,
        }
    }

    fn load_command(&self) -> Option<&'static str> {
        match self.engine {
            DbEngine::Postgres => Some(r#"PGPASSWORD="$POSTGRES_PASSWORD" exec psql -q -v ON_ERROR_STOP=1 -U "$POSTGRES_USER" "$POSTGRES_DB""#),
            DbEngine::MySql => Some(r#"exec mysql -u"$MYSQL_USER" -p"$MYSQL_PASSWORD" "$MYSQL_DATABASE""#),
            DbEngine::MongoDb => Some(r#"exec mongorestore --archive --gzip --drop -u "$MONGO_INITDB_ROOT_USERNAME" -p "$MONGO_INITDB_ROOT_PASSWORD" --authenticationDatabase admin"#),
            DbEngine::Redis | DbEngine::Minio => None,
        }
    }

    pub fn capture_command(&self, archive: &str) -> String {
        let instance = shell_quote(&self.instance);
        let archive = shell_quote(archive);
        match (self.engine, self.dump_command()) {
            (DbEngine::MongoDb, Some(dump)) => format!(
                "set -o pipefail; docker exec {} sh -c {} > {}",
                instance,
                shell_quote(dump),
                archive
            ),
            (_, Some(dump)) => format!(
                "set -o pipefail; docker exec {} sh -c {} | gzip > {}",
                instance,
                shell_quote(dump),
                archive
            ),
            (_, None) => format!(
                "tar -czf {} -C {} .",
                archive,
                shell_quote(&self.data_dir)
            ),
        }
    }

    pub fn restore_command(&self, archive: &str) -> String {
        let instance = shell_quote(&self.instance);
        let archive_q = shell_quote(archive);
        match (self.engine, self.load_command()) {
            (DbEngine::MongoDb, Some(load)) => format!(
                "docker exec -i {} sh -c {} < {}",
                instance,
                shell_quote(load),
                archive_q
            ),
            (_, Some(load)) => format!(
                "set -o pipefail; gunzip -c {} | docker exec -i {} sh -c {}",
                archive_q,
                instance,
                shell_quote(load)
            ),
            // extract beside the live data and swap only once tar succeeded;
            // the instance is started again whatever the outcome
            (_, None) => format!(
                "docker stop {i} && rm -rf {s} && mkdir -p {s} && tar -xzf {a} -C {s} \
                 && mv {d} {o} && mv {s} {d} && rm -rf {o}; rc=$?; \
                 rm -rf {s}; [ -d {d} ] || mv {o} {d}; docker start {i}; exit $rc",
                i = instance,
                d = shell_quote(&self.data_dir),
                s = shell_quote(&format!("{}.restore", self.data_dir)),
                o = shell_quote(&format!("{}.old", self.data_dir)),
                a = archive_q
            ),
        }
    }
}

#[async_trait]
impl BackupStrategy for DatabaseDump {
    fn extension(&self) -> &'static str {
        match self.engine {
            DbEngine::Postgres | DbEngine::MySql => "sql.gz",
            DbEngine::MongoDb => "archive.gz",
            DbEngine::Redis | DbEngine::Minio => "tar.gz",
        }
    }

    async fn capture(&self, docker: &DockerCli, archive: &str, log: &LogStream) -> Result<(), OrchestratorError> {
        log.line(format!("Dumping {} instance {}", self.engine, self.instance));
        docker.shell().run(&self.capture_command(archive), Some(log)).await?;
        Ok(())
    }

    async fn restore(&self, docker: &DockerCli, archive: &str, log: &LogStream) -> Result<(), OrchestratorError> {
        log.line(format!("Loading archive into {} instance {}", self.engine, self.instance));
        docker.shell().run(&self.restore_command(archive), Some(log)).await?;
        Ok(())
    }
}

/// Tar of the volumes mounted into a set of containers
pub struct VolumeArchive {
    instances: Vec<String>,
}

impl VolumeArchive {
    pub fn new(instances: Vec<String>) -> Self {
        Self { instances }
    }

    async fn sources(&self, docker: &DockerCli) -> Result<Vec<String>, OrchestratorError> {
        let mut sources = Vec::new();
        for instance in &self.instances {
            for mount in docker.mounts(instance).await? {
                let source = mount.source.trim_start_matches('/').to_string();
                if !source.is_empty() && !sources.contains(&source) {
                    sources.push(source);
                }
            }
        }
        if sources.is_empty() {
            return Err(OrchestratorError::ValidationError(format!(
                "no mounted volumes to back up on {}",
                self.instances.join(", ")
            )));
        }
        Ok(sources)
    }

    async fn stop_all(&self, docker: &DockerCli) -> Result<(), OrchestratorError> {
        for instance in &self.instances {
            docker.stop(instance).await?;
        }
        Ok(())
    }

    async fn start_all(&self, docker: &DockerCli) -> Result<(), OrchestratorError> {
        for instance in &self.instances {
            docker.start(instance).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BackupStrategy for VolumeArchive {
    fn extension(&self) -> &'static str {
        "tar.gz"
    }

    async fn capture(&self, docker: &DockerCli, archive: &str, log: &LogStream) -> Result<(), OrchestratorError> {
        let sources = self.sources(docker).await?;
        log.line(format!("Archiving {} volume(s)", sources.len()));
        let paths: Vec<String> = sources.iter().map(|s| shell_quote(s)).collect();
        let command = format!("tar -czf {} -C / {}", shell_quote(archive), paths.join(" "));
        docker.shell().run(&command, Some(log)).await?;
        Ok(())
    }

    async fn restore(&self, docker: &DockerCli, archive: &str, log: &LogStream) -> Result<(), OrchestratorError> {
        log.line(format!("Stopping {} instance(s) for restore", self.instances.len()));
        self.stop_all(docker).await?;
        let extracted = docker
            .shell()
            .run(&format!("tar -xzf {} -C /", shell_quote(archive)), Some(log))
            .await;
        // instances come back up even when the extract failed
        let started = self.start_all(docker).await;
        extracted?;
        started?;
        info!("Restored volumes of {}", self.instances.join(", "));
        Ok(())
    }
}

/// Containers making up a composite app: the compose project of `instance`
/// when it has one, else every running container labelled with the app.
/// `instance` always comes first.
pub async fn composite_instances(
    docker: &DockerCli,
    app_id: &str,
    instance: &str,
) -> Result<Vec<String>, OrchestratorError> {
    let members = match docker.label(instance, COMPOSE_PROJECT_LABEL).await? {
        Some(project) => {
            docker
                .list_by_label(&format!("{}={}", COMPOSE_PROJECT_LABEL, project))
                .await?
        }
        None => {
            docker
                .running_by_label(&format!("{}={}", APP_LABEL, app_id))
                .await?
        }
    };
    let mut instances = vec![instance.to_string()];
    instances.extend(members.into_iter().filter(|m| m != instance));
    Ok(instances)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::database::{DatabaseStatus, DbCredentials};

    fn db(engine: DbEngine) -> ManagedDatabase {
        ManagedDatabase {
            id: "d1".into(),
            name: "shop".into(),
            engine,
            version: "16".into(),
            host_id: None,
            credentials: DbCredentials {
                username: "uabc".into(),
                encrypted_password: "v1:x".into(),
                database: "shop".into(),
            },
            encrypted_connection_string: String::new(),
            port: 5432,
            instance_id: "dockhand-db-x".into(),
            volume_path: "/opt/dockhand/databases/d1".into(),
            domain: None,
            status: DatabaseStatus::Running,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_postgres_dump_is_gzipped() {
        let dump = DatabaseDump::new(&db(DbEngine::Postgres));
        let cmd = dump.capture_command("/tmp/b.sql.gz");
        assert!(cmd.contains("pg_dump"));
        assert!(cmd.ends_with("| gzip > /tmp/b.sql.gz"));
        assert_eq!(dump.extension(), "sql.gz");
    }

    #[test]
    fn test_mongo_dump_uses_native_archive() {
        let dump = DatabaseDump::new(&db(DbEngine::MongoDb));
        let cmd = dump.capture_command("/tmp/b.archive.gz");
        assert!(cmd.contains("mongodump --archive --gzip"));
        assert!(!cmd.contains("| gzip"));
    }

    #[test]
    fn test_redis_archives_its_volume() {
        let dump = DatabaseDump::new(&db(DbEngine::Redis));
        assert_eq!(
            dump.capture_command("/tmp/b.tar.gz"),
            "tar -czf /tmp/b.tar.gz -C /opt/dockhand/databases/d1/data ."
        );
        assert!(dump.restore_command("/tmp/b.tar.gz").contains("docker start"));
    }

    #[test]
    fn test_postgres_restore_replaces_existing_objects() {
        let dump = DatabaseDump::new(&db(DbEngine::Postgres));
        let capture = dump.capture_command("/tmp/b.sql.gz");
        assert!(capture.contains("pg_dump --clean --if-exists"), "{}", capture);
        let restore = dump.restore_command("/tmp/b.sql.gz");
        assert!(restore.contains("psql -q -v ON_ERROR_STOP=1"), "{}", restore);
        assert!(restore.starts_with("set -o pipefail;"));
    }

    #[test]
    fn test_volume_restore_keeps_data_until_extract_succeeds() {
        let dump = DatabaseDump::new(&db(DbEngine::Minio));
        let cmd = dump.restore_command("/tmp/b.tar.gz");
        assert!(!cmd.contains("-delete"), "{}", cmd);
        assert!(!cmd.contains("&& docker start"), "{}", cmd);

        let extract = cmd
            .find("tar -xzf /tmp/b.tar.gz -C /opt/dockhand/databases/d1/data.restore")
            .unwrap();
        let swap = cmd.find("mv /opt/dockhand/databases/d1/data /opt/dockhand/databases/d1/data.old").unwrap();
        assert!(extract < swap);

        let status = cmd.find("rc=$?").unwrap();
        let start = cmd.find("docker start dockhand-db-x").unwrap();
        assert!(status < start);
        assert!(cmd.ends_with("exit $rc"));
    }

    #[test]
    fn test_dump_commands_read_password_from_container_env() {
        for engine in [DbEngine::Postgres, DbEngine::MySql, DbEngine::MongoDb] {
            let dump = DatabaseDump::new(&db(engine));
            let cmd = dump.capture_command("/tmp/x");
            assert!(cmd.contains("PASSWORD\""), "{}", cmd);
        }
    }
}
