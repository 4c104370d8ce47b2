//! Docker engine driven through its CLI over any [`Shell`]
//!
//! Instance ids are container names. A missing container surfaces as
//! [`OrchestratorError::NotFound`]; callers decide whether that is fatal.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::events::LogStream;
use crate::remote::{ExecOutput, Shell};
use crate::utils::shell_quote;

/// Observed container state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Missing,
}

impl InstanceState {
    pub fn parse(status: &str) -> Self {
        match status.trim() {
            "created" => InstanceState::Created,
            "running" => InstanceState::Running,
            "restarting" => InstanceState::Restarting,
            "paused" => InstanceState::Paused,
            "exited" | "removing" => InstanceState::Exited,
            _ => InstanceState::Dead,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Created => "created",
            InstanceState::Running => "running",
            InstanceState::Restarting => "restarting",
            InstanceState::Paused => "paused",
            InstanceState::Exited => "exited",
            InstanceState::Dead => "dead",
            InstanceState::Missing => "missing",
        };
        f.write_str(name)
    }
}

/// Everything needed to start a container
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub network: Option<String>,
    pub env_file: Option<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,

    /// `docker run -p` values, e.g. `127.0.0.1:3000:3000`
    pub publish: Vec<String>,

    /// `docker run -v` values, e.g. `/opt/dockhand/databases/x:/data`
    pub volumes: Vec<String>,
    pub restart_policy: Option<String>,

    /// Arguments appended after the image
    pub args: Vec<String>,
}

impl RunSpec {
    pub fn to_command(&self) -> String {
        let mut parts = vec![
            "docker run -d".to_string(),
            format!("--name {}", shell_quote(&self.name)),
        ];
        if let Some(policy) = &self.restart_policy {
            parts.push(format!("--restart {}", shell_quote(policy)));
        }
        if let Some(network) = &self.network {
            parts.push(format!("--network {}", shell_quote(network)));
        }
        if let Some(env_file) = &self.env_file {
            parts.push(format!("--env-file {}", shell_quote(env_file)));
        }
        for (key, value) in &self.env {
            parts.push(format!("-e {}", shell_quote(&format!("{}={}", key, value))));
        }
        for (key, value) in &self.labels {
            parts.push(format!("--label {}", shell_quote(&format!("{}={}", key, value))));
        }
        for publish in &self.publish {
            parts.push(format!("-p {}", shell_quote(publish)));
        }
        for volume in &self.volumes {
            parts.push(format!("-v {}", shell_quote(volume)));
        }
        parts.push(shell_quote(&self.image));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }
}

/// Bounded polling parameters
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
        }
    }
}

/// A bind or volume mount of a container
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Mount {
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Destination")]
    pub destination: String,
}

#[derive(Clone)]
pub struct DockerCli {
    shell: Arc<dyn Shell>,
}

fn is_missing(output: &ExecOutput) -> bool {
    output.exit_code != 0
        && (output.stderr.contains("No such container") || output.stderr.contains("No such object"))
}

impl DockerCli {
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { shell }
    }

    pub fn shell(&self) -> &Arc<dyn Shell> {
        &self.shell
    }

    /// Run a docker command against a named container, mapping "no such
    /// container" to `NotFound`
    async fn container_command(
        &self,
        command: String,
        name: &str,
        log: Option<&LogStream>,
    ) -> Result<String, OrchestratorError> {
        let output = self.shell.execute(&command, log).await?;
        if is_missing(&output) {
            return Err(OrchestratorError::NotFound(format!("instance {}", name)));
        }
        output.into_result(&command)
    }

    /// Build `context_dir` into `tag`, optionally with a non-default manifest
    pub async fn build(
        &self,
        context_dir: &str,
        dockerfile: Option<&str>,
        tag: &str,
        log: Option<&LogStream>,
    ) -> Result<(), OrchestratorError> {
        info!("Building image {} on {}", tag, self.shell.describe());
        let file_arg = dockerfile
            .map(|f| format!(" -f {}", shell_quote(f)))
            .unwrap_or_default();
        let command = format!(
            "docker build -t {}{} {}",
            shell_quote(tag),
            file_arg,
            shell_quote(context_dir)
        );
        self.shell.run(&command, log).await?;
        Ok(())
    }

    /// Start a new container, returning its instance id
    pub async fn run(&self, spec: &RunSpec, log: Option<&LogStream>) -> Result<String, OrchestratorError> {
        debug!("Starting instance {} from {}", spec.name, spec.image);
        self.shell.run(&spec.to_command(), log).await?;
        Ok(spec.name.clone())
    }

    pub async fn start(&self, name: &str) -> Result<(), OrchestratorError> {
        self.container_command(format!("docker start {}", shell_quote(name)), name, None)
            .await
            .map(|_| ())
    }

    pub async fn stop(&self, name: &str) -> Result<(), OrchestratorError> {
        self.container_command(format!("docker stop {}", shell_quote(name)), name, None)
            .await
            .map(|_| ())
    }

    pub async fn restart(&self, name: &str) -> Result<(), OrchestratorError> {
        self.container_command(format!("docker restart {}", shell_quote(name)), name, None)
            .await
            .map(|_| ())
    }

    pub async fn remove(&self, name: &str) -> Result<(), OrchestratorError> {
        self.container_command(format!("docker rm -f {}", shell_quote(name)), name, None)
            .await
            .map(|_| ())
    }

    /// Run `command` inside the container. A non-zero exit is returned, not raised.
    pub async fn exec(&self, name: &str, command: &str) -> Result<ExecOutput, OrchestratorError> {
        let docker_command = format!(
            "docker exec {} sh -c {}",
            shell_quote(name),
            shell_quote(command)
        );
        let output = self.shell.execute(&docker_command, None).await?;
        if is_missing(&output) {
            return Err(OrchestratorError::NotFound(format!("instance {}", name)));
        }
        Ok(output)
    }

    /// Last `tail` lines of combined container output
    pub async fn logs(&self, name: &str, tail: usize) -> Result<String, OrchestratorError> {
        let command = format!("docker logs --tail {} {} 2>&1", tail, shell_quote(name));
        let output = self.shell.execute(&command, None).await?;
        if output.exit_code != 0
            && (output.stdout.contains("No such container") || output.stderr.contains("No such container"))
        {
            return Err(OrchestratorError::NotFound(format!("instance {}", name)));
        }
        output.into_result(&command)
    }

    pub async fn state(&self, name: &str) -> Result<InstanceState, OrchestratorError> {
        let command = format!(
            "docker inspect -f '{{{{.State.Status}}}}' {}",
            shell_quote(name)
        );
        match self.container_command(command, name, None).await {
            Ok(status) => Ok(InstanceState::parse(&status)),
            Err(e) if e.is_not_found() => Ok(InstanceState::Missing),
            Err(e) => Err(e),
        }
    }

    /// Poll until the container reports running. `Missing` fails immediately.
    pub async fn wait_running(&self, name: &str, poll: PollOptions) -> Result<(), OrchestratorError> {
        let deadline = Instant::now() + poll.timeout;
        loop {
            let state = self.state(name).await?;
            match state {
                InstanceState::Running => return Ok(()),
                InstanceState::Missing => {
                    return Err(OrchestratorError::NotFound(format!("instance {}", name)))
                }
                _ => debug!("Instance {} is {}, waiting", name, state),
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::Timeout(format!(
                    "instance {} not running after {}s (last state: {})",
                    name,
                    poll.timeout.as_secs(),
                    state
                )));
            }
            tokio::time::sleep(poll.interval).await;
        }
    }

    pub async fn ensure_network(&self, network: &str) -> Result<(), OrchestratorError> {
        let command = format!(
            "docker network inspect {net} >/dev/null 2>&1 || docker network create {net}",
            net = shell_quote(network)
        );
        self.shell.run(&command, None).await?;
        Ok(())
    }

    pub async fn is_connected(&self, name: &str, network: &str) -> Result<bool, OrchestratorError> {
        let command = format!(
            "docker inspect -f '{{{{json .NetworkSettings.Networks}}}}' {}",
            shell_quote(name)
        );
        let networks = self.container_command(command, name, None).await?;
        let parsed: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(networks.trim()).unwrap_or_default();
        Ok(parsed.contains_key(network))
    }

    /// Attach a container to `network` unless already attached
    pub async fn connect_network(&self, name: &str, network: &str) -> Result<(), OrchestratorError> {
        if self.is_connected(name, network).await? {
            return Ok(());
        }
        self.container_command(
            format!(
                "docker network connect {} {}",
                shell_quote(network),
                shell_quote(name)
            ),
            name,
            None,
        )
        .await
        .map(|_| ())
    }

    /// Names of all containers (any state) carrying `label` (`key=value`)
    pub async fn list_by_label(&self, label: &str) -> Result<Vec<String>, OrchestratorError> {
        self.ps_names(&format!("docker ps -a --filter {}", shell_quote(&format!("label={}", label))))
            .await
    }

    /// Like `list_by_label`, running containers only
    pub async fn running_by_label(&self, label: &str) -> Result<Vec<String>, OrchestratorError> {
        self.ps_names(&format!(
            "docker ps --filter status=running --filter {}",
            shell_quote(&format!("label={}", label))
        ))
        .await
    }

    async fn ps_names(&self, ps: &str) -> Result<Vec<String>, OrchestratorError> {
        let command = format!("{} --format '{{{{.Names}}}}'", ps);
        let output = self.shell.run(&command, None).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub async fn mounts(&self, name: &str) -> Result<Vec<Mount>, OrchestratorError> {
        let command = format!("docker inspect -f '{{{{json .Mounts}}}}' {}", shell_quote(name));
        let json = self.container_command(command, name, None).await?;
        Ok(serde_json::from_str(json.trim())?)
    }

    pub async fn label(&self, name: &str, key: &str) -> Result<Option<String>, OrchestratorError> {
        let command = format!(
            "docker inspect -f '{{{{index .Config.Labels \"{}\"}}}}' {}",
            key,
            shell_quote(name)
        );
        let value = self.container_command(command, name, None).await?;
        let value = value.trim();
        if value.is_empty() || value == "<no value>" {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_spec_command() {
        let mut spec = RunSpec {
            name: "blog-abc1234".into(),
            image: "dockhand-blog:abc1234".into(),
            network: Some("dockhand".into()),
            env_file: Some("/opt/dockhand/apps/blog.env".into()),
            restart_policy: Some("unless-stopped".into()),
            ..Default::default()
        };
        spec.labels.insert("dockhand.app".into(), "blog".into());
        spec.labels.insert(
            "traefik.http.routers.blog.rule".into(),
            "Host(`blog.example.com`)".into(),
        );

        let command = spec.to_command();
        assert!(command.starts_with("docker run -d --name blog-abc1234 --restart unless-stopped"));
        assert!(command.contains("--network dockhand"));
        assert!(command.contains("--label dockhand.app=blog"));
        assert!(command.contains("'traefik.http.routers.blog.rule=Host(`blog.example.com`)'"));
        assert!(command.ends_with("dockhand-blog:abc1234"));
    }

    #[test]
    fn test_instance_state_parse() {
        assert_eq!(InstanceState::parse("running\n"), InstanceState::Running);
        assert_eq!(InstanceState::parse("exited"), InstanceState::Exited);
        assert_eq!(InstanceState::parse("weird"), InstanceState::Dead);
    }

    #[test]
    fn test_mounts_json() {
        let mounts: Vec<Mount> = serde_json::from_str(
            r#"[{"Type":"bind","Source":"/srv/data","Destination":"/data","Mode":"","RW":true}]"#,
        )
        .unwrap();
        assert_eq!(mounts[0].source, "/srv/data");
        assert_eq!(mounts[0].destination, "/data");
    }
}
