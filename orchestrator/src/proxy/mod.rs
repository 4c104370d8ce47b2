//! Reverse proxy configuration
//!
//! Two strategies share one shared container network. The dynamic strategy
//! runs a Traefik controller (`dockhand-proxy`) that discovers routes from
//! container labels. The static strategy writes one Nginx server stanza per
//! owner and reloads Nginx; it is used when the controller is absent and
//! cannot be installed.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::OrchestratorError;
use crate::remote::Shell;
use crate::runtime::{DockerCli, InstanceState, RunSpec};
use crate::storage::settings::ProxySettings;
use crate::utils::{shell_quote, write_file_then};

/// Name of the dynamic controller container
pub const PROXY_CONTAINER: &str = "dockhand-proxy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStrategy {
    Dynamic,
    Static,
}

/// One public hostname routed to an internal port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Router/service name, unique per host
    pub key: String,
    pub domain: String,
    pub port: u16,
}

impl Route {
    pub fn new(key: impl Into<String>, domain: impl Into<String>, port: u16) -> Self {
        Self {
            key: route_key(&key.into()),
            domain: domain.into(),
            port,
        }
    }
}

fn route_key(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Rejects anything that could break out of a label or config stanza
pub fn validate_domain(domain: &str) -> Result<(), OrchestratorError> {
    if domain.is_empty() {
        return Err(OrchestratorError::ValidationError(
            "Domain cannot be empty".to_string(),
        ));
    }
    if domain.contains("..") || domain.contains('/') || domain.contains('\\') {
        return Err(OrchestratorError::ValidationError(format!(
            "Path traversal detected in domain: '{}'",
            domain
        )));
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        return Err(OrchestratorError::ValidationError(format!(
            "Invalid characters in domain name: '{}'",
            domain
        )));
    }
    Ok(())
}

pub struct ProxyConfigurator {
    settings: ProxySettings,
}

impl ProxyConfigurator {
    pub fn new(settings: ProxySettings) -> Self {
        Self { settings }
    }

    pub fn network(&self) -> &str {
        &self.settings.network
    }

    /// Ensure the shared network exists and choose a strategy, installing
    /// (or restarting) the dynamic controller when needed
    pub async fn ensure_ready(&self, shell: &Arc<dyn Shell>) -> Result<ProxyStrategy, OrchestratorError> {
        let docker = DockerCli::new(shell.clone());
        docker.ensure_network(&self.settings.network).await?;

        match docker.state(PROXY_CONTAINER).await? {
            InstanceState::Running => return Ok(ProxyStrategy::Dynamic),
            InstanceState::Missing => {}
            _ => match docker.start(PROXY_CONTAINER).await {
                Ok(()) => return Ok(ProxyStrategy::Dynamic),
                Err(e) => warn!("Failed to start existing {}: {}", PROXY_CONTAINER, e),
            },
        }

        if !self.settings.install_dynamic {
            return Ok(ProxyStrategy::Static);
        }

        match docker.run(&self.controller_spec(), None).await {
            Ok(_) => {
                info!("Installed {} on {}", PROXY_CONTAINER, shell.describe());
                Ok(ProxyStrategy::Dynamic)
            }
            Err(e) => {
                warn!(
                    "Dynamic proxy install failed on {}, falling back to static: {}",
                    shell.describe(),
                    e
                );
                // don't leave a half-created controller behind
                let _ = docker.remove(PROXY_CONTAINER).await;
                Ok(ProxyStrategy::Static)
            }
        }
    }

    fn controller_spec(&self) -> RunSpec {
        let network = &self.settings.network;
        RunSpec {
            name: PROXY_CONTAINER.to_string(),
            image: self.settings.dynamic_image.clone(),
            network: Some(network.clone()),
            restart_policy: Some("unless-stopped".to_string()),
            publish: vec!["80:80".to_string()],
            volumes: vec!["/var/run/docker.sock:/var/run/docker.sock:ro".to_string()],
            args: vec![
                "--providers.docker=true".to_string(),
                "--providers.docker.exposedbydefault=false".to_string(),
                format!("--providers.docker.network={}", network),
                "--entrypoints.web.address=:80".to_string(),
            ],
            ..Default::default()
        }
    }

    /// Routing labels for the dynamic strategy
    pub fn labels_for(&self, routes: &[Route]) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if routes.is_empty() {
            return labels;
        }
        labels.insert("traefik.enable".to_string(), "true".to_string());
        labels.insert(
            "traefik.docker.network".to_string(),
            self.settings.network.clone(),
        );
        for route in routes {
            labels.insert(
                format!("traefik.http.routers.{}.rule", route.key),
                format!("Host(`{}`)", route.domain),
            );
            labels.insert(
                format!("traefik.http.routers.{}.entrypoints", route.key),
                "web".to_string(),
            );
            labels.insert(
                format!("traefik.http.routers.{}.service", route.key),
                route.key.clone(),
            );
            labels.insert(
                format!(
                    "traefik.http.services.{}.loadbalancer.server.port",
                    route.key
                ),
                route.port.to_string(),
            );
        }
        labels
    }

    /// Nginx stanza for the static strategy
    pub fn static_config(&self, routes: &[Route]) -> String {
        routes
            .iter()
            .map(|route| {
                format!(
                    r#"server {{
    listen 80;
    server_name {domain};

    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
    }}
}}
"#,
                    domain = route.domain,
                    port = route.port
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn static_config_path(&self, owner: &str) -> String {
        format!(
            "{}/dockhand-{}.conf",
            self.settings.static_conf_dir.trim_end_matches('/'),
            route_key(owner)
        )
    }

    /// Adjust a run spec so the new instance is routable under `strategy`
    pub fn prepare_run_spec(&self, strategy: ProxyStrategy, routes: &[Route], spec: &mut RunSpec) {
        spec.network = Some(self.settings.network.clone());
        match strategy {
            ProxyStrategy::Dynamic => spec.labels.extend(self.labels_for(routes)),
            ProxyStrategy::Static => {
                for route in routes {
                    spec.publish
                        .push(format!("127.0.0.1:{port}:{port}", port = route.port));
                }
            }
        }
    }

    /// Make `routes` live for `owner`. Re-publishing overwrites in place.
    pub async fn publish(
        &self,
        shell: &Arc<dyn Shell>,
        strategy: ProxyStrategy,
        owner: &str,
        instance: &str,
        routes: &[Route],
    ) -> Result<(), OrchestratorError> {
        for route in routes {
            validate_domain(&route.domain)?;
        }
        match strategy {
            ProxyStrategy::Dynamic => {
                // labels were applied at instance creation
                DockerCli::new(shell.clone())
                    .connect_network(instance, &self.settings.network)
                    .await
            }
            ProxyStrategy::Static => {
                let path = self.static_config_path(owner);
                let command = format!(
                    "mkdir -p {dir} && {write}",
                    dir = shell_quote(&self.settings.static_conf_dir),
                    write = write_file_then(&path, &self.static_config(routes), reload_nginx_command())
                );
                shell.run(&command, None).await?;
                info!("Published static routes for {} at {}", owner, path);
                Ok(())
            }
        }
    }

    /// Remove every rule owned by `owner`. Dynamic rules live on the owner's
    /// containers and disappear with them; static stanzas are deleted here.
    pub async fn retract(&self, shell: &Arc<dyn Shell>, owner: &str) -> Result<(), OrchestratorError> {
        let path = shell_quote(&self.static_config_path(owner));
        let command = format!(
            "if [ -f {path} ]; then rm -f {path} && {reload}; fi",
            path = path,
            reload = reload_nginx_command()
        );
        shell.run(&command, None).await?;
        Ok(())
    }
}

fn reload_nginx_command() -> &'static str {
    "nginx -t && (systemctl reload nginx || nginx -s reload)"
}
