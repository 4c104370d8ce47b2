//! Application configuration options

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::deploy::DeployOptions;
use crate::runtime::PollOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{ObjectStorageSettings, ProxySettings, Settings};
use crate::workers::update_watcher;

/// Main application options
#[derive(Debug)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Data directory layout
    pub layout: StorageLayout,

    /// Enable the control API
    pub enable_server: bool,

    /// Enable the update watcher worker
    pub enable_update_watcher: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Deploy pipeline timings
    pub deploy: DeployTimings,

    /// Reverse proxy configuration
    pub proxy: ProxySettings,

    /// Update watcher options
    pub update_watcher: update_watcher::Options,

    /// Source control provider
    pub source_control: SourceControlOptions,

    /// Optional backup upload target
    pub object_storage: Option<ObjectStorageSettings>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            enable_server: true,
            enable_update_watcher: true,
            server: ServerOptions::default(),
            deploy: DeployTimings::default(),
            proxy: ProxySettings::default(),
            update_watcher: update_watcher::Options::default(),
            source_control: SourceControlOptions::default(),
            object_storage: None,
        }
    }
}

impl AppOptions {
    /// Build options from a settings file rooted at `layout`
    pub fn from_settings(settings: Settings, layout: StorageLayout) -> Self {
        let defaults = Self::default();
        Self {
            layout,
            enable_server: settings.server.enabled,
            enable_update_watcher: settings.update_watcher.enabled,
            server: ServerOptions {
                host: settings.server.host,
                port: settings.server.port,
            },
            deploy: DeployTimings {
                remote_work_dir: settings.deploy.remote_work_dir,
                running_timeout: Duration::from_secs(settings.deploy.running_timeout_secs),
                poll_interval: Duration::from_millis(settings.deploy.poll_interval_ms),
                failed_log_tail_lines: settings.deploy.failed_log_tail_lines,
            },
            proxy: settings.proxy,
            update_watcher: update_watcher::Options {
                interval: Duration::from_secs(settings.update_watcher.interval_secs),
                ..defaults.update_watcher
            },
            source_control: SourceControlOptions {
                api_base_url: settings.source_control.api_base_url,
                token: settings
                    .source_control
                    .token
                    .map(|t| SecretString::from(t.expose_secret().to_string())),
            },
            object_storage: settings.object_storage,
            ..defaults
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Control API server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7420,
        }
    }
}

/// Deploy pipeline timings and paths
#[derive(Debug, Clone)]
pub struct DeployTimings {
    pub remote_work_dir: String,
    pub running_timeout: Duration,
    pub poll_interval: Duration,
    pub failed_log_tail_lines: usize,
}

impl Default for DeployTimings {
    fn default() -> Self {
        Self {
            remote_work_dir: "/opt/dockhand/apps".to_string(),
            running_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            failed_log_tail_lines: 200,
        }
    }
}

impl DeployTimings {
    pub fn poll(&self) -> PollOptions {
        PollOptions {
            interval: self.poll_interval,
            timeout: self.running_timeout,
        }
    }

    pub fn deploy_options(&self, layout: &StorageLayout) -> DeployOptions {
        DeployOptions {
            remote_work_dir: self.remote_work_dir.clone(),
            local_repos_dir: layout.repos_dir().path().to_path_buf(),
            poll: self.poll(),
            failed_log_tail_lines: self.failed_log_tail_lines,
        }
    }
}

/// Source control provider options
#[derive(Debug)]
pub struct SourceControlOptions {
    pub api_base_url: String,
    pub token: Option<SecretString>,
}

impl Default for SourceControlOptions {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            token: None,
        }
    }
}
