//! Settings file management

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Orchestrator settings
#[derive(Debug, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub json_logs: bool,

    /// Also write daily-rolling log files under `<data_dir>/logs`
    #[serde(default = "default_true")]
    pub file_logs: bool,

    /// Control API configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Deploy pipeline configuration
    #[serde(default)]
    pub deploy: DeploySettings,

    /// Reverse proxy configuration
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Update watcher configuration
    #[serde(default)]
    pub update_watcher: UpdateWatcherSettings,

    /// Source control provider configuration
    #[serde(default)]
    pub source_control: SourceControlSettings,

    /// Optional S3-compatible backup target
    #[serde(default)]
    pub object_storage: Option<ObjectStorageSettings>,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            file_logs: true,
            server: ServerSettings::default(),
            deploy: DeploySettings::default(),
            proxy: ProxySettings::default(),
            update_watcher: UpdateWatcherSettings::default(),
            source_control: SourceControlSettings::default(),
            object_storage: None,
        }
    }
}

/// Control API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    7420
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Deploy pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    /// Working directory root for apps on remote hosts
    #[serde(default = "default_remote_work_dir")]
    pub remote_work_dir: String,

    /// How long a new instance may take to report running
    #[serde(default = "default_running_timeout")]
    pub running_timeout_secs: u64,

    /// Spacing between instance state probes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Lines of transcript kept on a failed deployment record
    #[serde(default = "default_log_tail")]
    pub failed_log_tail_lines: usize,
}

fn default_remote_work_dir() -> String {
    "/opt/dockhand/apps".to_string()
}

fn default_running_timeout() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_log_tail() -> usize {
    200
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            remote_work_dir: default_remote_work_dir(),
            running_timeout_secs: default_running_timeout(),
            poll_interval_ms: default_poll_interval(),
            failed_log_tail_lines: default_log_tail(),
        }
    }
}

/// Reverse proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Shared overlay network joined by every routed instance
    #[serde(default = "default_network")]
    pub network: String,

    /// Image for the dynamic (label-driven) proxy controller
    #[serde(default = "default_proxy_image")]
    pub dynamic_image: String,

    /// Install the dynamic controller when absent
    #[serde(default = "default_true")]
    pub install_dynamic: bool,

    /// Directory for static engine config stanzas
    #[serde(default = "default_static_conf_dir")]
    pub static_conf_dir: String,
}

fn default_network() -> String {
    "dockhand".to_string()
}

fn default_proxy_image() -> String {
    "traefik:v3.1".to_string()
}

fn default_static_conf_dir() -> String {
    "/etc/nginx/conf.d".to_string()
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            network: default_network(),
            dynamic_image: default_proxy_image(),
            install_dynamic: true,
            static_conf_dir: default_static_conf_dir(),
        }
    }
}

/// Update watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateWatcherSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_watch_interval")]
    pub interval_secs: u64,
}

fn default_watch_interval() -> u64 {
    300
}

impl Default for UpdateWatcherSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_watch_interval(),
        }
    }
}

/// Source control provider settings
#[derive(Debug, Serialize, Deserialize)]
pub struct SourceControlSettings {
    #[serde(default = "default_github_api")]
    pub api_base_url: String,

    /// Access token obtained out of band (OAuth exchange happens elsewhere)
    #[serde(default, skip_serializing)]
    pub token: Option<SecretString>,
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

impl Default for SourceControlSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_github_api(),
            token: None,
        }
    }
}

/// S3-compatible object storage settings
#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectStorageSettings {
    pub endpoint: String,

    #[serde(default = "default_region")]
    pub region: String,

    pub bucket: String,

    pub access_key: String,

    #[serde(skip_serializing)]
    pub secret_key: SecretString,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
