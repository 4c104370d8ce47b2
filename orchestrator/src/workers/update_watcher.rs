//! Periodic upstream check for local apps

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::errors::OrchestratorError;
use crate::models::app::App;
use crate::remote::ShellProvider;
use crate::scm::SourceControl;
use crate::store::Repository;

/// Update watcher worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between sweeps
    pub interval: Duration,

    /// Initial delay before the first sweep
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            initial_delay: Duration::from_secs(10),
        }
    }
}

/// Result of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub updates: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Compares the deployed commit of local apps with their branch head.
/// It only reads and flags; instances are never touched.
pub struct UpdateWatcher {
    apps: Repository<App>,
    shells: Arc<dyn ShellProvider>,
    scm: Arc<dyn SourceControl>,
    repos_dir: PathBuf,
}

impl UpdateWatcher {
    pub fn new(
        apps: Repository<App>,
        shells: Arc<dyn ShellProvider>,
        scm: Arc<dyn SourceControl>,
        repos_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            apps,
            shells,
            scm,
            repos_dir: repos_dir.into(),
        }
    }

    /// Sequential pass over every app. Per-app failures are logged and
    /// counted, never propagated.
    pub async fn sweep(&self) -> Result<SweepSummary, OrchestratorError> {
        let mut summary = SweepSummary::default();
        for app in self.apps.list().await? {
            if app.host_id.is_some() || app.deployed_commit().is_none() {
                summary.skipped += 1;
                continue;
            }
            match self.check_app(&app).await {
                Ok(true) => {
                    summary.checked += 1;
                    summary.updates += 1;
                }
                Ok(false) => summary.checked += 1,
                Err(e) => {
                    warn!("Update check for app {} failed: {}", app.id, e);
                    summary.failed += 1;
                }
            }
        }
        debug!("Update sweep finished: {:?}", summary);
        Ok(summary)
    }

    /// Fetch the tracked branch and record whether it moved past the
    /// deployed commit
    pub async fn check_app(&self, app: &App) -> Result<bool, OrchestratorError> {
        let Some(deployed) = app.deployed_commit().map(str::to_string) else {
            return Ok(false);
        };
        let shell = self.shells.shell(None).await?;
        let token = if app.source.private {
            self.scm.access_token().await?
        } else {
            None
        };
        let work_dir = self.repos_dir.join(&app.id).to_string_lossy().to_string();
        let head = crate::deploy::git::fetch_upstream_head(
            shell.as_ref(),
            &work_dir,
            &app.source.repo_url,
            &app.source.branch,
            token.as_ref(),
        )
        .await?;

        let available = head != deployed;
        let latest = head.clone();
        self.apps
            .update(&app.id, move |a| {
                a.update_available = available;
                a.latest_upstream_commit = Some(latest);
                a.last_update_check = Some(Utc::now());
                Ok(())
            })
            .await?;
        if available {
            info!("Update available for app {}: {} -> {}", app.id, deployed, head);
        }
        Ok(available)
    }
}

/// Run the update watcher worker
pub async fn run<S, F>(
    options: &Options,
    watcher: &UpdateWatcher,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Update watcher starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Update watcher shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        if let Err(e) = watcher.sweep().await {
            error!("Update sweep failed: {}", e);
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Update watcher shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
