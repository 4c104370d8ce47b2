//! Deploy pipeline
//!
//! One pipeline serves hosted and local apps: sync source, resolve the
//! commit, write the env file, ensure a build manifest, build, stop the
//! current instance, start the new one on the shared proxy network, route it
//! and wait until it runs. The app record is only touched at the start and at
//! the end, so a failure can always restore consistent pointers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::deploy::fsm::{AppEvent, AppFsm};
use crate::deploy::git::{self, Checkout};
use crate::deploy::manifest::{env_file_contents, ProjectKind, ENV_FILE_SUFFIX, GENERATED_DOCKERFILE};
use crate::errors::OrchestratorError;
use crate::events::{EventBus, LogStream, Topic};
use crate::models::app::{App, AppStatus, Deployment, DeploymentStatus, SourceRef};
use crate::models::host::Host;
use crate::provision::ready_host;
use crate::provision::script::REMOTE_ROOT;
use crate::proxy::{validate_domain, ProxyConfigurator, Route};
use crate::remote::{ExecOutput, Shell, ShellProvider};
use crate::runtime::{DockerCli, InstanceState, PollOptions, RunSpec};
use crate::scm::SourceControl;
use crate::store::Repository;
use crate::utils::{generate_id, random_alphanumeric, shell_quote, short_commit, write_file_command};

/// Label carrying the owning app id on every instance
pub const APP_LABEL: &str = "dockhand.app";

/// Deploy pipeline settings
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Working trees of hosted apps live under this directory on the host
    pub remote_work_dir: String,

    /// Working trees of local apps
    pub local_repos_dir: PathBuf,
    pub poll: PollOptions,
    pub failed_log_tail_lines: usize,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            remote_work_dir: format!("{}/apps", REMOTE_ROOT),
            local_repos_dir: PathBuf::from("/var/lib/dockhand/repos"),
            poll: PollOptions::default(),
            failed_log_tail_lines: 200,
        }
    }
}

/// What to deploy
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    /// Defaults to the app's tracked branch
    pub branch: Option<String>,

    /// Pinned commit, checked out detached
    pub commit: Option<String>,
    pub operator: String,
}

/// Registration request for a new app
#[derive(Debug, Clone, Deserialize)]
pub struct NewApp {
    pub name: String,
    #[serde(default)]
    pub host_id: Option<String>,
    pub repo_url: String,

    /// Resolved through source control when absent
    #[serde(default)]
    pub branch: Option<String>,

    /// Resolved through source control when absent
    #[serde(default)]
    pub private: Option<bool>,
    #[serde(default)]
    pub domain: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// Where a failed pipeline stopped
struct StepFailure {
    cause: OrchestratorError,
    commit: Option<String>,
    instance: Option<String>,
}

impl StepFailure {
    fn new(cause: OrchestratorError) -> Self {
        Self {
            cause,
            commit: None,
            instance: None,
        }
    }
}

struct PipelineOutcome {
    commit: String,
    instance: String,
}

pub struct DeployOrchestrator {
    apps: Repository<App>,
    hosts: Repository<Host>,
    shells: Arc<dyn ShellProvider>,
    proxy: Arc<ProxyConfigurator>,
    scm: Arc<dyn SourceControl>,
    events: EventBus,
    options: DeployOptions,
}

impl DeployOrchestrator {
    pub fn new(
        apps: Repository<App>,
        hosts: Repository<Host>,
        shells: Arc<dyn ShellProvider>,
        proxy: Arc<ProxyConfigurator>,
        scm: Arc<dyn SourceControl>,
        events: EventBus,
        options: DeployOptions,
    ) -> Self {
        Self {
            apps,
            hosts,
            shells,
            proxy,
            scm,
            events,
            options,
        }
    }

    /// Runtime env file of `app`; a sibling of the work tree so `COPY .`
    /// never picks it up
    pub fn env_file(&self, app: &App) -> String {
        format!("{}{}", self.work_dir(app), ENV_FILE_SUFFIX)
    }

    pub fn work_dir(&self, app: &App) -> String {
        match app.host_id {
            Some(_) => format!(
                "{}/{}",
                self.options.remote_work_dir.trim_end_matches('/'),
                app.id
            ),
            None => self
                .options
                .local_repos_dir
                .join(&app.id)
                .to_string_lossy()
                .to_string(),
        }
    }

    async fn shell_for(&self, app: &App) -> Result<Arc<dyn Shell>, OrchestratorError> {
        let host = ready_host(&self.hosts, app.host_id.as_deref()).await?;
        self.shells.shell(host.as_ref()).await
    }

    fn routes(app: &App) -> Vec<Route> {
        app.domain
            .iter()
            .map(|domain| Route::new(format!("app-{}", app.id), domain.clone(), app.port))
            .collect()
    }

    /// Store a new `inactive` app
    pub async fn register_app(&self, new_app: NewApp) -> Result<App, OrchestratorError> {
        git::validate_repo_url(&new_app.repo_url)?;
        if let Some(domain) = &new_app.domain {
            validate_domain(domain)?;
        }
        if new_app.port == 0 {
            return Err(OrchestratorError::ValidationError(
                "App port must be non-zero".to_string(),
            ));
        }
        env_file_contents(&new_app.env_vars, new_app.port)?;
        if let Some(host_id) = &new_app.host_id {
            self.hosts.get(host_id).await?;
        }

        let branch = match new_app.branch {
            Some(branch) => branch,
            None => self.scm.default_branch(&new_app.repo_url).await?,
        };
        git::validate_ref("branch", &branch)?;
        let private = match new_app.private {
            Some(private) => private,
            None => self.scm.is_private(&new_app.repo_url).await?,
        };

        let app = App {
            id: generate_id(),
            name: new_app.name,
            host_id: new_app.host_id,
            source: SourceRef {
                repo_url: new_app.repo_url,
                branch,
                private,
            },
            domain: new_app.domain,
            port: new_app.port,
            env_vars: new_app.env_vars,
            current_instance_id: None,
            previous_instance_id: None,
            status: AppStatus::Inactive,
            deployments: Vec::new(),
            update_available: false,
            latest_upstream_commit: None,
            last_update_check: None,
            created_at: Utc::now(),
        };
        self.apps.put(&app).await?;
        info!("Registered app {} ({})", app.name, app.id);
        Ok(app)
    }

    /// Run the pipeline. On failure the app ends in `error` with a failed
    /// deployment recorded and `PartialFailure` is returned.
    pub async fn deploy(&self, app_id: &str, request: DeployRequest) -> Result<Deployment, OrchestratorError> {
        let app = self
            .apps
            .update(app_id, |a| {
                a.status = AppFsm::new(a.status).process(AppEvent::Deploy)?;
                Ok(())
            })
            .await?;
        self.events.status(Topic::App, app_id, AppStatus::Deploying);

        let branch = request
            .branch
            .clone()
            .unwrap_or_else(|| app.source.branch.clone());
        let log = LogStream::new(&self.events, Topic::App, app_id);
        log.line(format!(
            "Deploying {} ({}{}) requested by {}",
            app.name,
            branch,
            request
                .commit
                .as_deref()
                .map(|c| format!(" @ {}", short_commit(c)))
                .unwrap_or_default(),
            request.operator
        ));

        let old_current = app.current_instance_id.clone();

        let shell = match self.shell_for(&app).await {
            Ok(shell) => shell,
            Err(e) => {
                return self
                    .fail(&app, None, &request, &branch, StepFailure::new(e), old_current, &log)
                    .await
            }
        };

        match self
            .run_pipeline(&app, &shell, &branch, request.commit.as_deref(), old_current.as_deref(), &log)
            .await
        {
            Ok(outcome) => self.succeed(&app, &request, &branch, outcome, old_current, &log).await,
            Err(failure) => {
                self.fail(&app, Some(&shell), &request, &branch, failure, old_current, &log)
                    .await
            }
        }
    }

    async fn run_pipeline(
        &self,
        app: &App,
        shell: &Arc<dyn Shell>,
        branch: &str,
        commit: Option<&str>,
        old_current: Option<&str>,
        log: &LogStream,
    ) -> Result<PipelineOutcome, StepFailure> {
        let docker = DockerCli::new(shell.clone());
        let work_dir = self.work_dir(app);

        // 1-2. source and commit
        log.progress(5, "Fetching source");
        let token = if app.source.private {
            self.scm.access_token().await.map_err(StepFailure::new)?
        } else {
            None
        };
        let checkout = Checkout {
            work_dir: &work_dir,
            repo_url: &app.source.repo_url,
            branch,
            commit,
        };
        let commit = git::sync_source(shell.as_ref(), &checkout, token.as_ref(), Some(log))
            .await
            .map_err(StepFailure::new)?;
        log.line(format!("Checked out {}", commit));

        let with_commit = |cause: OrchestratorError| StepFailure {
            cause,
            commit: Some(commit.clone()),
            instance: None,
        };

        // 3. env file
        let env_path = self.env_file(app);
        let env_contents = env_file_contents(&app.env_vars, app.port).map_err(with_commit)?;
        shell
            .run(
                &format!(
                    "touch {path} && chmod 600 {path} && {write}",
                    path = shell_quote(&env_path),
                    write = write_file_command(&env_path, &env_contents)
                ),
                None,
            )
            .await
            .map_err(with_commit)?;

        // 4. manifest
        let listing = shell
            .run(&format!("ls -A {}", shell_quote(&work_dir)), None)
            .await
            .map_err(with_commit)?;
        let files: Vec<&str> = listing.lines().map(str::trim).collect();
        let dockerfile = if files.contains(&"Dockerfile") {
            None
        } else {
            let kind = ProjectKind::detect(&files).ok_or_else(|| {
                with_commit(OrchestratorError::ValidationError(
                    "No Dockerfile and no recognizable project type".to_string(),
                ))
            })?;
            log.line(format!("No Dockerfile found, generating one for {:?}", kind));
            let path = format!("{}/{}", work_dir, GENERATED_DOCKERFILE);
            shell
                .run(&write_file_command(&path, &kind.dockerfile(app.port)), None)
                .await
                .map_err(with_commit)?;
            Some(path)
        };

        // 5. build
        log.progress(30, "Building image");
        let tag = format!("{}:{}", app.image_repo(), short_commit(&commit));
        docker
            .build(&work_dir, dockerfile.as_deref(), &tag, Some(log))
            .await
            .map_err(with_commit)?;

        // 6. stop the current instance, keep it for rollback
        if let Some(old) = old_current {
            log.line(format!("Stopping current instance {}", old));
            match docker.stop(old).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => warn!("Current instance {} is already gone", old),
                Err(e) => return Err(with_commit(e)),
            }
        }

        // 7. start and route
        log.progress(70, "Starting instance");
        let routes = Self::routes(app);
        let instance = format!(
            "{}-{}-{}",
            app.image_repo(),
            short_commit(&commit),
            random_alphanumeric(4).to_lowercase()
        );
        let mut spec = RunSpec {
            name: instance.clone(),
            image: tag,
            env_file: Some(env_path),
            restart_policy: Some("unless-stopped".to_string()),
            ..Default::default()
        };
        spec.labels.insert(APP_LABEL.to_string(), app.id.clone());

        let strategy = if routes.is_empty() {
            docker
                .ensure_network(self.proxy.network())
                .await
                .map_err(with_commit)?;
            spec.network = Some(self.proxy.network().to_string());
            spec.publish.push(format!("{port}:{port}", port = app.port));
            None
        } else {
            let strategy = self.proxy.ensure_ready(shell).await.map_err(with_commit)?;
            log.line(format!("Routing {} via {:?} proxy", routes[0].domain, strategy));
            self.proxy.prepare_run_spec(strategy, &routes, &mut spec);
            Some(strategy)
        };

        if let Err(cause) = docker.run(&spec, Some(log)).await {
            // `run -d` leaves a created container behind when the start fails
            match docker.remove(&instance).await {
                Ok(()) => log.line(format!("Removed unstarted instance {}", instance)),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Failed to remove unstarted instance {}: {}", instance, e),
            }
            return Err(with_commit(cause));
        }

        let with_instance = |cause: OrchestratorError| StepFailure {
            cause,
            commit: Some(commit.clone()),
            instance: Some(instance.clone()),
        };

        if let Some(strategy) = strategy {
            self.proxy
                .publish(shell, strategy, &app.id, &instance, &routes)
                .await
                .map_err(with_instance)?;
        }

        // 8. wait
        log.progress(90, "Waiting for instance to run");
        docker
            .wait_running(&instance, self.options.poll)
            .await
            .map_err(with_instance)?;

        Ok(PipelineOutcome { commit, instance })
    }

    async fn succeed(
        &self,
        app: &App,
        request: &DeployRequest,
        branch: &str,
        outcome: PipelineOutcome,
        old_current: Option<String>,
        log: &LogStream,
    ) -> Result<Deployment, OrchestratorError> {
        log.line(format!("Instance {} is running", outcome.instance));
        log.progress(100, "Deployed");

        let PipelineOutcome { commit, instance } = outcome;
        let deployment = Deployment {
            version: app.next_version(),
            branch: branch.to_string(),
            commit: commit.clone(),
            deployed_at: Utc::now(),
            status: DeploymentStatus::Success,
            logs: log.transcript(),
            operator: request.operator.clone(),
            instance_id: Some(instance.clone()),
        };

        let recorded = deployment.clone();
        self.apps
            .update(&app.id, move |a| {
                a.status = AppFsm::new(a.status).process(AppEvent::DeploySucceeded)?;
                a.previous_instance_id = old_current.or(a.previous_instance_id.take());
                a.current_instance_id = Some(instance);
                a.refresh_update_flag(&commit);
                a.deployments.push(recorded);
                Ok(())
            })
            .await?;
        self.events.status(Topic::App, &app.id, AppStatus::Active);
        info!("Deployed app {} as {}", app.id, deployment.version);
        Ok(deployment)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        app: &App,
        shell: Option<&Arc<dyn Shell>>,
        request: &DeployRequest,
        branch: &str,
        failure: StepFailure,
        old_current: Option<String>,
        log: &LogStream,
    ) -> Result<Deployment, OrchestratorError> {
        let cause = failure.cause.to_string();
        error!("Deploy of app {} failed: {}", app.id, cause);
        log.line(format!("ERROR: {}", cause));

        let rollback = match shell {
            Some(shell) => {
                let docker = DockerCli::new(shell.clone());
                if let Some(instance) = &failure.instance {
                    if let Err(e) = docker.stop(instance).await {
                        warn!("Failed to stop failed instance {}: {}", instance, e);
                    }
                }
                match (&old_current, shell.is_remote()) {
                    (None, _) => "no previous instance to restore".to_string(),
                    (Some(old), true) => format!(
                        "previous instance {} kept (not removed) for fast rollback",
                        old
                    ),
                    (Some(old), false) => match docker.start(old).await {
                        Ok(()) => format!("restarted previous instance {}", old),
                        Err(e) => format!("failed to restart previous instance {}: {}", old, e),
                    },
                }
            }
            None => match &old_current {
                Some(old) => format!("host unreachable; previous instance {} untouched", old),
                None => "no previous instance to restore".to_string(),
            },
        };
        log.line(format!("ROLLBACK: {}", rollback));

        let deployment = Deployment {
            version: app.next_version(),
            branch: branch.to_string(),
            commit: failure.commit.unwrap_or_default(),
            deployed_at: Utc::now(),
            status: DeploymentStatus::Failed,
            logs: log.tail(self.options.failed_log_tail_lines),
            operator: request.operator.clone(),
            instance_id: failure.instance,
        };

        let cause_for_fsm = cause.clone();
        let update = self
            .apps
            .update(&app.id, move |a| {
                a.status = AppFsm::new(a.status).process(AppEvent::DeployFailed(cause_for_fsm))?;
                a.current_instance_id = None;
                a.previous_instance_id = old_current.or(a.previous_instance_id.take());
                a.deployments.push(deployment);
                Ok(())
            })
            .await;
        if let Err(e) = update {
            error!("Failed to record failed deploy of app {}: {}", app.id, e);
        }
        self.events.status(Topic::App, &app.id, AppStatus::Error);

        Err(OrchestratorError::PartialFailure { cause, rollback })
    }

    /// Fast rollback (no index) swaps the previous instance back in without
    /// rebuilding. Full rollback re-runs the pipeline pinned to the commit of
    /// the deployment at `index`.
    pub async fn rollback(
        &self,
        app_id: &str,
        index: Option<usize>,
        operator: &str,
    ) -> Result<App, OrchestratorError> {
        match index {
            None => self.fast_rollback(app_id).await,
            Some(index) => {
                let app = self.apps.get(app_id).await?;
                let target = app.deployments.get(index).ok_or_else(|| {
                    OrchestratorError::NotFound(format!("deployment #{} of app {}", index, app_id))
                })?;
                if target.commit.is_empty() {
                    return Err(OrchestratorError::ValidationError(format!(
                        "deployment {} never resolved a commit",
                        target.version
                    )));
                }
                let request = DeployRequest {
                    branch: Some(target.branch.clone()),
                    commit: Some(target.commit.clone()),
                    operator: operator.to_string(),
                };
                info!("Rolling app {} back to {}", app_id, target.version);
                self.deploy(app_id, request).await?;
                self.apps.get(app_id).await
            }
        }
    }

    async fn fast_rollback(&self, app_id: &str) -> Result<App, OrchestratorError> {
        let app = self.apps.get(app_id).await?;
        // validate before touching any instance
        AppFsm::new(app.status).process(AppEvent::RolledBack)?;
        let previous = app.previous_instance_id.clone().ok_or_else(|| {
            OrchestratorError::ValidationError(format!(
                "app {} has no previous instance to roll back to",
                app_id
            ))
        })?;

        let shell = self.shell_for(&app).await?;
        let docker = DockerCli::new(shell.clone());

        if let Some(current) = &app.current_instance_id {
            match docker.stop(current).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => warn!("Current instance {} is already gone", current),
                Err(e) => return Err(e),
            }
        }
        let swapped = async {
            docker.start(&previous).await?;
            let routes = Self::routes(&app);
            if !routes.is_empty() {
                let strategy = self.proxy.ensure_ready(&shell).await?;
                self.proxy
                    .publish(&shell, strategy, &app.id, &previous, &routes)
                    .await?;
            }
            docker.wait_running(&previous, self.options.poll).await
        }
        .await;
        if let Err(cause) = swapped {
            let restored = self.restore_current(&docker, &app, &previous).await;
            error!("Fast rollback of app {} failed: {}", app_id, cause);
            return Err(OrchestratorError::PartialFailure {
                cause: cause.to_string(),
                rollback: restored,
            });
        }

        let old_current = app.current_instance_id.clone();
        let app = self
            .apps
            .update(app_id, move |a| {
                a.status = AppFsm::new(a.status).process(AppEvent::RolledBack)?;
                a.current_instance_id = Some(previous);
                a.previous_instance_id = old_current;
                Ok(())
            })
            .await?;
        self.events.status(Topic::App, app_id, AppStatus::Active);
        info!(
            "Rolled app {} back to instance {}",
            app_id,
            app.current_instance_id.as_deref().unwrap_or_default()
        );
        Ok(app)
    }

    /// Undo a failed swap: park `previous` again and bring the current
    /// instance back. The app record was never changed.
    async fn restore_current(&self, docker: &DockerCli, app: &App, previous: &str) -> String {
        if let Err(e) = docker.stop(previous).await {
            warn!("Failed to stop previous instance {}: {}", previous, e);
        }
        let Some(current) = &app.current_instance_id else {
            return "no current instance to restore".to_string();
        };
        let restarted = async {
            docker.start(current).await?;
            let routes = Self::routes(app);
            if !routes.is_empty() {
                let strategy = self.proxy.ensure_ready(docker.shell()).await?;
                self.proxy
                    .publish(docker.shell(), strategy, &app.id, current, &routes)
                    .await?;
            }
            Ok::<(), OrchestratorError>(())
        }
        .await;
        match restarted {
            Ok(()) => format!("restarted current instance {}", current),
            Err(e) => format!("failed to restart current instance {}: {}", current, e),
        }
    }

    pub async fn get_app(&self, app_id: &str) -> Result<App, OrchestratorError> {
        self.apps.get(app_id).await
    }

    pub async fn list_apps(&self) -> Result<Vec<App>, OrchestratorError> {
        self.apps.list().await
    }

    async fn current_instance(&self, app_id: &str) -> Result<(App, Option<String>), OrchestratorError> {
        let app = self.apps.get(app_id).await?;
        let current = app.current_instance_id.clone();
        Ok((app, current))
    }

    async fn docker_for(&self, app: &App) -> Result<DockerCli, OrchestratorError> {
        Ok(DockerCli::new(self.shell_for(app).await?))
    }

    /// `Missing` when the app has no instance or it no longer exists
    pub async fn instance_state(&self, app_id: &str) -> Result<InstanceState, OrchestratorError> {
        let (app, current) = self.current_instance(app_id).await?;
        match current {
            Some(instance) => self.docker_for(&app).await?.state(&instance).await,
            None => Ok(InstanceState::Missing),
        }
    }

    /// `None` when there is nothing to show
    pub async fn logs(&self, app_id: &str, tail: usize) -> Result<Option<String>, OrchestratorError> {
        let (app, current) = self.current_instance(app_id).await?;
        let Some(instance) = current else {
            return Ok(None);
        };
        match self.docker_for(&app).await?.logs(&instance, tail).await {
            Ok(logs) => Ok(Some(logs)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `None` when there is no instance to run in
    pub async fn exec(&self, app_id: &str, command: &str) -> Result<Option<ExecOutput>, OrchestratorError> {
        let (app, current) = self.current_instance(app_id).await?;
        let Some(instance) = current else {
            return Ok(None);
        };
        match self.docker_for(&app).await?.exec(&instance, command).await {
            Ok(output) => Ok(Some(output)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn require_current(&self, app_id: &str) -> Result<(DockerCli, String), OrchestratorError> {
        let (app, current) = self.current_instance(app_id).await?;
        let instance = current.ok_or_else(|| {
            OrchestratorError::NotFound(format!("app {} has no current instance", app_id))
        })?;
        Ok((self.docker_for(&app).await?, instance))
    }

    pub async fn start_instance(&self, app_id: &str) -> Result<(), OrchestratorError> {
        let (docker, instance) = self.require_current(app_id).await?;
        docker.start(&instance).await
    }

    pub async fn stop_instance(&self, app_id: &str) -> Result<(), OrchestratorError> {
        let (docker, instance) = self.require_current(app_id).await?;
        docker.stop(&instance).await
    }

    pub async fn restart_instance(&self, app_id: &str) -> Result<(), OrchestratorError> {
        let (docker, instance) = self.require_current(app_id).await?;
        docker.restart(&instance).await
    }

    /// Remove app instances other than current and previous. Returns the
    /// removed instance ids.
    pub async fn prune_instances(&self, app_id: &str) -> Result<Vec<String>, OrchestratorError> {
        let app = self.apps.get(app_id).await?;
        let docker = self.docker_for(&app).await?;
        let keep = [
            app.current_instance_id.as_deref(),
            app.previous_instance_id.as_deref(),
        ];

        let mut removed = Vec::new();
        for instance in docker.list_by_label(&app.instance_label()).await? {
            if keep.contains(&Some(instance.as_str())) {
                continue;
            }
            match docker.remove(&instance).await {
                Ok(()) => removed.push(instance),
                Err(e) => warn!("Failed to remove instance {}: {}", instance, e),
            }
        }
        info!("Pruned {} instances of app {}", removed.len(), app_id);
        Ok(removed)
    }

    /// Remove every instance, route, image and the working tree, then the record
    pub async fn delete_app(&self, app_id: &str) -> Result<(), OrchestratorError> {
        let app = self.apps.get(app_id).await?;
        if app.status == AppStatus::Deploying {
            return Err(OrchestratorError::InvalidTransition(format!(
                "app {} is deploying",
                app_id
            )));
        }
        let shell = self.shell_for(&app).await?;
        let docker = DockerCli::new(shell.clone());

        for instance in docker.list_by_label(&app.instance_label()).await? {
            match docker.remove(&instance).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if app.domain.is_some() {
            self.proxy.retract(&shell, &app.id).await?;
        }

        let images = format!(
            "docker images -q {} | sort -u | xargs -r docker rmi -f",
            shell_quote(&app.image_repo())
        );
        if let Err(e) = shell.run(&images, None).await {
            warn!("Failed to remove images of app {}: {}", app_id, e);
        }

        let work_dir = self.work_dir(&app);
        shell
            .run(
                &format!(
                    "rm -rf {} {}",
                    shell_quote(&work_dir),
                    shell_quote(&self.env_file(&app))
                ),
                None,
            )
            .await?;

        self.apps.delete(app_id).await?;
        info!("Deleted app {}", app_id);
        Ok(())
    }

    /// Mark apps left `deploying` by a previous run as `error`
    pub async fn recover_stuck(&self) -> Result<Vec<String>, OrchestratorError> {
        let mut recovered = Vec::new();
        for app in self.apps.list().await? {
            if app.status != AppStatus::Deploying {
                continue;
            }
            self.apps
                .update(&app.id, |a| {
                    a.status = AppFsm::new(a.status).process(AppEvent::Interrupted)?;
                    a.previous_instance_id = a.current_instance_id.take().or(a.previous_instance_id.take());
                    Ok(())
                })
                .await?;
            warn!("App {} was left deploying; marked as error", app.id);
            recovered.push(app.id);
        }
        Ok(recovered)
    }
}
