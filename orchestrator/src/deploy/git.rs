//! Source checkout commands
//!
//! Commands are built as text and run through a [`Shell`], so the same code
//! serves local and remote working trees.

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::events::LogStream;
use crate::remote::Shell;
use crate::utils::shell_quote;

/// Reject refs and URLs that git would read as options or that carry shell syntax
pub fn validate_ref(kind: &str, value: &str) -> Result<(), OrchestratorError> {
    let ok = !value.is_empty()
        && !value.starts_with('-')
        && !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c));
    if ok {
        Ok(())
    } else {
        Err(OrchestratorError::ValidationError(format!(
            "Invalid {}: '{}'",
            kind, value
        )))
    }
}

pub fn validate_commit(commit: &str) -> Result<(), OrchestratorError> {
    if (7..=40).contains(&commit.len()) && commit.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(OrchestratorError::ValidationError(format!(
            "Invalid commit: '{}'",
            commit
        )))
    }
}

pub fn validate_repo_url(url: &str) -> Result<(), OrchestratorError> {
    let scheme_ok = url.starts_with("https://") || url.starts_with("http://") || url.starts_with("git@") || url.starts_with("ssh://");
    let chars_ok = url
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@~".contains(c));
    if scheme_ok && chars_ok {
        Ok(())
    } else {
        Err(OrchestratorError::ValidationError(format!(
            "Invalid repository URL: '{}'",
            url
        )))
    }
}

/// Fetch URL with the token embedded as basic-auth user. Only https URLs take
/// a token; others are returned as given.
pub fn authenticated_url(repo_url: &str, token: Option<&SecretString>) -> String {
    match (token, repo_url.strip_prefix("https://")) {
        (Some(token), Some(rest)) => {
            format!("https://x-access-token:{}@{}", token.expose_secret(), rest)
        }
        _ => repo_url.to_string(),
    }
}

/// What to check out
#[derive(Debug, Clone)]
pub struct Checkout<'a> {
    pub work_dir: &'a str,
    pub repo_url: &'a str,
    pub branch: &'a str,

    /// Pinned commit; checked out detached
    pub commit: Option<&'a str>,
}

/// Clone or update the working tree. The stored remote URL is always reset to
/// the token-free URL afterwards, also when the sync fails.
pub fn sync_command(checkout: &Checkout<'_>, fetch_url: &str) -> String {
    let dir = shell_quote(checkout.work_dir);
    let branch = shell_quote(checkout.branch);
    let fetch = shell_quote(fetch_url);
    let clean = shell_quote(checkout.repo_url);

    let pin = checkout
        .commit
        .map(|c| format!(" && git -C {} checkout --detach {}", dir, shell_quote(c)))
        .unwrap_or_default();

    format!(
        "export GIT_TERMINAL_PROMPT=0; \
         if [ -d {dir}/.git ]; then \
           git -C {dir} remote set-url origin {fetch} && \
           git -C {dir} fetch --prune origin && \
           git -C {dir} checkout {branch} && \
           git -C {dir} pull --ff-only origin {branch}{pin}; \
         else \
           mkdir -p \"$(dirname {dir})\" && \
           git clone --branch {branch} {fetch} {dir}{pin}; \
         fi; \
         rc=$?; \
         [ -d {dir}/.git ] && git -C {dir} remote set-url origin {clean}; \
         exit $rc",
        dir = dir,
        fetch = fetch,
        branch = branch,
        clean = clean,
        pin = pin
    )
}

/// Sync the working tree and return the checked-out commit
pub async fn sync_source(
    shell: &dyn Shell,
    checkout: &Checkout<'_>,
    token: Option<&SecretString>,
    log: Option<&LogStream>,
) -> Result<String, OrchestratorError> {
    validate_repo_url(checkout.repo_url)?;
    validate_ref("branch", checkout.branch)?;
    if let Some(commit) = checkout.commit {
        validate_commit(commit)?;
    }

    info!(
        "Syncing {} ({}) into {} on {}",
        checkout.repo_url,
        checkout.branch,
        checkout.work_dir,
        shell.describe()
    );
    let fetch_url = authenticated_url(checkout.repo_url, token);
    shell.run(&sync_command(checkout, &fetch_url), log).await?;

    let commit = resolve_head(shell, checkout.work_dir).await?;
    debug!("Checked out {}", commit);
    Ok(commit)
}

pub async fn resolve_head(shell: &dyn Shell, work_dir: &str) -> Result<String, OrchestratorError> {
    let output = shell
        .run(&format!("git -C {} rev-parse HEAD", shell_quote(work_dir)), None)
        .await?;
    Ok(output.trim().to_string())
}

/// Fetch `branch` without touching the working tree and return its head
pub async fn fetch_upstream_head(
    shell: &dyn Shell,
    work_dir: &str,
    repo_url: &str,
    branch: &str,
    token: Option<&SecretString>,
) -> Result<String, OrchestratorError> {
    validate_ref("branch", branch)?;
    let dir = shell_quote(work_dir);
    let command = format!(
        "export GIT_TERMINAL_PROMPT=0; git -C {dir} fetch --quiet {url} {branch} && git -C {dir} rev-parse FETCH_HEAD",
        dir = dir,
        url = shell_quote(&authenticated_url(repo_url, token)),
        branch = shell_quote(branch)
    );
    Ok(shell.run(&command, None).await?.trim().to_string())
}
