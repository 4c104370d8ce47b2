//! Source control provider seam

pub mod github;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::OrchestratorError;

pub use github::GitHubSourceControl;

/// Repository metadata lookups against the hosting provider
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn list_branches(&self, repo_url: &str) -> Result<Vec<String>, OrchestratorError>;

    async fn default_branch(&self, repo_url: &str) -> Result<String, OrchestratorError>;

    async fn is_private(&self, repo_url: &str) -> Result<bool, OrchestratorError>;

    /// Token embedded into fetch URLs of private repositories
    async fn access_token(&self) -> Result<Option<SecretString>, OrchestratorError>;
}

/// `owner/repo` from an https or scp-style GitHub URL
pub fn parse_repo_slug(repo_url: &str) -> Result<(String, String), OrchestratorError> {
    let trimmed = repo_url.trim().trim_end_matches('/').trim_end_matches(".git");
    let path: Option<String> = match trimmed.strip_prefix("git@") {
        Some(rest) => rest.split_once(':').map(|(_, path)| path.to_string()),
        None => url::Url::parse(trimmed)
            .ok()
            .map(|u| u.path().trim_matches('/').to_string()),
    };

    let invalid =
        || OrchestratorError::ValidationError(format!("Unrecognized repository URL: {}", repo_url));
    let path = path.ok_or_else(invalid)?;
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) => Ok((owner.to_string(), repo.to_string())),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo_slug() {
        assert_eq!(
            parse_repo_slug("https://github.com/acme/blog.git").unwrap(),
            ("acme".to_string(), "blog".to_string())
        );
        assert_eq!(
            parse_repo_slug("git@github.com:acme/shop.git").unwrap(),
            ("acme".to_string(), "shop".to_string())
        );
        assert!(parse_repo_slug("https://github.com/acme").is_err());
        assert!(parse_repo_slug("not a url").is_err());
    }
}
