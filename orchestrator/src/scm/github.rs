//! GitHub REST implementation of [`SourceControl`]

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::errors::OrchestratorError;
use crate::http::HttpClient;
use crate::scm::{parse_repo_slug, SourceControl};

#[derive(Debug, Deserialize)]
struct RepoResponse {
    default_branch: String,
    private: bool,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    name: String,
}

pub struct GitHubSourceControl {
    http: HttpClient,
    token: Option<SecretString>,
}

impl GitHubSourceControl {
    pub fn new(api_base_url: &str, token: Option<SecretString>) -> Result<Self, OrchestratorError> {
        Ok(Self {
            http: HttpClient::new(api_base_url)?,
            token,
        })
    }

    async fn repo(&self, repo_url: &str) -> Result<RepoResponse, OrchestratorError> {
        let (owner, repo) = parse_repo_slug(repo_url)?;
        self.http
            .get(&format!("/repos/{}/{}", owner, repo), self.token.as_ref())
            .await
    }
}

#[async_trait]
impl SourceControl for GitHubSourceControl {
    async fn list_branches(&self, repo_url: &str) -> Result<Vec<String>, OrchestratorError> {
        let (owner, repo) = parse_repo_slug(repo_url)?;
        let branches: Vec<BranchResponse> = self
            .http
            .get(
                &format!("/repos/{}/{}/branches?per_page=100", owner, repo),
                self.token.as_ref(),
            )
            .await?;
        Ok(branches.into_iter().map(|b| b.name).collect())
    }

    async fn default_branch(&self, repo_url: &str) -> Result<String, OrchestratorError> {
        Ok(self.repo(repo_url).await?.default_branch)
    }

    async fn is_private(&self, repo_url: &str) -> Result<bool, OrchestratorError> {
        Ok(self.repo(repo_url).await?.private)
    }

    async fn access_token(&self) -> Result<Option<SecretString>, OrchestratorError> {
        Ok(self
            .token
            .as_ref()
            .map(|t| SecretString::from(t.expose_secret().to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_response_shape() {
        let repo: RepoResponse = serde_json::from_str(
            r#"{"id": 1, "name": "blog", "default_branch": "main", "private": true}"#,
        )
        .unwrap();
        assert_eq!(repo.default_branch, "main");
        assert!(repo.private);
    }

    #[tokio::test]
    async fn test_access_token_passthrough() {
        let scm = GitHubSourceControl::new(
            "https://api.github.com",
            Some(SecretString::from("ghp_x".to_string())),
        )
        .unwrap();
        let token = scm.access_token().await.unwrap().unwrap();
        assert_eq!(token.expose_secret(), "ghp_x");
    }
}
