//! Commit to branch resolution through the GitHub REST API.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::GithubConfig;
use crate::error::{CancelError, Result};

/// Branch name given to commits that no longer resolve (e.g. the branch was deleted).
/// Never matches the current branch.
pub const DELETED_BRANCH: &str = "deleted";

#[async_trait::async_trait]
pub trait BranchResolver: Send + Sync {
    /// Branch the commit belongs to, or `None` when it cannot be resolved.
    async fn branch_for_commit(&self, sha: &str) -> Result<Option<String>>;
}

#[derive(Deserialize)]
struct AssociatedPull {
    head: PullHead,
}

#[derive(Deserialize)]
struct PullHead {
    #[serde(rename = "ref")]
    git_ref: String,
}

/// Resolves a commit to the head branch of the pull request that contains it
/// (`GET /repos/{owner}/{repo}/commits/{sha}/pulls`).
pub struct GitHubBranchResolver {
    client: Client,
    api_url: String,
    repository: String,
}

impl GitHubBranchResolver {
    pub fn new(cfg: &GithubConfig, timeout: Duration) -> Result<Self> {
        let repository = cfg
            .repository
            .clone()
            .ok_or_else(|| CancelError::Config("GitHub repository is required".into()))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("dbt-cancel-stale/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(token) = cfg.token.as_deref().filter(|t| !t.is_empty()) {
            let mut auth = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                CancelError::Config("GitHub token contains invalid characters".into())
            })?;
            auth.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| CancelError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            repository,
        })
    }
}

#[async_trait::async_trait]
impl BranchResolver for GitHubBranchResolver {
    async fn branch_for_commit(&self, sha: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/repos/{}/commits/{}/pulls",
            self.api_url, self.repository, sha
        );
        let resp = self.client.get(&url).send().await?;

        // Unknown commits come back as 404 / 422 once their branch is gone.
        if matches!(
            resp.status(),
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            tracing::debug!(%sha, status = %resp.status(), "Commit not found on GitHub");
            return Ok(None);
        }

        let pulls: Vec<AssociatedPull> = resp.error_for_status()?.json().await?;
        Ok(pulls.into_iter().next().map(|p| p.head.git_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_repository() {
        let err = GitHubBranchResolver::new(&GithubConfig::default(), Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, CancelError::Config(_)));
    }

    #[test]
    fn test_api_url_trailing_slash_trimmed() {
        let cfg = GithubConfig {
            repository: Some("acme/analytics".into()),
            token: Some("ghp_x".into()),
            api_url: "https://ghe.example.com/api/v3/".into(),
        };
        let resolver = GitHubBranchResolver::new(&cfg, Duration::from_secs(1)).unwrap();
        assert_eq!(resolver.api_url, "https://ghe.example.com/api/v3");
        assert_eq!(resolver.repository, "acme/analytics");
    }

    #[test]
    fn test_pull_head_ref_parses() {
        let body = r#"[{"number": 9, "head": {"ref": "feature/x", "sha": "abc"}}]"#;
        let pulls: Vec<AssociatedPull> = serde_json::from_str(body).unwrap();
        assert_eq!(pulls[0].head.git_ref, "feature/x");
    }
}
