//! GitOps client for Gitea-compatible servers
//!
//! Values files are written through the contents API. Updates carry the blob
//! `sha` they replace, so a concurrent push surfaces as 409/422 and maps to
//! `CollaboratorError::Conflict`.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use keel_core::collab::{CollaboratorError, CommitAuthor, GitCommit, GitOpsClient, ValuesCommit};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::Endpoint;
use crate::error::Result;

/// GitOps provider backed by a Gitea organization
#[derive(Debug, Clone)]
pub struct GiteaGitOpsClient {
    endpoint: Endpoint,
    org: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    clone_url: String,
}

#[derive(Debug, Serialize)]
struct CreateRepository<'a> {
    name: &'a str,
    auto_init: bool,
    private: bool,
    default_branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
}

#[derive(Debug, Serialize)]
struct FileOptions<'a> {
    content: String,
    message: &'a str,
    branch: &'a str,
    author: &'a CommitAuthor,
    committer: &'a CommitAuthor,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    commit: FileCommit,
}

#[derive(Debug, Deserialize)]
struct FileCommit {
    sha: String,
    #[serde(default)]
    committer: Option<CommitUser>,
}

#[derive(Debug, Deserialize)]
struct CommitUser {
    #[serde(default)]
    date: Option<String>,
}

const BRANCH: &str = "master";

impl GiteaGitOpsClient {
    /// Create a client for repositories owned by `org`, authenticated with an
    /// access token
    pub fn new(base_url: impl Into<String>, org: impl Into<String>, token: &str) -> Self {
        Self::with_client(base_url, org, token, Client::new())
    }

    /// Create a client with a custom HTTP client
    pub fn with_client(
        base_url: impl Into<String>,
        org: impl Into<String>,
        token: &str,
        client: Client,
    ) -> Self {
        let auth = (!token.is_empty()).then(|| format!("token {}", token));
        Self {
            endpoint: Endpoint::new(base_url, auth, client),
            org: org.into(),
        }
    }

    /// Get the base URL of the server
    pub fn base_url(&self) -> &str {
        self.endpoint.base_url()
    }

    async fn find_repo(&self, name: &str) -> Result<Option<Repository>> {
        let path = format!("/api/v1/repos/{}/{}", self.org, name);
        let response = self.endpoint.get(&path).send().await?;
        self.endpoint.handle_optional(response).await
    }

    async fn create_repo(&self, name: &str) -> Result<Repository> {
        let path = format!("/api/v1/orgs/{}/repos", self.org);
        let body = CreateRepository {
            name,
            auto_init: true,
            private: true,
            default_branch: BRANCH,
        };
        let response = self.endpoint.post(&path).json(&body).send().await?;
        self.endpoint.handle_response(response).await
    }

    /// Current blob sha of a file, `None` when the file does not exist yet
    async fn file_sha(&self, repo: &str, file_path: &str) -> Result<Option<String>> {
        let path = self.contents_path(repo, file_path);
        let response = self
            .endpoint
            .get(&path)
            .query(&[("ref", BRANCH)])
            .send()
            .await?;
        let contents: Option<ContentsResponse> = self.endpoint.handle_optional(response).await?;
        Ok(contents.map(|c| c.sha))
    }

    fn contents_path(&self, repo: &str, file_path: &str) -> String {
        format!(
            "/api/v1/repos/{}/{}/contents/{}",
            self.org,
            repo,
            file_path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl GitOpsClient for GiteaGitOpsClient {
    async fn ensure_repo(&self, name: &str) -> std::result::Result<String, CollaboratorError> {
        if let Some(repo) = self.find_repo(name).await? {
            return Ok(repo.clone_url);
        }

        tracing::info!("Creating GitOps repository {}/{}", self.org, name);
        let repo = self.create_repo(name).await?;
        Ok(repo.clone_url)
    }

    async fn commit_values(
        &self,
        commit: &ValuesCommit,
    ) -> std::result::Result<GitCommit, CollaboratorError> {
        let sha = self.file_sha(&commit.repo_name, &commit.file_path).await?;
        let path = self.contents_path(&commit.repo_name, &commit.file_path);

        let body = FileOptions {
            content: base64::engine::general_purpose::STANDARD.encode(&commit.content),
            message: &commit.message,
            branch: BRANCH,
            author: &commit.author,
            committer: &commit.author,
            sha: sha.clone(),
        };
        let request = match sha {
            Some(_) => self.endpoint.put(&path),
            None => self.endpoint.post(&path),
        };

        let response = request.json(&body).send().await.map_err(crate::ClientError::from)?;
        let file: FileResponse = self.endpoint.handle_response(response).await?;

        let time = file
            .commit
            .committer
            .and_then(|c| c.date)
            .and_then(|d| DateTime::parse_from_rfc3339(&d).ok())
            .map(|d| d.with_timezone(&Utc));

        tracing::debug!(
            "Committed {} to {}: {}",
            commit.file_path,
            commit.repo_name,
            file.commit.sha
        );
        Ok(GitCommit {
            hash: file.commit.sha,
            time,
        })
    }
}
