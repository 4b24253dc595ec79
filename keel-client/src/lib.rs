//! Keel HTTP Clients
//!
//! HTTP implementations of the collaborator interfaces declared in
//! `keel_core::collab`:
//!
//! - [`GiteaGitOpsClient`]: GitOps repositories on a Gitea-compatible server
//! - [`HttpChartRegistry`]: chart bundle uploads
//! - [`KubeClusterClient`]: live resource reads from Kubernetes API servers
//! - [`WebhookNotifier`]: CD events posted as JSON
//!
//! # Example
//!
//! ```no_run
//! use keel_client::GiteaGitOpsClient;
//! use keel_core::collab::GitOpsClient;
//!
//! # async fn example() -> Result<(), keel_core::collab::CollaboratorError> {
//! let gitops = GiteaGitOpsClient::new("http://gitea:3000", "keel", "token");
//! let url = gitops.ensure_repo("payments").await?;
//! println!("Values repository: {}", url);
//! # Ok(())
//! # }
//! ```

mod cluster;
pub mod error;
mod gitops;
mod notifier;
mod registry;

// Re-export commonly used types
pub use cluster::KubeClusterClient;
pub use error::{ClientError, Result};
pub use gitops::GiteaGitOpsClient;
pub use notifier::WebhookNotifier;
pub use registry::HttpChartRegistry;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

/// Base URL, credentials and HTTP client shared by every collaborator client
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    base_url: String,
    auth: Option<String>,
    client: Client,
}

impl Endpoint {
    pub(crate) fn new(base_url: impl Into<String>, auth: Option<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            client,
        }
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Adds the `Authorization` header when credentials are configured
    pub(crate) fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(value) => request.header(reqwest::header::AUTHORIZATION, value),
            None => request,
        }
    }

    pub(crate) fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
    }

    pub(crate) fn put(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.put(self.url(path)))
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Checks the status code and deserializes the JSON body
    pub(crate) async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Like [`Endpoint::handle_response`], mapping 404 to `Ok(None)`
    pub(crate) async fn handle_optional<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<T>> {
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.handle_response(response).await.map(Some)
    }

    /// Checks the status code of a response whose body is ignored
    pub(crate) async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}
