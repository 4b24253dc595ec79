//! Chart registry client
//!
//! Uploads packaged charts with `PUT {base}/charts/{name}/{version}`.

use async_trait::async_trait;
use chrono::Utc;
use keel_core::collab::{ChartBundle, ChartRegistry, CollaboratorError, PushIdentity};
use reqwest::Client;
use serde::Deserialize;

use crate::{ClientError, Endpoint};

#[derive(Debug, Clone)]
pub struct HttpChartRegistry {
    endpoint: Endpoint,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushResponse {
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    commit_time: Option<chrono::DateTime<Utc>>,
}

impl HttpChartRegistry {
    /// Create a registry client; an empty token sends no credentials
    pub fn new(base_url: impl Into<String>, token: &str) -> Self {
        Self::with_client(base_url, token, Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, token: &str, client: Client) -> Self {
        let auth = (!token.is_empty()).then(|| format!("Bearer {}", token));
        Self {
            endpoint: Endpoint::new(base_url, auth, client),
        }
    }

    pub fn base_url(&self) -> &str {
        self.endpoint.base_url()
    }
}

#[async_trait]
impl ChartRegistry for HttpChartRegistry {
    async fn push(&self, bundle: &ChartBundle) -> Result<PushIdentity, CollaboratorError> {
        let path = format!("/charts/{}/{}", bundle.name, bundle.version);
        let response = self
            .endpoint
            .put(&path)
            .header(reqwest::header::CONTENT_TYPE, "application/x-tar")
            .body(bundle.bytes.clone())
            .send()
            .await
            .map_err(ClientError::from)?;
        let pushed: PushResponse = self.endpoint.handle_response(response).await?;

        // The registry may echo a digest of its own; it must match what we sent
        if let Some(digest) = &pushed.digest {
            if digest != &bundle.digest {
                return Err(CollaboratorError::Rejected {
                    status: 422,
                    message: format!(
                        "registry stored {} as {}, expected {}",
                        path, digest, bundle.digest
                    ),
                });
            }
        }

        tracing::debug!("Pushed chart {}:{}", bundle.name, bundle.version);
        Ok(PushIdentity {
            digest: bundle.digest.clone(),
            commit_time: pushed.commit_time.or_else(|| Some(Utc::now())),
        })
    }
}
