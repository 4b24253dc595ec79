//! Webhook notifier
//!
//! Posts each CD event as JSON to a single URL.

use async_trait::async_trait;
use keel_core::collab::{CollaboratorError, Notifier};
use keel_core::dto::event::CdEvent;
use reqwest::Client;

use crate::{ClientError, Endpoint};

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    endpoint: Endpoint,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, Client::new())
    }

    pub fn with_client(url: impl Into<String>, client: Client) -> Self {
        Self {
            endpoint: Endpoint::new(url, None, client),
        }
    }

    pub fn url(&self) -> &str {
        self.endpoint.base_url()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn write_cd_event(&self, event: &CdEvent) -> Result<(), CollaboratorError> {
        let response = self
            .endpoint
            .post("")
            .json(event)
            .send()
            .await
            .map_err(ClientError::from)?;
        Ok(self.endpoint.handle_empty_response(response).await?)
    }
}
