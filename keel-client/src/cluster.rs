//! Kubernetes resource reads
//!
//! Each cluster id maps to an API server URL and a bearer token. Reads go
//! straight to the REST API; a 404 means the resource does not exist.

use std::collections::HashMap;

use async_trait::async_trait;
use keel_core::collab::{ClusterClient, CollaboratorError, ResourceKey};
use reqwest::Client;
use serde_json::Value;

use crate::{ClientError, Endpoint};

#[derive(Debug, Clone, Default)]
pub struct KubeClusterClient {
    clusters: HashMap<i64, Endpoint>,
    client: Client,
}

impl KubeClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client sharing a custom HTTP client (e.g. one that trusts
    /// the cluster CA)
    pub fn with_client(client: Client) -> Self {
        Self {
            clusters: HashMap::new(),
            client,
        }
    }

    /// Registers the API server of a cluster
    pub fn add_cluster(mut self, cluster_id: i64, server_url: impl Into<String>, token: &str) -> Self {
        let auth = (!token.is_empty()).then(|| format!("Bearer {}", token));
        self.clusters.insert(
            cluster_id,
            Endpoint::new(server_url, auth, self.client.clone()),
        );
        self
    }

    pub fn has_cluster(&self, cluster_id: i64) -> bool {
        self.clusters.contains_key(&cluster_id)
    }
}

/// REST path of a namespaced resource
pub(crate) fn resource_path(key: &ResourceKey) -> String {
    let prefix = if key.group.is_empty() {
        format!("/api/{}", key.version)
    } else {
        format!("/apis/{}/{}", key.group, key.version)
    };
    format!(
        "{}/namespaces/{}/{}/{}",
        prefix,
        key.namespace,
        plural(&key.kind),
        key.name
    )
}

/// Resource name of a kind, e.g. `HorizontalPodAutoscaler` -> `horizontalpodautoscalers`
fn plural(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_resource(&self, key: &ResourceKey) -> Result<Option<Value>, CollaboratorError> {
        let endpoint = self.clusters.get(&key.cluster_id).ok_or_else(|| {
            CollaboratorError::NotFound(format!("cluster {} is not configured", key.cluster_id))
        })?;

        let path = resource_path(key);
        tracing::debug!("Reading {} from cluster {}", path, key.cluster_id);

        let response = endpoint.get(&path).send().await.map_err(ClientError::from)?;
        Ok(endpoint.handle_optional(response).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hpa_key(cluster_id: i64) -> ResourceKey {
        ResourceKey {
            cluster_id,
            group: "autoscaling".to_string(),
            kind: "HorizontalPodAutoscaler".to_string(),
            version: "v2".to_string(),
            namespace: "payments".to_string(),
            name: "payments-prod-hpa".to_string(),
        }
    }

    #[test]
    fn test_resource_paths() {
        assert_eq!(
            resource_path(&hpa_key(1)),
            "/apis/autoscaling/v2/namespaces/payments/horizontalpodautoscalers/payments-prod-hpa"
        );
        let key = ResourceKey {
            group: String::new(),
            kind: "ConfigMap".to_string(),
            version: "v1".to_string(),
            name: "settings".to_string(),
            ..hpa_key(1)
        };
        assert_eq!(
            resource_path(&key),
            "/api/v1/namespaces/payments/configmaps/settings"
        );
        assert_eq!(plural("Ingress"), "ingresses");
        assert_eq!(plural("NetworkPolicy"), "networkpolicies");
    }

    #[tokio::test]
    async fn test_reads_live_resource() {
        let mut server = mockito::Server::new_async().await;
        let read = server
            .mock(
                "GET",
                "/apis/autoscaling/v2/namespaces/payments/horizontalpodautoscalers/payments-prod-hpa",
            )
            .match_header("authorization", "Bearer sa-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"status": {"currentReplicas": 4}}).to_string())
            .create_async()
            .await;

        let cluster = KubeClusterClient::new().add_cluster(1, server.url(), "sa-token");
        let hpa = cluster.get_resource(&hpa_key(1)).await.unwrap().unwrap();

        assert_eq!(hpa["status"]["currentReplicas"], json!(4));
        read.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_resource_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock(
                "GET",
                "/apis/autoscaling/v2/namespaces/payments/horizontalpodautoscalers/payments-prod-hpa",
            )
            .with_status(404)
            .with_body(json!({"kind": "Status", "reason": "NotFound"}).to_string())
            .create_async()
            .await;

        let cluster = KubeClusterClient::new().add_cluster(1, server.url(), "");
        assert!(cluster.get_resource(&hpa_key(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_cluster() {
        let cluster = KubeClusterClient::new();
        let err = cluster.get_resource(&hpa_key(9)).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::NotFound(_)));
    }
}
