//! Config Composer
//!
//! Builds the final values document for a release by merging, in order:
//! the environment template, the strategy patch, the database migration
//! stanza, the rendered image descriptor, the caller override, config maps
//! and secrets, application labels; then reconciling autoscaling and
//! injecting the image pull secret.
//!
//! Composition is split in two: [`Composer::prepare`] performs every lookup
//! and [`PreparedComposition::render`] is a pure function of the prepared
//! inputs and the release counter.

pub mod autoscaling;
pub mod config_maps;
pub mod descriptor;
pub mod merge;
pub mod path;

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::collab::{ClusterClient, ResourceKey};
use keel_core::domain::catalog::{
    AppLabel, Application, Artifact, DbMigrationConfig, DeploymentStrategy, Environment, Pipeline,
};
use keel_core::domain::chart::{AppChart, ChartRef, EnvOverride};
use keel_core::domain::config::ConfigItem;
use keel_core::domain::release::DeploymentType;
use serde_json::{Map, Value, json};

use self::config_maps::SecretTransform;
use self::descriptor::ReleaseAttributes;
use crate::error::{ComposerError, EngineError};
use crate::repository::Stores;
use crate::service::variables::{ResolutionScope, SystemMetadata, VariableResolver, VariableSet};

const APP_LABELS: &str = "appLabels";
const IMAGE_PULL_SECRETS: &str = "imagePullSecrets";

/// Configuration pinned to an earlier runner's deployment history
#[derive(Debug, Clone)]
pub struct PinnedConfig {
    pub template: Value,
    pub strategy_config: Option<Value>,
    pub config_maps: Vec<ConfigItem>,
}

/// Everything the trigger already knows about the release being composed
#[derive(Debug, Clone)]
pub struct ComposeSource {
    pub app: Application,
    pub env: Environment,
    pub pipeline: Pipeline,
    pub artifact: Artifact,
    pub chart_ref: ChartRef,
    pub app_chart: AppChart,
    pub env_override: EnvOverride,
    pub strategy: DeploymentStrategy,
    pub deployment_type: DeploymentType,
    pub additional_override: Option<Value>,

    /// Set when re-deploying the configuration of a specific trigger
    pub pinned: Option<PinnedConfig>,
}

impl ComposeSource {
    /// Namespace the release is deployed into
    pub fn namespace(&self) -> &str {
        if self.env_override.namespace.is_empty() {
            &self.env.namespace
        } else {
            &self.env_override.namespace
        }
    }

    /// Step-one document: the override values or the chart base defaults
    fn template(&self) -> &Value {
        match &self.pinned {
            Some(pinned) => &pinned.template,
            None if self.env_override.is_override => &self.env_override.values,
            None => &self.app_chart.values,
        }
    }
}

/// Output of a composition
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    /// Final values document
    pub values: Value,

    /// Resolved step-one document, kept in the deployment history
    pub template: Value,

    pub strategy_config: Option<Value>,

    /// Variables used, sensitive values masked
    pub variable_snapshot: BTreeMap<String, String>,

    pub config_maps: Vec<ConfigItem>,

    /// Secrets with every value masked
    pub secrets: Vec<ConfigItem>,
}

/// Inputs of a composition after all lookups
#[derive(Debug, Clone)]
pub struct PreparedComposition {
    source: ComposeSource,
    variables: VariableSet,
    strategy_config: Option<Value>,
    db_migration: Option<DbMigrationConfig>,
    config_maps: Vec<ConfigItem>,
    /// Decoded secret items
    secrets: Vec<ConfigItem>,
    labels: Vec<AppLabel>,
    pull_secret: Option<String>,
    live_replicas: Option<f64>,
    secret_transform: SecretTransform,
}

/// Loads composition inputs
#[derive(Clone)]
pub struct Composer {
    stores: Stores,
    cluster: Arc<dyn ClusterClient>,
    resolver: VariableResolver,
}

impl Composer {
    pub fn new(stores: Stores, cluster: Arc<dyn ClusterClient>, scoped_variables: bool) -> Self {
        let resolver = VariableResolver::new(stores.variables.clone(), scoped_variables);
        Self {
            stores,
            cluster,
            resolver,
        }
    }

    /// Performs every lookup a composition needs
    pub async fn prepare(&self, source: ComposeSource) -> Result<PreparedComposition, EngineError> {
        let catalog = &self.stores.catalog;
        let pipeline_id = source.pipeline.id;

        let strategy_config = match &source.pinned {
            Some(pinned) => pinned.strategy_config.clone(),
            None => catalog
                .find_strategy(pipeline_id, source.strategy)
                .await?
                .map(|s| s.config),
        };

        let db_migration = catalog
            .find_db_migration_config(pipeline_id)
            .await?
            .filter(|c| c.active);

        let app_level = self
            .stores
            .config_payloads
            .find_app_level(source.app.id)
            .await?
            .unwrap_or_default();
        let env_level = self
            .stores
            .config_payloads
            .find_env_level(source.app.id, source.env.id)
            .await?
            .unwrap_or_default();

        let config_maps = match &source.pinned {
            Some(pinned) => pinned.config_maps.clone(),
            None => config_maps::overlay(&app_level.config_maps, &env_level.config_maps),
        };
        let secrets = config_maps::overlay(&app_level.secrets, &env_level.secrets)
            .iter()
            .map(config_maps::decode_secret)
            .collect::<Result<Vec<_>, _>>()?;

        let labels = catalog.find_app_labels(source.app.id).await?;

        let registry_id = source
            .artifact
            .registry_id
            .as_deref()
            .or(source.pipeline.registry_id.as_deref());
        let pull_secret = match registry_id {
            Some(registry_id) => {
                catalog
                    .find_pull_secret(registry_id, source.env.cluster_id)
                    .await?
            }
            None => None,
        };

        let mut texts = vec![source.template().to_string()];
        texts.extend(config_maps.iter().map(|m| m.data.to_string()));
        texts.extend(secrets.iter().map(|s| s.data.to_string()));
        let scope = resolution_scope(&source);
        let variables = self.resolver.prepare(&scope, &texts).await?;

        let secret_transform = SecretTransform::for_chart(&source.chart_ref);
        let mut prepared = PreparedComposition {
            source,
            variables,
            strategy_config,
            db_migration,
            config_maps,
            secrets,
            labels,
            pull_secret,
            live_replicas: None,
            secret_transform,
        };

        let provisional = prepared.merge_layers(0)?;
        if autoscaling::needs_live_replicas(&provisional.values, prepared.source.deployment_type) {
            prepared.live_replicas = self.live_replicas(&prepared.source).await;
        }

        Ok(prepared)
    }

    /// Current replicas of the live HPA; any read problem keeps the values
    /// unchanged
    async fn live_replicas(&self, source: &ComposeSource) -> Option<f64> {
        let key = ResourceKey {
            cluster_id: source.env.cluster_id,
            group: "autoscaling".to_string(),
            kind: "HorizontalPodAutoscaler".to_string(),
            version: "v2".to_string(),
            namespace: source.namespace().to_string(),
            name: format!("{}-{}-hpa", source.app.name, source.env.name),
        };

        match self.cluster.get_resource(&key).await {
            Ok(Some(manifest)) => {
                let replicas = autoscaling::current_replicas(&manifest);
                if replicas.is_none() {
                    tracing::warn!("HPA {} has no readable currentReplicas", key.name);
                }
                replicas
            }
            Ok(None) => {
                tracing::debug!("HPA {} not found, keeping replicaCount", key.name);
                None
            }
            Err(e) => {
                tracing::warn!("Failed to read HPA {}: {}", key.name, e);
                None
            }
        }
    }
}

impl PreparedComposition {
    pub fn source(&self) -> &ComposeSource {
        &self.source
    }

    /// Overrides the chart-derived secret transform
    pub fn with_secret_transform(mut self, transform: SecretTransform) -> Self {
        self.secret_transform = transform;
        self
    }

    /// Composes the values document for release `counter`
    pub fn render(&self, counter: i64) -> Result<Composition, ComposerError> {
        let mut composition = self.merge_layers(counter)?;

        autoscaling::reconcile(
            &mut composition.values,
            self.source.deployment_type,
            self.live_replicas,
        )?;

        if let Some(secret) = &self.pull_secret {
            inject_pull_secret(&mut composition.values, secret)?;
        }

        Ok(composition)
    }

    /// Layers one through seven
    fn merge_layers(&self, counter: i64) -> Result<Composition, ComposerError> {
        let source = &self.source;
        let mut snapshot = BTreeMap::new();

        let template = self.variables.resolve_value(source.template(), false)?;
        snapshot.extend(template.snapshot);
        let template = template.value;
        let mut values = template.clone();
        if !values.is_object() {
            return Err(ComposerError::merge("$", "environment template is not a JSON object"));
        }

        if let Some(strategy) = &self.strategy_config {
            merge::apply(&mut values, strategy, "strategy patch")?;
        }

        if let Some(config) = &self.db_migration {
            let stanza = db_migration_stanza(config, &source.artifact)?;
            merge::apply(&mut values, &stanza, "database migration stanza")?;
        }

        let descriptor = descriptor::render(
            &source.chart_ref.image_descriptor_template,
            &self.release_attributes(counter),
        )?;
        merge::apply(&mut values, &descriptor, "image descriptor")?;

        if let Some(extra) = &source.additional_override {
            merge::apply(&mut values, extra, "additional override")?;
        }

        let mut config_maps = Vec::with_capacity(self.config_maps.len());
        for item in &self.config_maps {
            let resolved = self.variables.resolve_value(&item.data, false)?;
            snapshot.extend(resolved.snapshot);
            config_maps.push(ConfigItem {
                data: resolved.value,
                ..item.clone()
            });
        }

        let mut secrets = Vec::with_capacity(self.secrets.len());
        let mut masked = Vec::with_capacity(self.secrets.len());
        for item in &self.secrets {
            let resolved = self.variables.resolve_secret(&item.data, false)?;
            snapshot.extend(resolved.snapshot);
            let plain = ConfigItem {
                data: resolved.value,
                ..item.clone()
            };
            masked.push(config_maps::mask_secret(&plain));
            secrets.push(config_maps::encode_secret(&plain, self.secret_transform)?);
        }

        let layer = config_maps::to_layer(&config_maps, &secrets)?;
        merge::apply(&mut values, &layer, "config maps")?;

        let labels: Map<String, Value> = self
            .labels
            .iter()
            .filter(|l| l.propagate)
            .map(|l| (l.key.clone(), Value::String(l.value.clone())))
            .collect();
        if !labels.is_empty() {
            path::set(&mut values, APP_LABELS, Value::Object(labels))?;
        }

        Ok(Composition {
            values,
            template,
            strategy_config: self.strategy_config.clone(),
            variable_snapshot: snapshot,
            config_maps,
            secrets: masked,
        })
    }

    fn release_attributes(&self, counter: i64) -> ReleaseAttributes {
        let source = &self.source;
        let (name, tag) = descriptor::split_image(&source.artifact.image);
        ReleaseAttributes {
            name,
            tag: descriptor::deploy_tag(
                &tag,
                source.artifact.image_digest.as_deref(),
                source.pipeline.use_digest,
            ),
            pipeline_name: source.pipeline.name.clone(),
            release_version: counter.to_string(),
            deployment_type: source.strategy.as_str().to_string(),
            app: source.app.id.to_string(),
            env: source.env.id.to_string(),
            app_metrics: source.chart_ref.app_metrics_supported,
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn resolution_scope(source: &ComposeSource) -> ResolutionScope {
    let (image, image_tag) = descriptor::split_image(&source.artifact.image);
    ResolutionScope {
        app_id: source.app.id,
        env_id: source.env.id,
        cluster_id: source.env.cluster_id,
        system: SystemMetadata {
            app_name: source.app.name.clone(),
            env_name: source.env.name.clone(),
            namespace: source.namespace().to_string(),
            cluster_name: source.env.cluster_name.clone(),
            image,
            image_tag,
        },
    }
}

fn db_migration_stanza(
    config: &DbMigrationConfig,
    artifact: &Artifact,
) -> Result<Value, ComposerError> {
    let git_hash = artifact.material_info.get(&config.git_repo_url).ok_or_else(|| {
        ComposerError::merge(
            "dbMigrationConfig",
            format!("artifact has no material for {}", config.git_repo_url),
        )
    })?;

    let env_values: Vec<Value> = [
        ("GIT_REPO_URL", config.git_repo_url.as_str()),
        ("GIT_USER", config.git_user.as_str()),
        ("GIT_AUTH_TOKEN", config.git_auth_token.as_str()),
        ("GIT_HASH", git_hash.as_str()),
        ("SCRIPT_LOCATION", config.script_location.as_str()),
        ("DB_TYPE", config.db_type.as_str()),
        ("DB_USER_NAME", config.db_user_name.as_str()),
        ("DB_PASSWORD", config.db_password.as_str()),
        ("DB_HOST", config.db_host.as_str()),
        ("DB_PORT", config.db_port.as_str()),
        ("DB_NAME", config.db_name.as_str()),
    ]
    .into_iter()
    .map(|(key, value)| json!({"key": key, "value": value}))
    .collect();

    Ok(json!({
        "dbMigrationConfig": {
            "enabled": true,
            "envValues": env_values,
        }
    }))
}

fn inject_pull_secret(values: &mut Value, secret: &str) -> Result<(), ComposerError> {
    let mut names = match path::get(values, IMAGE_PULL_SECRETS) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(ComposerError::merge(IMAGE_PULL_SECRETS, "expected an array"));
        }
    };

    let present = names.iter().any(|item| match item {
        Value::String(name) => name == secret,
        Value::Object(obj) => obj.get("name").and_then(Value::as_str) == Some(secret),
        _ => false,
    });
    if !present {
        names.push(Value::String(secret.to_string()));
    }
    path::set(values, IMAGE_PULL_SECRETS, Value::Array(names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryStore;
    use crate::testing::{self, FakeCluster};
    use base64::Engine as _;
    use keel_core::domain::config::{ConfigItemType, ConfigPayload};
    use keel_core::domain::variable::{ScopedVariable, VariableScope};

    fn secret_item(name: &str, key: &str, plain: &str) -> ConfigItem {
        ConfigItem {
            name: name.to_string(),
            item_type: ConfigItemType::Environment,
            external: false,
            mount_path: None,
            sub_path: None,
            data: json!({ key: base64::engine::general_purpose::STANDARD.encode(plain) }),
        }
    }

    async fn prepare(
        store: MemoryStore,
        cluster: FakeCluster,
        deployment_type: DeploymentType,
    ) -> PreparedComposition {
        let stores = Stores::in_memory(store.clone());
        let composer = Composer::new(stores, Arc::new(cluster), true);
        let mut source = testing::compose_source(&store).await;
        source.deployment_type = deployment_type;
        composer.prepare(source).await.unwrap()
    }

    #[tokio::test]
    async fn test_render_layers_in_order() {
        let store = testing::seeded_store().await;
        let prepared = prepare(store, FakeCluster::default(), DeploymentType::Deploy).await;

        let composition = prepared.render(7).unwrap();
        let values = &composition.values;
        assert_eq!(values["replicaCount"], json!(2));
        assert_eq!(values["server"]["deployment"]["image_tag"], json!("1.4.2"));
        assert_eq!(values["releaseVersion"], json!("7"));
        assert_eq!(values["pipelineName"], json!(testing::PIPELINE_NAME));
        assert_eq!(values["ConfigMaps"]["enabled"], json!(false));
    }

    #[tokio::test]
    async fn test_render_is_deterministic() {
        let store = testing::seeded_store().await;
        let prepared = prepare(store, FakeCluster::default(), DeploymentType::Deploy).await;
        assert_eq!(prepared.render(3).unwrap(), prepared.render(3).unwrap());
        assert_ne!(prepared.render(3).unwrap().values, prepared.render(4).unwrap().values);
    }

    #[tokio::test]
    async fn test_unresolved_variable_fails_without_output() {
        let store = testing::seeded_store().await;
        store.seed(|state| {
            for o in state.env_overrides.values_mut() {
                o.values = json!({"replicaCount": 2, "host": "@{{MISSING_HOST}}"});
            }
        })
        .await;
        let prepared = prepare(store, FakeCluster::default(), DeploymentType::Deploy).await;

        let err = prepared.render(1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ComposerErrorKind::ResolutionError);
        assert!(err.to_string().contains("MISSING_HOST"));
    }

    #[tokio::test]
    async fn test_secrets_are_masked_in_snapshots() {
        let store = testing::seeded_store().await;
        store.seed(|state| {
            state.variables.push(ScopedVariable {
                name: "DB_PASS".to_string(),
                value: json!("s3cret"),
                sensitive: false,
                scope: VariableScope::default(),
            });
            state.config_payloads.push(ConfigPayload {
                id: 50,
                app_id: testing::APP_ID,
                env_id: None,
                config_maps: Vec::new(),
                secrets: vec![secret_item("db", "PASSWORD", "@{{DB_PASS}}")],
            });
        })
        .await;
        let prepared = prepare(store, FakeCluster::default(), DeploymentType::Deploy).await;

        let composition = prepared.render(1).unwrap();
        let shipped = &composition.values["ConfigSecrets"]["secrets"][0]["data"]["PASSWORD"];
        assert_eq!(
            shipped,
            &json!(base64::engine::general_purpose::STANDARD.encode("s3cret"))
        );
        assert_eq!(composition.secrets[0].data["PASSWORD"], json!(crate::service::variables::MASK));
        assert_eq!(
            composition.variable_snapshot.get("DB_PASS").map(String::as_str),
            Some(crate::service::variables::MASK)
        );
    }

    #[tokio::test]
    async fn test_autoscaling_uses_live_hpa() {
        let store = testing::seeded_store().await;
        store.seed(|state| {
            for o in state.env_overrides.values_mut() {
                o.values = json!({
                    "replicaCount": 1,
                    "autoscaling": {"enabled": true, "MinReplicas": 2, "MaxReplicas": 5}
                });
            }
        })
        .await;
        let cluster = FakeCluster::default();
        cluster.put_hpa(
            &format!("{}-{}-hpa", testing::APP_NAME, testing::ENV_NAME),
            json!({"status": {"currentReplicas": 4}}),
        );
        let prepared = prepare(store, cluster, DeploymentType::Deploy).await;

        assert_eq!(prepared.render(1).unwrap().values["replicaCount"], json!(4));
    }

    #[tokio::test]
    async fn test_stop_zeroes_replicas() {
        let store = testing::seeded_store().await;
        let prepared = prepare(store, FakeCluster::default(), DeploymentType::Stop).await;
        assert_eq!(prepared.render(1).unwrap().values["replicaCount"], json!(0));
    }

    #[tokio::test]
    async fn test_pull_secret_and_labels() {
        let store = testing::seeded_store().await;
        store.seed(|state| {
            state.labels.insert(
                testing::APP_ID,
                vec![
                    AppLabel {
                        key: "team".to_string(),
                        value: "payments".to_string(),
                        propagate: true,
                    },
                    AppLabel {
                        key: "internal".to_string(),
                        value: "x".to_string(),
                        propagate: false,
                    },
                ],
            );
            state.pull_secrets.push(crate::repository::memory::PullSecretBinding {
                registry_id: testing::REGISTRY_ID.to_string(),
                cluster_id: None,
                secret_name: "regcred".to_string(),
            });
            for o in state.env_overrides.values_mut() {
                o.values = json!({"replicaCount": 1, "imagePullSecrets": ["regcred"]});
            }
        })
        .await;
        let prepared = prepare(store, FakeCluster::default(), DeploymentType::Deploy).await;

        let values = prepared.render(1).unwrap().values;
        assert_eq!(values["appLabels"], json!({"team": "payments"}));
        assert_eq!(values["imagePullSecrets"], json!(["regcred"]));
    }

    #[test]
    fn test_db_migration_requires_material() {
        let config = DbMigrationConfig {
            pipeline_id: 1,
            git_repo_url: "https://git.local/migrations.git".to_string(),
            git_user: "ci".to_string(),
            git_auth_token: "t".to_string(),
            script_location: "sql/".to_string(),
            db_type: "postgres".to_string(),
            db_user_name: "app".to_string(),
            db_password: "p".to_string(),
            db_host: "db".to_string(),
            db_port: "5432".to_string(),
            db_name: "app".to_string(),
            active: true,
        };
        let mut artifact = testing::artifact(1, "payments:1.0");

        let err = db_migration_stanza(&config, &artifact).unwrap_err();
        assert!(matches!(err, ComposerError::Merge { ref path, .. } if path == "dbMigrationConfig"));

        artifact
            .material_info
            .insert(config.git_repo_url.clone(), "abc123".to_string());
        let stanza = db_migration_stanza(&config, &artifact).unwrap();
        let env_values = stanza["dbMigrationConfig"]["envValues"].as_array().unwrap();
        assert!(env_values.contains(&json!({"key": "GIT_HASH", "value": "abc123"})));
        assert_eq!(env_values.len(), 11);
    }
}
