//! Autoscaling reconciliation
//!
//! Keeps `replicaCount` in line with what the live HorizontalPodAutoscaler is
//! running so a deploy does not scale the workload back to the chart default.
//! Charts may relocate the autoscaling keys by declaring custom paths in
//! their values.

use keel_core::domain::release::DeploymentType;
use serde_json::{Value, json};

use super::path;
use crate::error::ComposerError;

const ENABLED_PATH_KEY: &str = "autoscalingEnabledPath";
const REPLICA_COUNT_PATH_KEY: &str = "replicaCountPath";
const MIN_REPLICAS_PATH_KEY: &str = "minReplicaCountPath";
const MAX_REPLICAS_PATH_KEY: &str = "maxReplicaCountPath";

const STANDARD_ENABLED: &str = "autoscaling.enabled";
const STANDARD_MIN: &str = "autoscaling.MinReplicas";
const STANDARD_MAX: &str = "autoscaling.MaxReplicas";
const REPLICA_COUNT: &str = "replicaCount";

const HPA_CURRENT_REPLICAS: &str = "status.currentReplicas";

/// Autoscaling key locations declared by a chart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomPaths {
    pub enabled: String,
    pub replica_count: Option<String>,
    pub min_replicas: Option<String>,
    pub max_replicas: Option<String>,
}

impl CustomPaths {
    /// Present only when the values declare `autoscalingEnabledPath`
    pub fn from_values(doc: &Value) -> Option<Self> {
        let read = |key: &str| {
            doc.get(key)
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            enabled: read(ENABLED_PATH_KEY)?,
            replica_count: read(REPLICA_COUNT_PATH_KEY),
            min_replicas: read(MIN_REPLICAS_PATH_KEY),
            max_replicas: read(MAX_REPLICAS_PATH_KEY),
        })
    }
}

fn is_true(doc: &Value, at: &str) -> bool {
    match path::get(doc, at) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Whether reconciliation wants the live replica count for `doc`
pub fn needs_live_replicas(doc: &Value, deployment_type: DeploymentType) -> bool {
    if deployment_type == DeploymentType::Stop {
        return false;
    }
    match CustomPaths::from_values(doc) {
        Some(paths) => is_true(doc, &paths.enabled),
        None => is_true(doc, STANDARD_ENABLED),
    }
}

/// `status.currentReplicas` of a live HPA manifest
pub fn current_replicas(hpa: &Value) -> Option<f64> {
    path::get_number(hpa, HPA_CURRENT_REPLICAS)
}

fn clamp(current: f64, min: f64, max: f64) -> i64 {
    current.max(min).min(max).round() as i64
}

/// Applies the autoscaling rules to a merged values document
pub fn reconcile(
    doc: &mut Value,
    deployment_type: DeploymentType,
    live_replicas: Option<f64>,
) -> Result<(), ComposerError> {
    match CustomPaths::from_values(doc) {
        Some(paths) => reconcile_custom(doc, &paths, deployment_type, live_replicas),
        None => reconcile_standard(doc, deployment_type, live_replicas),
    }
}

fn reconcile_standard(
    doc: &mut Value,
    deployment_type: DeploymentType,
    live_replicas: Option<f64>,
) -> Result<(), ComposerError> {
    if deployment_type == DeploymentType::Stop {
        path::set(doc, REPLICA_COUNT, json!(0))?;
        if path::get(doc, "autoscaling").is_some_and(Value::is_object) {
            path::set(doc, STANDARD_ENABLED, json!(false))?;
        }
        return Ok(());
    }

    if !is_true(doc, STANDARD_ENABLED) {
        return Ok(());
    }

    let bounds = (
        live_replicas,
        path::get_number(doc, STANDARD_MIN),
        path::get_number(doc, STANDARD_MAX),
    );
    match bounds {
        (Some(current), Some(min), Some(max)) => {
            path::set(doc, REPLICA_COUNT, json!(clamp(current, min, max)))?;
        }
        _ => tracing::debug!("Autoscaling bounds unavailable, keeping replicaCount"),
    }
    Ok(())
}

fn reconcile_custom(
    doc: &mut Value,
    paths: &CustomPaths,
    deployment_type: DeploymentType,
    live_replicas: Option<f64>,
) -> Result<(), ComposerError> {
    if deployment_type == DeploymentType::Stop {
        path::set(doc, &paths.enabled, json!(false))?;
        for at in [&paths.replica_count, &paths.min_replicas, &paths.max_replicas]
            .into_iter()
            .flatten()
        {
            path::set(doc, at, json!(0))?;
        }
        return Ok(());
    }

    if !is_true(doc, &paths.enabled) {
        return Ok(());
    }

    let (Some(replica_path), Some(min_path), Some(max_path)) =
        (&paths.replica_count, &paths.min_replicas, &paths.max_replicas)
    else {
        return Ok(());
    };

    let current = live_replicas.or_else(|| path::get_number(doc, replica_path));
    let bounds = (
        current,
        path::get_number(doc, min_path),
        path::get_number(doc, max_path),
    );
    if let (Some(current), Some(min), Some(max)) = bounds {
        path::set(doc, replica_path, json!(clamp(current, min, max)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_clamps_live_replicas() {
        let mut doc = json!({
            "replicaCount": 1,
            "autoscaling": {"enabled": true, "MinReplicas": 2, "MaxReplicas": 6}
        });
        reconcile(&mut doc, DeploymentType::Deploy, Some(9.0)).unwrap();
        assert_eq!(doc["replicaCount"], json!(6));

        reconcile(&mut doc, DeploymentType::Deploy, Some(4.0)).unwrap();
        assert_eq!(doc["replicaCount"], json!(4));
    }

    #[test]
    fn test_standard_without_live_resource_is_unchanged() {
        let mut doc = json!({
            "replicaCount": 1,
            "autoscaling": {"enabled": true, "MinReplicas": 2, "MaxReplicas": 6}
        });
        let before = doc.clone();
        reconcile(&mut doc, DeploymentType::Deploy, None).unwrap();
        assert_eq!(doc, before);
    }

    #[test]
    fn test_unparseable_bounds_are_non_fatal() {
        let mut doc = json!({
            "replicaCount": 1,
            "autoscaling": {"enabled": true, "MinReplicas": "two", "MaxReplicas": 6}
        });
        let before = doc.clone();
        reconcile(&mut doc, DeploymentType::Deploy, Some(3.0)).unwrap();
        assert_eq!(doc, before);
    }

    #[test]
    fn test_stop_disables_autoscaling() {
        let mut doc = json!({
            "replicaCount": 3,
            "autoscaling": {"enabled": true, "MinReplicas": 2, "MaxReplicas": 6}
        });
        reconcile(&mut doc, DeploymentType::Stop, Some(4.0)).unwrap();
        assert_eq!(doc["replicaCount"], json!(0));
        assert_eq!(doc["autoscaling"]["enabled"], json!(false));
    }

    #[test]
    fn test_stop_without_autoscaling_block() {
        let mut doc = json!({"replicaCount": 3});
        reconcile(&mut doc, DeploymentType::Stop, None).unwrap();
        assert_eq!(doc, json!({"replicaCount": 0}));
    }

    #[test]
    fn test_custom_paths_stop_zeroes_everything() {
        let mut doc = json!({
            "autoscalingEnabledPath": "kedaAutoscaling.enabled",
            "replicaCountPath": "replicas",
            "minReplicaCountPath": "kedaAutoscaling.minReplicaCount",
            "maxReplicaCountPath": "kedaAutoscaling.maxReplicaCount",
            "replicas": 3,
            "kedaAutoscaling": {"enabled": true, "minReplicaCount": 1, "maxReplicaCount": 5}
        });
        reconcile(&mut doc, DeploymentType::Stop, None).unwrap();
        assert_eq!(doc["replicas"], json!(0));
        assert_eq!(
            doc["kedaAutoscaling"],
            json!({"enabled": false, "minReplicaCount": 0, "maxReplicaCount": 0})
        );
    }

    #[test]
    fn test_custom_paths_clamp_in_values_count() {
        let mut doc = json!({
            "autoscalingEnabledPath": "keda.enabled",
            "replicaCountPath": "replicas",
            "minReplicaCountPath": "keda.min",
            "maxReplicaCountPath": "keda.max",
            "replicas": 1,
            "keda": {"enabled": true, "min": 2, "max": 5}
        });
        reconcile(&mut doc, DeploymentType::Deploy, None).unwrap();
        assert_eq!(doc["replicas"], json!(2));
    }

    #[test]
    fn test_needs_live_replicas() {
        let standard = json!({"autoscaling": {"enabled": true}});
        assert!(needs_live_replicas(&standard, DeploymentType::Deploy));
        assert!(!needs_live_replicas(&standard, DeploymentType::Stop));
        assert!(!needs_live_replicas(&json!({"replicaCount": 1}), DeploymentType::Deploy));

        let custom = json!({"autoscalingEnabledPath": "keda.enabled", "keda": {"enabled": "true"}});
        assert!(needs_live_replicas(&custom, DeploymentType::Start));
    }

    #[test]
    fn test_current_replicas_from_manifest() {
        let hpa = json!({"status": {"currentReplicas": 4, "desiredReplicas": 5}});
        assert_eq!(current_replicas(&hpa), Some(4.0));
        assert_eq!(current_replicas(&json!({"status": {}})), None);
    }
}
