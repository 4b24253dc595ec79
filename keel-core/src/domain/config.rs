//! Config map and secret payloads

use serde::{Deserialize, Serialize};

/// Config maps and secrets attached at app level (`env_id = None`) or
/// environment level
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPayload {
    pub id: i64,
    pub app_id: i64,
    pub env_id: Option<i64>,
    pub config_maps: Vec<ConfigItem>,
    pub secrets: Vec<ConfigItem>,
}

/// A single config map or secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigItem {
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: ConfigItemType,
    pub external: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// How a config item is consumed by the workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigItemType {
    Environment,
    Volume,
}
