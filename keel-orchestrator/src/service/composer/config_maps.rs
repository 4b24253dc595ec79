//! Config map and secret layering
//!
//! App-level items are overlaid by environment-level items with the same
//! name. Secret data is stored base64 encoded; it is decoded for variable
//! resolution and then written the way the chart expects.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use keel_core::domain::chart::ChartRef;
use keel_core::domain::config::ConfigItem;
use serde_json::{Map, Value, json};

use crate::error::ComposerError;
use crate::service::variables::MASK;

/// How secret data is written into the values document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretTransform {
    /// base64, for charts that template `data:`
    Encoded,
    /// Plaintext, for charts that template `stringData:`
    Plain,
}

impl SecretTransform {
    /// Charts older than 3.8 expect plaintext
    pub fn for_chart(chart: &ChartRef) -> Self {
        match chart.major_minor() {
            Some(version) if version < (3, 8) => SecretTransform::Plain,
            _ => SecretTransform::Encoded,
        }
    }
}

/// Overlays `env` items onto `app` items keyed by name, keeping app order
pub fn overlay(app: &[ConfigItem], env: &[ConfigItem]) -> Vec<ConfigItem> {
    let mut merged: Vec<ConfigItem> = app
        .iter()
        .map(|item| {
            env.iter()
                .find(|e| e.name == item.name)
                .unwrap_or(item)
                .clone()
        })
        .collect();

    for item in env {
        if !app.iter().any(|a| a.name == item.name) {
            merged.push(item.clone());
        }
    }
    merged
}

/// Replaces base64 secret values with their plaintext
pub fn decode_secret(item: &ConfigItem) -> Result<ConfigItem, ComposerError> {
    map_data(item, |key, raw| {
        let bytes = STANDARD.decode(raw.trim()).map_err(|_| {
            ComposerError::merge(
                format!("ConfigSecrets.{}.data.{}", item.name, key),
                "secret value is not valid base64",
            )
        })?;
        String::from_utf8(bytes).map_err(|_| {
            ComposerError::merge(
                format!("ConfigSecrets.{}.data.{}", item.name, key),
                "secret value is not valid UTF-8",
            )
        })
    })
}

/// Writes plaintext secret values in the chart's expected form
pub fn encode_secret(
    item: &ConfigItem,
    transform: SecretTransform,
) -> Result<ConfigItem, ComposerError> {
    map_data(item, |_, plain| {
        Ok(match transform {
            SecretTransform::Encoded => STANDARD.encode(plain),
            SecretTransform::Plain => plain.to_string(),
        })
    })
}

/// Copy of a secret with every data value replaced by the mask
pub fn mask_secret(item: &ConfigItem) -> ConfigItem {
    let mut masked = item.clone();
    if let Value::Object(data) = &mut masked.data {
        for value in data.values_mut() {
            *value = Value::String(MASK.to_string());
        }
    }
    masked
}

/// The `ConfigMaps` / `ConfigSecrets` layer
pub fn to_layer(maps: &[ConfigItem], secrets: &[ConfigItem]) -> Result<Value, ComposerError> {
    let maps = serde_json::to_value(maps)
        .map_err(|e| ComposerError::merge("ConfigMaps", e.to_string()))?;
    let secrets = serde_json::to_value(secrets)
        .map_err(|e| ComposerError::merge("ConfigSecrets", e.to_string()))?;

    Ok(json!({
        "ConfigMaps": {
            "enabled": maps.as_array().is_some_and(|a| !a.is_empty()),
            "maps": maps,
        },
        "ConfigSecrets": {
            "enabled": secrets.as_array().is_some_and(|a| !a.is_empty()),
            "secrets": secrets,
        },
    }))
}

fn map_data<F>(item: &ConfigItem, mut f: F) -> Result<ConfigItem, ComposerError>
where
    F: FnMut(&str, &str) -> Result<String, ComposerError>,
{
    let mut out = item.clone();
    match &item.data {
        Value::Null => {}
        Value::Object(data) => {
            let mut mapped = Map::new();
            for (key, value) in data {
                let Value::String(raw) = value else {
                    return Err(ComposerError::merge(
                        format!("ConfigSecrets.{}.data.{}", item.name, key),
                        "secret value must be a string",
                    ));
                };
                mapped.insert(key.clone(), Value::String(f(key, raw)?));
            }
            out.data = Value::Object(mapped);
        }
        _ => {
            return Err(ComposerError::merge(
                format!("ConfigSecrets.{}.data", item.name),
                "secret data must be an object",
            ));
        }
    }
    Ok(out)
}
