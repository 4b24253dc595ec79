//! Image descriptor rendering
//!
//! Renders a chart's image-descriptor template into the release-override
//! JSON layer. Templates use handlebars in strict mode with escaping off;
//! the legacy `{{.Field}}` spelling is normalized to `{{Field}}`.

use std::sync::LazyLock;

use handlebars::Handlebars;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::ComposerError;

static LEGACY_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}")
        .unwrap_or_else(|e| panic!("legacy field pattern failed to compile: {}", e))
});

/// Values the image descriptor template is rendered against
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseAttributes {
    /// Image repository without the tag
    pub name: String,
    pub tag: String,
    pub pipeline_name: String,
    pub release_version: String,
    pub deployment_type: String,
    pub app: String,
    pub env: String,
    pub app_metrics: bool,
}

/// Splits an image reference into repository and tag. A `:` that belongs to
/// a registry port is not a tag separator.
pub fn split_image(image: &str) -> (String, String) {
    match image.rfind(':') {
        Some(colon) if !image[colon..].contains('/') => {
            (image[..colon].to_string(), image[colon + 1..].to_string())
        }
        _ => (image.to_string(), String::new()),
    }
}

/// Tag to deploy; digest-pinned pipelines get `tag@digest`
pub fn deploy_tag(tag: &str, digest: Option<&str>, use_digest: bool) -> String {
    match digest.filter(|d| use_digest && !d.is_empty()) {
        Some(digest) if tag.is_empty() => format!("@{}", digest),
        Some(digest) => format!("{}@{}", tag, digest),
        None => tag.to_string(),
    }
}

/// Renders `template` and parses the output as a JSON object
pub fn render(template: &str, attributes: &ReleaseAttributes) -> Result<Value, ComposerError> {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(true);
    hb.register_escape_fn(handlebars::no_escape);

    let normalized = LEGACY_FIELD.replace_all(template, "{{$1}}");
    let rendered = hb
        .render_template(&normalized, attributes)
        .map_err(|e| ComposerError::Template(e.to_string()))?;

    let value: Value = serde_json::from_str(&rendered).map_err(|e| {
        ComposerError::Template(format!("rendered descriptor is not valid JSON: {}", e))
    })?;

    if !value.is_object() {
        return Err(ComposerError::Template(
            "rendered descriptor is not a JSON object".to_string(),
        ));
    }
    Ok(value)
}
