//! Chart domain types

use serde::{Deserialize, Serialize};

/// Immutable, versioned template bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartRef {
    pub id: i64,
    pub name: String,
    pub version: String,

    /// Template rendered against the release attributes to produce the
    /// image/version section of the values document
    pub image_descriptor_template: String,

    pub app_metrics_supported: bool,
}

impl ChartRef {
    /// Parses the leading `major.minor` of the chart version
    pub fn major_minor(&self) -> Option<(u64, u64)> {
        let mut parts = self.version.trim_start_matches('v').split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts
            .next()
            .map(|m| {
                m.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
            })
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        Some((major, minor))
    }
}

/// Binding of an application to a chart reference, carrying the base defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppChart {
    pub id: i64,
    pub app_id: i64,
    pub chart_ref_id: i64,

    /// Chart base defaults
    pub values: serde_json::Value,

    /// Directory of the chart inside the GitOps repository
    pub chart_location: String,

    pub git_repo_url: Option<String>,
    pub latest: bool,
    pub created_on: chrono::DateTime<chrono::Utc>,
}

/// Per-(app, env, chart) environment override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvOverride {
    pub id: i64,
    pub app_id: i64,
    pub env_id: i64,

    /// App chart this override applies to
    pub chart_id: i64,

    pub values: serde_json::Value,
    pub namespace: String,

    /// When false, the chart base defaults are used instead of `values`
    pub is_override: bool,

    pub latest: bool,
    pub status: OverrideStatus,
    pub active: bool,
}

/// New environment override row
#[derive(Debug, Clone)]
pub struct NewEnvOverride {
    pub app_id: i64,
    pub env_id: i64,
    pub chart_id: i64,
    pub values: serde_json::Value,
    pub namespace: String,
    pub is_override: bool,
    pub latest: bool,
    pub created_by: i64,
}

/// Lifecycle of an environment override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverrideStatus {
    New,
    Success,
    Error,
}

impl std::fmt::Display for OverrideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverrideStatus::New => write!(f, "NEW"),
            OverrideStatus::Success => write!(f, "SUCCESS"),
            OverrideStatus::Error => write!(f, "ERROR"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart(version: &str) -> ChartRef {
        ChartRef {
            id: 1,
            name: "reference-chart".to_string(),
            version: version.to_string(),
            image_descriptor_template: String::new(),
            app_metrics_supported: false,
        }
    }

    #[test]
    fn test_major_minor() {
        assert_eq!(chart("4.18.1").major_minor(), Some((4, 18)));
        assert_eq!(chart("v3.7").major_minor(), Some((3, 7)));
        assert_eq!(chart("3.9.0-rc1").major_minor(), Some((3, 9)));
        assert_eq!(chart("5").major_minor(), Some((5, 0)));
        assert_eq!(chart("latest").major_minor(), None);
    }
}
