//! Application status domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health reported by the CD agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Missing,
    Suspended,
    Unknown,
}

impl From<String> for HealthStatus {
    fn from(s: String) -> Self {
        HealthStatus::parse(&s)
    }
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Progressing => "Progressing",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Missing => "Missing",
            HealthStatus::Suspended => "Suspended",
            HealthStatus::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "Healthy" => HealthStatus::Healthy,
            "Progressing" => HealthStatus::Progressing,
            "Degraded" => HealthStatus::Degraded,
            "Missing" => HealthStatus::Missing,
            "Suspended" => HealthStatus::Suspended,
            _ => HealthStatus::Unknown,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Raw health per (app, env), last-writer-wins by `updated_at`
///
/// A row written when the deploy runner of `release_id` went terminal is
/// `settled`: only a newer release may replace it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatus {
    pub app_id: i64,
    pub env_id: i64,
    pub release_id: i64,
    pub status: HealthStatus,
    pub settled: bool,
    pub updated_at: DateTime<Utc>,
}

impl AppStatus {
    /// Whether `next` may overwrite this row
    pub fn accepts(&self, next: &AppStatus) -> bool {
        if self.settled && next.release_id <= self.release_id {
            return false;
        }
        if next.updated_at < self.updated_at {
            return false;
        }
        next.updated_at > self.updated_at
            || next.status != self.status
            || next.settled != self.settled
    }
}

/// Status exposed to consumers after hibernation semantics are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectedStatus {
    Health(HealthStatus),
    Hibernating,
    PartialHibernation,
}

impl ProjectedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectedStatus::Health(health) => health.as_str(),
            ProjectedStatus::Hibernating => "HIBERNATING",
            ProjectedStatus::PartialHibernation => "PARTIAL_HIBERNATION",
        }
    }
}

impl std::fmt::Display for ProjectedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ProjectedStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_health_deserializes() {
        let health: HealthStatus = serde_json::from_str("\"Exotic\"").unwrap();
        assert_eq!(health, HealthStatus::Unknown);
        assert_eq!(HealthStatus::parse("Degraded"), HealthStatus::Degraded);
    }

    #[test]
    fn test_projected_status_serializes_as_string() {
        let json = serde_json::to_string(&ProjectedStatus::Hibernating).unwrap();
        assert_eq!(json, "\"HIBERNATING\"");
        let json = serde_json::to_string(&ProjectedStatus::Health(HealthStatus::Healthy)).unwrap();
        assert_eq!(json, "\"Healthy\"");
    }

    #[test]
    fn test_settled_status_only_yields_to_newer_release() {
        let t = Utc::now();
        let row = |release_id, status, settled, at| AppStatus {
            app_id: 1,
            env_id: 2,
            release_id,
            status,
            settled,
            updated_at: at,
        };
        let healthy = row(40, HealthStatus::Healthy, true, t);
        let later = t + chrono::Duration::seconds(60);

        assert!(!healthy.accepts(&row(40, HealthStatus::Progressing, false, later)));
        assert!(!healthy.accepts(&row(39, HealthStatus::Degraded, false, later)));
        assert!(healthy.accepts(&row(41, HealthStatus::Progressing, false, later)));

        let open = row(40, HealthStatus::Progressing, false, t);
        assert!(open.accepts(&row(40, HealthStatus::Degraded, false, later)));
        assert!(!open.accepts(&row(40, HealthStatus::Degraded, false, t - chrono::Duration::seconds(1))));
        assert!(!open.accepts(&open.clone()));
    }
}
