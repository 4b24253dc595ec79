//! Scoped variable domain types

use serde::{Deserialize, Serialize};

/// A stored variable value bound to a scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopedVariable {
    pub name: String,
    pub value: serde_json::Value,

    /// Sensitive values are masked in snapshots and never logged
    pub sensitive: bool,

    pub scope: VariableScope,
}

/// Where a variable value applies; unset fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableScope {
    pub app_id: Option<i64>,
    pub env_id: Option<i64>,
    pub cluster_id: Option<i64>,
}

impl VariableScope {
    /// Precedence of this scope; higher wins. `None` when it does not apply.
    pub fn priority(&self, app_id: i64, env_id: i64, cluster_id: i64) -> Option<u8> {
        let app_ok = self.app_id.is_none_or(|a| a == app_id);
        let env_ok = self.env_id.is_none_or(|e| e == env_id);
        let cluster_ok = self.cluster_id.is_none_or(|c| c == cluster_id);
        if !(app_ok && env_ok && cluster_ok) {
            return None;
        }

        let priority = match (self.app_id, self.env_id, self.cluster_id) {
            (Some(_), Some(_), _) => 5,
            (Some(_), None, _) => 4,
            (None, Some(_), _) => 3,
            (None, None, Some(_)) => 2,
            (None, None, None) => 1,
        };
        Some(priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let app_env = VariableScope {
            app_id: Some(1),
            env_id: Some(2),
            cluster_id: None,
        };
        let app = VariableScope {
            app_id: Some(1),
            ..Default::default()
        };
        let env = VariableScope {
            env_id: Some(2),
            ..Default::default()
        };
        let cluster = VariableScope {
            cluster_id: Some(3),
            ..Default::default()
        };
        let global = VariableScope::default();

        let p = |s: &VariableScope| s.priority(1, 2, 3).unwrap();
        assert!(p(&app_env) > p(&app));
        assert!(p(&app) > p(&env));
        assert!(p(&env) > p(&cluster));
        assert!(p(&cluster) > p(&global));
    }

    #[test]
    fn test_non_matching_scope() {
        let other_app = VariableScope {
            app_id: Some(9),
            ..Default::default()
        };
        assert_eq!(other_app.priority(1, 2, 3), None);
    }
}
