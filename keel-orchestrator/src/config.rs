//! Engine configuration
//!
//! Defines the tunables of the progression engine: status timeouts, the
//! manual-sync gate, variable resolution and GitOps publishing settings.

use std::time::Duration;

/// Engine configuration
///
/// Injected into every service; the engine holds no process-wide state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time without timeline progress after which a runner times out
    pub status_timeout: Duration,

    /// Time a runner may stay Degraded before it is failed
    pub degraded_time: Duration,

    /// Minimum age of a chart-push runner before status checks consider it
    pub chart_push_status_check_eligible_time: Duration,

    /// Record CD counters through the metrics facade
    pub expose_cd_metrics: bool,

    /// Wait for an explicit sync-completed marker before evaluating outcomes
    pub manual_sync_enabled: bool,

    /// Look up stored scoped variables during resolution
    pub scoped_variables_enabled: bool,

    /// Prefix prepended to application names to form GitOps repository names
    pub gitops_repo_prefix: String,

    /// Attempts for a values commit rejected as non-fast-forward
    pub gitops_commit_retries: u32,

    /// Period of the timeout sweep
    pub sweep_interval: Duration,
}

impl EngineConfig {
    /// Creates a configuration with defaults
    pub fn new() -> Self {
        Self {
            status_timeout: Duration::from_secs(20 * 60),
            degraded_time: Duration::from_secs(10 * 60),
            chart_push_status_check_eligible_time: Duration::from_secs(120),
            expose_cd_metrics: false,
            manual_sync_enabled: false,
            scoped_variables_enabled: true,
            gitops_repo_prefix: String::new(),
            gitops_commit_retries: 3,
            sweep_interval: Duration::from_secs(60),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Recognized environment variables:
    /// - CD_PIPELINE_STATUS_TIMEOUT_DURATION (minutes, default: 20)
    /// - PIPELINE_DEGRADED_TIME (minutes, default: 10)
    /// - HELM_PIPELINE_STATUS_CHECK_ELIGIBLE_TIME (seconds, default: 120)
    /// - EXPOSE_CD_METRICS (bool, default: false)
    /// - ARGOCD_MANUAL_SYNC_ENABLED (bool, default: false)
    /// - SCOPED_VARIABLE_ENABLED (bool, default: true)
    /// - GITOPS_REPO_PREFIX (default: empty)
    /// - GITOPS_COMMIT_RETRIES (default: 3)
    /// - TIMEOUT_SWEEP_INTERVAL (seconds, default: 60)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::new();

        let minutes = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            match lookup(key) {
                Some(raw) => {
                    let value = raw
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| anyhow::anyhow!("{} must be a whole number of minutes", key))?;
                    Ok(Duration::from_secs(value * 60))
                }
                None => Ok(default),
            }
        };

        let seconds = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            match lookup(key) {
                Some(raw) => {
                    let value = raw
                        .trim()
                        .parse::<u64>()
                        .map_err(|_| anyhow::anyhow!("{} must be a whole number of seconds", key))?;
                    Ok(Duration::from_secs(value))
                }
                None => Ok(default),
            }
        };

        let flag = |key: &str, default: bool| -> anyhow::Result<bool> {
            match lookup(key) {
                Some(raw) => parse_bool(&raw)
                    .ok_or_else(|| anyhow::anyhow!("{} must be a boolean, got {:?}", key, raw)),
                None => Ok(default),
            }
        };

        let gitops_commit_retries = lookup("GITOPS_COMMIT_RETRIES")
            .map(|raw| {
                raw.trim()
                    .parse::<u32>()
                    .map_err(|_| anyhow::anyhow!("GITOPS_COMMIT_RETRIES must be a number"))
            })
            .transpose()?
            .unwrap_or(defaults.gitops_commit_retries);

        let config = Self {
            status_timeout: minutes("CD_PIPELINE_STATUS_TIMEOUT_DURATION", defaults.status_timeout)?,
            degraded_time: minutes("PIPELINE_DEGRADED_TIME", defaults.degraded_time)?,
            chart_push_status_check_eligible_time: seconds(
                "HELM_PIPELINE_STATUS_CHECK_ELIGIBLE_TIME",
                defaults.chart_push_status_check_eligible_time,
            )?,
            expose_cd_metrics: flag("EXPOSE_CD_METRICS", defaults.expose_cd_metrics)?,
            manual_sync_enabled: flag("ARGOCD_MANUAL_SYNC_ENABLED", defaults.manual_sync_enabled)?,
            scoped_variables_enabled: flag(
                "SCOPED_VARIABLE_ENABLED",
                defaults.scoped_variables_enabled,
            )?,
            gitops_repo_prefix: lookup("GITOPS_REPO_PREFIX").unwrap_or_default(),
            gitops_commit_retries,
            sweep_interval: seconds("TIMEOUT_SWEEP_INTERVAL", defaults.sweep_interval)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status_timeout.is_zero() {
            anyhow::bail!("CD_PIPELINE_STATUS_TIMEOUT_DURATION must be greater than 0");
        }

        if self.degraded_time.is_zero() {
            anyhow::bail!("PIPELINE_DEGRADED_TIME must be greater than 0");
        }

        if self.gitops_commit_retries == 0 {
            anyhow::bail!("GITOPS_COMMIT_RETRIES must be at least 1");
        }

        if self.sweep_interval.is_zero() {
            anyhow::bail!("TIMEOUT_SWEEP_INTERVAL must be greater than 0");
        }

        if self
            .gitops_repo_prefix
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            anyhow::bail!("GITOPS_REPO_PREFIX may only contain letters, digits, '-' and '_'");
        }

        Ok(())
    }

    /// GitOps repository name for an application
    pub fn repo_name(&self, app_name: &str) -> String {
        if self.gitops_repo_prefix.is_empty() {
            app_name.to_string()
        } else {
            format!("{}-{}", self.gitops_repo_prefix, app_name)
        }
    }

    /// Sets the status timeout
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Enables or disables manual-sync gating
    pub fn with_manual_sync(mut self, enabled: bool) -> Self {
        self.manual_sync_enabled = enabled;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.status_timeout, Duration::from_secs(1200));
        assert_eq!(config.degraded_time, Duration::from_secs(600));
        assert_eq!(
            config.chart_push_status_check_eligible_time,
            Duration::from_secs(120)
        );
        assert!(!config.manual_sync_enabled);
        assert!(config.scoped_variables_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("CD_PIPELINE_STATUS_TIMEOUT_DURATION", "5"),
            ("PIPELINE_DEGRADED_TIME", "2"),
            ("HELM_PIPELINE_STATUS_CHECK_ELIGIBLE_TIME", "30"),
            ("ARGOCD_MANUAL_SYNC_ENABLED", "true"),
            ("EXPOSE_CD_METRICS", "1"),
            ("GITOPS_REPO_PREFIX", "acme"),
        ]))
        .unwrap();

        assert_eq!(config.status_timeout, Duration::from_secs(300));
        assert_eq!(config.degraded_time, Duration::from_secs(120));
        assert_eq!(
            config.chart_push_status_check_eligible_time,
            Duration::from_secs(30)
        );
        assert!(config.manual_sync_enabled);
        assert!(config.expose_cd_metrics);
        assert_eq!(config.repo_name("payments"), "acme-payments");
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        assert!(EngineConfig::from_lookup(lookup(&[("PIPELINE_DEGRADED_TIME", "ten")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("EXPOSE_CD_METRICS", "maybe")])).is_err());
        assert!(
            EngineConfig::from_lookup(lookup(&[("CD_PIPELINE_STATUS_TIMEOUT_DURATION", "0")]))
                .is_err()
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.gitops_repo_prefix = "bad prefix".to_string();
        assert!(config.validate().is_err());

        config.gitops_repo_prefix = "ok_prefix".to_string();
        config.gitops_commit_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_repo_name_without_prefix() {
        assert_eq!(EngineConfig::default().repo_name("payments"), "payments");
    }
}
