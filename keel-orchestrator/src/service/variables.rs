//! Variable Resolver
//!
//! Resolves `@{{name}}` placeholders in templates and config payloads against
//! scoped variables and system metadata. Lookups happen once in
//! [`VariableResolver::prepare`]; resolution itself is pure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use keel_core::domain::variable::ScopedVariable;
use regex::Regex;
use serde_json::Value;

use crate::error::{ResolutionError, StoreError};
use crate::repository::VariableRepository;

pub const MASK: &str = "********";

pub const SYS_APP_NAME: &str = "KEEL_APP_NAME";
pub const SYS_ENV_NAME: &str = "KEEL_ENV_NAME";
pub const SYS_NAMESPACE: &str = "KEEL_NAMESPACE";
pub const SYS_CLUSTER_NAME: &str = "KEEL_CLUSTER_NAME";
pub const SYS_IMAGE: &str = "KEEL_IMAGE";
pub const SYS_IMAGE_TAG: &str = "KEEL_IMAGE_TAG";

/// Matches a placeholder anchored at the search start
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}")
        .unwrap_or_else(|e| panic!("placeholder pattern failed to compile: {}", e))
});

/// Metadata exposed to templates as system variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemMetadata {
    pub app_name: String,
    pub env_name: String,
    pub namespace: String,
    pub cluster_name: String,
    pub image: String,
    pub image_tag: String,
}

/// Scope a template is resolved in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionScope {
    pub app_id: i64,
    pub env_id: i64,
    pub cluster_id: i64,
    pub system: SystemMetadata,
}

/// Result of a resolution: the document and the variables it used
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub snapshot: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    value: Value,
    sensitive: bool,
}

/// Variables available to a single composition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableSet {
    bindings: BTreeMap<String, Binding>,
    /// Unknown names stay literal regardless of the caller's choice
    lenient: bool,
}

impl VariableSet {
    /// Builds the set for a scope from candidate stored variables; the most
    /// specific matching scope wins and system variables override everything
    pub fn build(scope: &ResolutionScope, stored: Vec<ScopedVariable>, lenient: bool) -> Self {
        let mut best: BTreeMap<String, (u8, Binding)> = BTreeMap::new();

        for var in stored {
            let Some(priority) = var
                .scope
                .priority(scope.app_id, scope.env_id, scope.cluster_id)
            else {
                continue;
            };
            let replace = best
                .get(&var.name)
                .is_none_or(|(current, _)| priority > *current);
            if replace {
                best.insert(
                    var.name,
                    (
                        priority,
                        Binding {
                            value: var.value,
                            sensitive: var.sensitive,
                        },
                    ),
                );
            }
        }

        let mut bindings: BTreeMap<String, Binding> =
            best.into_iter().map(|(name, (_, b))| (name, b)).collect();

        let system = &scope.system;
        for (name, value) in [
            (SYS_APP_NAME, &system.app_name),
            (SYS_ENV_NAME, &system.env_name),
            (SYS_NAMESPACE, &system.namespace),
            (SYS_CLUSTER_NAME, &system.cluster_name),
            (SYS_IMAGE, &system.image),
            (SYS_IMAGE_TAG, &system.image_tag),
        ] {
            bindings.insert(
                name.to_string(),
                Binding {
                    value: Value::String(value.clone()),
                    sensitive: false,
                },
            );
        }

        Self { bindings, lenient }
    }

    /// Resolves placeholders inside the string leaves of a JSON document
    pub fn resolve_value(
        &self,
        document: &Value,
        ignore_unknown: bool,
    ) -> Result<Resolved<Value>, ResolutionError> {
        let text = document.to_string();
        let resolved = self.resolve_json(&text, ignore_unknown)?;
        let value = serde_json::from_str(&resolved.value)
            .map_err(|e| ResolutionError::InvalidDocument(e.to_string()))?;
        Ok(Resolved {
            value,
            snapshot: resolved.snapshot,
        })
    }

    /// Secret codepath: same substitution, every snapshot value masked
    pub fn resolve_secret(
        &self,
        document: &Value,
        ignore_unknown: bool,
    ) -> Result<Resolved<Value>, ResolutionError> {
        let mut resolved = self.resolve_value(document, ignore_unknown)?;
        for value in resolved.snapshot.values_mut() {
            *value = MASK.to_string();
        }
        Ok(resolved)
    }

    /// Resolves a JSON template. A placeholder filling a whole string literal
    /// becomes the raw JSON value; one embedded in a longer string becomes
    /// the escaped string form; a bare one becomes the raw value.
    pub fn resolve_json(
        &self,
        template: &str,
        ignore_unknown: bool,
    ) -> Result<Resolved<String>, ResolutionError> {
        let mut out = String::with_capacity(template.len());
        let mut acc = Accumulator::new(self, ignore_unknown);

        let mut in_string = false;
        let mut escaped = false;
        // output offset of the opening quote of the current string literal
        let mut string_open = 0usize;
        let mut string_start = 0usize;
        let mut i = 0usize;

        while i < template.len() {
            let rest = &template[i..];

            if in_string && escaped {
                escaped = false;
                let ch = next_char(rest);
                out.push(ch);
                i += ch.len_utf8();
                continue;
            }

            // Malformed `@{{` text falls through and is copied as is
            if let Some(caps) = PLACEHOLDER.captures(rest) {
                let whole = caps.get(0).map_or(0, |m| m.len());
                let name = caps.get(1).map_or("", |m| m.as_str());
                let end = i + whole;

                let Some(value) = acc.lookup(name) else {
                    out.push_str(&template[i..end]);
                    i = end;
                    continue;
                };

                if !in_string {
                    out.push_str(&value.to_string());
                } else if i == string_start && template[end..].starts_with('"') {
                    out.truncate(string_open);
                    out.push_str(&value.to_string());
                    in_string = false;
                    i = end + 1;
                    continue;
                } else {
                    out.push_str(&escape_fragment(&string_form(&value)));
                }
                i = end;
                continue;
            }

            let ch = next_char(rest);
            if in_string {
                match ch {
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
            } else if ch == '"' {
                in_string = true;
                string_open = out.len();
                string_start = i + 1;
            }
            out.push(ch);
            i += ch.len_utf8();
        }

        acc.finish(out)
    }

    /// Resolves a plain text template; every placeholder gets the string form
    pub fn resolve_text(
        &self,
        template: &str,
        ignore_unknown: bool,
    ) -> Result<Resolved<String>, ResolutionError> {
        let mut out = String::with_capacity(template.len());
        let mut acc = Accumulator::new(self, ignore_unknown);
        let mut i = 0usize;

        while i < template.len() {
            let rest = &template[i..];
            if let Some(caps) = PLACEHOLDER.captures(rest) {
                let whole = caps.get(0).map_or(0, |m| m.len());
                let name = caps.get(1).map_or("", |m| m.as_str());
                match acc.lookup(name) {
                    Some(value) => out.push_str(&string_form(&value)),
                    None => out.push_str(&rest[..whole]),
                }
                i += whole;
                continue;
            }
            let ch = next_char(rest);
            out.push(ch);
            i += ch.len_utf8();
        }

        acc.finish(out)
    }
}

/// Collects the snapshot and unresolved names during one resolution
struct Accumulator<'a> {
    set: &'a VariableSet,
    ignore_unknown: bool,
    snapshot: BTreeMap<String, String>,
    unresolved: BTreeSet<String>,
}

impl<'a> Accumulator<'a> {
    fn new(set: &'a VariableSet, ignore_unknown: bool) -> Self {
        Self {
            set,
            ignore_unknown: ignore_unknown || set.lenient,
            snapshot: BTreeMap::new(),
            unresolved: BTreeSet::new(),
        }
    }

    fn lookup(&mut self, name: &str) -> Option<Value> {
        match self.set.bindings.get(name) {
            Some(binding) => {
                let shown = if binding.sensitive {
                    MASK.to_string()
                } else {
                    string_form(&binding.value)
                };
                self.snapshot.insert(name.to_string(), shown);
                Some(binding.value.clone())
            }
            None => {
                self.unresolved.insert(name.to_string());
                None
            }
        }
    }

    fn finish(self, value: String) -> Result<Resolved<String>, ResolutionError> {
        if !self.unresolved.is_empty() && !self.ignore_unknown {
            return Err(ResolutionError::Unresolved(
                self.unresolved.into_iter().collect(),
            ));
        }
        Ok(Resolved {
            value,
            snapshot: self.snapshot,
        })
    }
}

/// Loads the stored variables a composition needs
#[derive(Clone)]
pub struct VariableResolver {
    variables: Arc<dyn VariableRepository>,
    enabled: bool,
}

impl VariableResolver {
    pub fn new(variables: Arc<dyn VariableRepository>, enabled: bool) -> Self {
        Self { variables, enabled }
    }

    /// Fetches every stored variable referenced by `templates`
    pub async fn prepare(
        &self,
        scope: &ResolutionScope,
        templates: &[String],
    ) -> Result<VariableSet, StoreError> {
        let names: Vec<String> = templates
            .iter()
            .flat_map(|t| placeholder_names(t))
            .filter(|n| !is_system_variable(n))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let stored = if self.enabled && !names.is_empty() {
            self.variables.find_by_names(&names).await?
        } else {
            Vec::new()
        };

        tracing::debug!(
            "Loaded {} stored variables for {} referenced names",
            stored.len(),
            names.len()
        );

        Ok(VariableSet::build(scope, stored, !self.enabled))
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Names referenced by well-formed placeholders, in order of appearance
pub fn placeholder_names(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut i = 0usize;
    while let Some(pos) = template[i..].find("@{{") {
        let at = i + pos;
        match PLACEHOLDER.captures(&template[at..]) {
            Some(caps) => {
                if let Some(name) = caps.get(1) {
                    names.push(name.as_str().to_string());
                }
                i = at + caps.get(0).map_or(3, |m| m.len());
            }
            None => i = at + 3,
        }
    }
    names
}

fn is_system_variable(name: &str) -> bool {
    matches!(
        name,
        SYS_APP_NAME | SYS_ENV_NAME | SYS_NAMESPACE | SYS_CLUSTER_NAME | SYS_IMAGE | SYS_IMAGE_TAG
    )
}

fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON-escapes a fragment for embedding inside an existing string literal
fn escape_fragment(s: &str) -> String {
    let quoted = Value::String(s.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

fn next_char(s: &str) -> char {
    s.chars().next().unwrap_or('\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::domain::variable::VariableScope;
    use serde_json::json;

    fn scope() -> ResolutionScope {
        ResolutionScope {
            app_id: 1,
            env_id: 2,
            cluster_id: 3,
            system: SystemMetadata {
                app_name: "payments".to_string(),
                env_name: "prod".to_string(),
                namespace: "payments-prod".to_string(),
                cluster_name: "default".to_string(),
                image: "registry.local/payments:1.4.2".to_string(),
                image_tag: "1.4.2".to_string(),
            },
        }
    }

    fn var(name: &str, value: Value, scope: VariableScope) -> ScopedVariable {
        ScopedVariable {
            name: name.to_string(),
            value,
            sensitive: false,
            scope,
        }
    }

    fn set() -> VariableSet {
        let mut token = var("TOKEN", json!("s3cr3t"), VariableScope::default());
        token.sensitive = true;
        VariableSet::build(
            &scope(),
            vec![
                var("REPLICAS", json!(3), VariableScope::default()),
                var(
                    "REPLICAS",
                    json!(5),
                    VariableScope {
                        app_id: Some(1),
                        env_id: Some(2),
                        cluster_id: None,
                    },
                ),
                var("ENABLED", json!(true), VariableScope::default()),
                var("QUOTE", json!("say \"hi\""), VariableScope::default()),
                var(
                    "OTHER_APP",
                    json!("x"),
                    VariableScope {
                        app_id: Some(9),
                        ..Default::default()
                    },
                ),
                var(SYS_APP_NAME, json!("spoofed"), VariableScope::default()),
                token,
            ],
            false,
        )
    }

    #[test]
    fn test_whole_string_placeholder_keeps_type() {
        let resolved = set()
            .resolve_value(&json!({"replicaCount": "@{{REPLICAS}}", "on": "@{{ ENABLED }}"}), false)
            .unwrap();
        assert_eq!(resolved.value, json!({"replicaCount": 5, "on": true}));
        assert_eq!(resolved.snapshot["REPLICAS"], "5");
    }

    #[test]
    fn test_embedded_placeholder_is_escaped() {
        let resolved = set()
            .resolve_value(&json!({"msg": "value: @{{QUOTE}}!"}), false)
            .unwrap();
        assert_eq!(resolved.value, json!({"msg": "value: say \"hi\"!"}));
    }

    #[test]
    fn test_bare_placeholder_in_raw_json() {
        let resolved = set()
            .resolve_json(r#"{"replicas": @{{REPLICAS}}}"#, false)
            .unwrap();
        assert_eq!(resolved.value, r#"{"replicas": 5}"#);
    }

    #[test]
    fn test_system_variables_win() {
        let resolved = set()
            .resolve_text("app=@{{KEEL_APP_NAME}} ns=@{{KEEL_NAMESPACE}}", false)
            .unwrap();
        assert_eq!(resolved.value, "app=payments ns=payments-prod");
    }

    #[test]
    fn test_unresolved_fails_unless_ignored() {
        let err = set()
            .resolve_text("@{{MISSING}} @{{OTHER_APP}}", false)
            .unwrap_err();
        assert_eq!(
            err,
            ResolutionError::Unresolved(vec!["MISSING".to_string(), "OTHER_APP".to_string()])
        );

        let resolved = set().resolve_text("x=@{{MISSING}}", true).unwrap();
        assert_eq!(resolved.value, "x=@{{MISSING}}");
        assert!(resolved.snapshot.is_empty());
    }

    #[test]
    fn test_malformed_placeholder_is_literal() {
        let resolved = set().resolve_text("abc @{{OPEN", false).unwrap();
        assert_eq!(resolved.value, "abc @{{OPEN");

        let resolved = set()
            .resolve_text("mail me @{{ }} or @{{REPLICAS}}", false)
            .unwrap();
        assert_eq!(resolved.value, "mail me @{{ }} or 5");

        let resolved = set()
            .resolve_value(&json!({"note": "mail me @{{ }}", "n": "@{{REPLICAS}}"}), false)
            .unwrap();
        assert_eq!(resolved.value, json!({"note": "mail me @{{ }}", "n": 5}));
        assert_eq!(placeholder_names("mail me @{{ }} @{{REPLICAS}}"), vec!["REPLICAS"]);
    }

    #[test]
    fn test_sensitive_values_masked_in_snapshot() {
        let resolved = set()
            .resolve_value(&json!({"token": "@{{TOKEN}}"}), false)
            .unwrap();
        assert_eq!(resolved.value, json!({"token": "s3cr3t"}));
        assert_eq!(resolved.snapshot["TOKEN"], MASK);
    }

    #[test]
    fn test_secret_codepath_masks_everything() {
        let resolved = set()
            .resolve_secret(&json!({"n": "@{{REPLICAS}}"}), false)
            .unwrap();
        assert_eq!(resolved.value, json!({"n": 5}));
        assert_eq!(resolved.snapshot["REPLICAS"], MASK);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let template = json!({"a": "@{{REPLICAS}}", "b": "x-@{{KEEL_ENV_NAME}}"});
        let once = set().resolve_value(&template, false).unwrap();
        let twice = set().resolve_value(&once.value, false).unwrap();
        assert_eq!(once.value, twice.value);
    }

    #[test]
    fn test_lenient_set_ignores_unknown() {
        let lenient = VariableSet::build(&scope(), Vec::new(), true);
        let resolved = lenient.resolve_text("@{{NOPE}}-@{{KEEL_ENV_NAME}}", false).unwrap();
        assert_eq!(resolved.value, "@{{NOPE}}-prod");
    }

    #[test]
    fn test_placeholder_names() {
        assert_eq!(
            placeholder_names(r#"{"a":"@{{ A }}","b":"@{{B.c}} @{{bad"}"#),
            vec!["A".to_string(), "B.c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_prepare_skips_lookup_when_disabled() {
        let store = crate::repository::MemoryStore::new();
        store
            .seed(|s| {
                s.variables
                    .push(var("REPLICAS", json!(2), VariableScope::default()))
            })
            .await;
        let templates = vec![r#"{"r":"@{{REPLICAS}}"}"#.to_string()];

        let enabled = VariableResolver::new(Arc::new(store.clone()), true);
        let vars = enabled.prepare(&scope(), &templates).await.unwrap();
        assert_eq!(
            vars.resolve_json(&templates[0], false).unwrap().value,
            r#"{"r":2}"#
        );

        let disabled = VariableResolver::new(Arc::new(store), false);
        let vars = disabled.prepare(&scope(), &templates).await.unwrap();
        assert_eq!(
            vars.resolve_json(&templates[0], false).unwrap().value,
            templates[0]
        );
    }
}
