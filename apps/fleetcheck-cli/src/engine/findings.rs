//! Finding envelopes and the in-run accumulator.
//!
//! Every check emits exactly one envelope. The accumulator preserves
//! insertion order (later checks read earlier findings, the trend writer
//! persists them in the same order) and treats overwrites as an engine
//! programming error.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::EngineError;
use crate::utilities::json::canonicalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Success,
    Warning,
    Critical,
    Error,
    Skipped,
    Unavailable,
    NotApplicable,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Success => "success",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
            CheckStatus::Error => "error",
            CheckStatus::Skipped => "skipped",
            CheckStatus::Unavailable => "unavailable",
            CheckStatus::NotApplicable => "not_applicable",
        }
    }
}

pub const SEVERITY_HEALTHY: u8 = 0;
pub const SEVERITY_WARNING: u8 = 7;
pub const SEVERITY_CRITICAL: u8 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindingMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_method: Option<String>,
    pub timestamp_utc: String,
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub source_versions: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindingEnvelope {
    pub status: CheckStatus,
    pub severity: u8,
    pub message: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required_settings: Vec<String>,
    pub metadata: FindingMetadata,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl FindingEnvelope {
    fn base(status: CheckStatus, severity: u8, message: impl Into<String>) -> Self {
        Self {
            status,
            severity: severity.min(SEVERITY_CRITICAL),
            message: message.into(),
            data: Value::Object(Map::new()),
            error_message: None,
            reason: None,
            required_settings: Vec::new(),
            metadata: FindingMetadata {
                collection_method: None,
                timestamp_utc: now_iso(),
                source_versions: Map::new(),
                node_count: None,
            },
        }
    }

    pub fn success(message: impl Into<String>, data: Value) -> Self {
        let mut env = Self::base(CheckStatus::Success, SEVERITY_HEALTHY, message);
        env.data = canonicalize(&data);
        env
    }

    pub fn warning(severity: u8, message: impl Into<String>, data: Value) -> Self {
        let mut env = Self::base(CheckStatus::Warning, severity, message);
        env.data = canonicalize(&data);
        env
    }

    pub fn critical(severity: u8, message: impl Into<String>, data: Value) -> Self {
        let mut env = Self::base(CheckStatus::Critical, severity, message);
        env.data = canonicalize(&data);
        env
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let mut env = Self::base(CheckStatus::Error, SEVERITY_HEALTHY, message.clone());
        env.error_message = Some(message);
        env
    }

    pub fn skipped(reason: impl Into<String>, required_settings: &[&str]) -> Self {
        let reason = reason.into();
        let mut env = Self::base(CheckStatus::Skipped, SEVERITY_HEALTHY, reason.clone());
        env.reason = Some(reason);
        env.required_settings = required_settings.iter().map(|s| s.to_string()).collect();
        env
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut env = Self::base(CheckStatus::Unavailable, SEVERITY_HEALTHY, reason.clone());
        env.reason = Some(reason);
        env
    }

    pub fn not_applicable(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut env = Self::base(CheckStatus::NotApplicable, SEVERITY_HEALTHY, reason.clone());
        env.reason = Some(reason);
        env
    }

    pub fn with_collection_method(mut self, method: impl Into<String>) -> Self {
        self.metadata.collection_method = Some(method.into());
        self
    }

    pub fn with_node_count(mut self, count: usize) -> Self {
        self.metadata.node_count = Some(count);
        self
    }

    pub fn with_source_version(mut self, source: &str, version: &str) -> Self {
        self.metadata
            .source_versions
            .insert(source.to_string(), Value::String(version.to_string()));
        self
    }

    /// Envelope invariants: error requires an error message, skipped
    /// requires a reason, and outcome statuses require non-empty data.
    pub fn validate(&self, check_name: &str) -> Result<(), EngineError> {
        let violation = match self.status {
            CheckStatus::Error if self.error_message.is_none() => {
                Some("status=error requires error_message")
            }
            CheckStatus::Skipped if self.reason.is_none() => {
                Some("status=skipped requires reason")
            }
            CheckStatus::Success | CheckStatus::Warning | CheckStatus::Critical
                if self.data.as_object().is_some_and(Map::is_empty) =>
            {
                Some("outcome statuses require non-empty data")
            }
            _ => None,
        };
        match violation {
            Some(rule) => Err(EngineError::InvalidFinding {
                check: check_name.to_string(),
                rule: rule.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Insertion-ordered map of check name to envelope for the in-progress run.
#[derive(Debug, Default)]
pub struct FindingAccumulator {
    entries: Vec<(String, FindingEnvelope)>,
}

impl FindingAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, check_name: &str, envelope: FindingEnvelope) -> Result<(), EngineError> {
        if self.get(check_name).is_some() {
            return Err(EngineError::DuplicateFinding {
                check: check_name.to_string(),
            });
        }
        self.entries.push((check_name.to_string(), envelope));
        Ok(())
    }

    pub fn get(&self, check_name: &str) -> Option<&FindingEnvelope> {
        self.entries
            .iter()
            .find(|(name, _)| name == check_name)
            .map(|(_, env)| env)
    }

    pub fn all(&self) -> impl Iterator<Item = (&str, &FindingEnvelope)> {
        self.entries.iter().map(|(n, e)| (n.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_with_status(&self, status: CheckStatus) -> usize {
        self.entries.iter().filter(|(_, e)| e.status == status).count()
    }

    /// Canonical tree form for on-disk persistence and the trend writer.
    pub fn to_tree(&self) -> Value {
        let mut root = Map::new();
        for (name, env) in &self.entries {
            root.insert(
                name.clone(),
                serde_json::to_value(env).unwrap_or(Value::Null),
            );
        }
        Value::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_invariants() {
        let ok = FindingEnvelope::success("all good", json!({"count": 1}));
        assert!(ok.validate("x").is_ok());

        let empty_data = FindingEnvelope::success("all good", json!({}));
        assert!(
            empty_data.validate("x").is_err(),
            "success with empty data violates the envelope contract"
        );

        let err = FindingEnvelope::error("boom");
        assert!(err.validate("x").is_ok());
        assert_eq!(err.error_message.as_deref(), Some("boom"));

        let skip = FindingEnvelope::skipped("SSH not configured", &["ssh_host or ssh_hosts"]);
        assert!(skip.validate("x").is_ok());
        assert_eq!(skip.reason.as_deref(), Some("SSH not configured"));
    }

    #[test]
    fn test_severity_clamped() {
        let env = FindingEnvelope::critical(99, "bad", json!({"n": 1}));
        assert_eq!(env.severity, SEVERITY_CRITICAL);
    }

    #[test]
    fn test_accumulator_preserves_order_and_detects_overwrite() {
        let mut acc = FindingAccumulator::new();
        acc.set("b_check", FindingEnvelope::success("ok", json!({"v": 1})))
            .unwrap();
        acc.set("a_check", FindingEnvelope::success("ok", json!({"v": 2})))
            .unwrap();

        let names: Vec<&str> = acc.all().map(|(n, _)| n).collect();
        assert_eq!(names, ["b_check", "a_check"], "insertion order, not sorted");

        let dup = acc.set("b_check", FindingEnvelope::error("again"));
        assert!(matches!(dup, Err(EngineError::DuplicateFinding { .. })));
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn test_tree_form_keys_follow_insertion_order() {
        let mut acc = FindingAccumulator::new();
        acc.set("z", FindingEnvelope::success("ok", json!({"v": 1}))).unwrap();
        acc.set("a", FindingEnvelope::success("ok", json!({"v": 2}))).unwrap();
        let tree = acc.to_tree();
        let keys: Vec<&String> = tree.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["z", "a"]);
    }
}
