//! Environment classification: managed service, HA control plane, or
//! self-hosted. Individual signals contribute weighted confidence; a class
//! is assigned only when its score passes the threshold.

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Aurora,
    Rds,
    Patroni,
    ManagedService,
    SelfHosted,
}

impl EnvironmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentKind::Aurora => "aurora",
            EnvironmentKind::Rds => "rds",
            EnvironmentKind::Patroni => "patroni",
            EnvironmentKind::ManagedService => "managed_service",
            EnvironmentKind::SelfHosted => "self_hosted",
        }
    }

    pub fn from_override(raw: &str) -> Option<Self> {
        match raw {
            "aurora" => Some(EnvironmentKind::Aurora),
            "rds" => Some(EnvironmentKind::Rds),
            "patroni" => Some(EnvironmentKind::Patroni),
            "managed_service" => Some(EnvironmentKind::ManagedService),
            "self_hosted" | "bare_metal" => Some(EnvironmentKind::SelfHosted),
            _ => None,
        }
    }
}

/// Accumulates weighted detection signals for one candidate environment.
#[derive(Debug, Default)]
pub struct SignalScore {
    score: u32,
    signals: Vec<&'static str>,
    details: Map<String, Value>,
}

impl SignalScore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, signal: &'static str, weight: u32) {
        self.score += weight;
        self.signals.push(signal);
    }

    pub fn add_detail(&mut self, key: &str, value: Value) {
        self.details.insert(key.to_string(), value);
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn passes(&self, threshold: u32) -> bool {
        self.score >= threshold
    }

    pub fn into_detection(self, kind: EnvironmentKind) -> EnvironmentDetection {
        EnvironmentDetection {
            kind,
            confidence: self.score,
            signals: self.signals.iter().map(|s| s.to_string()).collect(),
            details: self.details,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentDetection {
    pub kind: EnvironmentKind,
    pub confidence: u32,
    pub signals: Vec<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl EnvironmentDetection {
    pub fn self_hosted() -> Self {
        Self {
            kind: EnvironmentKind::SelfHosted,
            confidence: 0,
            signals: vec!["default".to_string()],
            details: Map::new(),
        }
    }

    pub fn overridden(kind: EnvironmentKind) -> Self {
        Self {
            kind,
            confidence: 100,
            signals: vec!["explicit_override".to_string()],
            details: Map::new(),
        }
    }

    pub fn is_managed(&self) -> bool {
        matches!(
            self.kind,
            EnvironmentKind::Aurora | EnvironmentKind::Rds | EnvironmentKind::ManagedService
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_threshold_gates_classification() {
        let mut score = SignalScore::new();
        score.add("version_string", 40);
        assert!(score.passes(40));
        assert!(!score.passes(41));
    }

    #[test]
    fn test_detection_carries_signals_and_details() {
        let mut score = SignalScore::new();
        score.add("replication_slots", 30);
        score.add("rest_api", 35);
        score.add_detail("patroni_node_role", json!("replica"));
        let detection = score.into_detection(EnvironmentKind::Patroni);
        assert_eq!(detection.confidence, 65);
        assert_eq!(detection.signals, ["replication_slots", "rest_api"]);
        assert!(!detection.is_managed());
    }

    #[test]
    fn test_override_parsing() {
        assert_eq!(
            EnvironmentKind::from_override("bare_metal"),
            Some(EnvironmentKind::SelfHosted)
        );
        assert_eq!(EnvironmentKind::from_override("nonsense"), None);
    }
}
