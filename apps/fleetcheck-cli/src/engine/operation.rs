//! Operation request/result types: the one contract through which checks
//! reach a technology backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::report::formatter;

/// Ordered row map. Key order is column order and is significant.
pub type Row = serde_json::Map<String, Value>;

/// How an operation payload is to be interpreted by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Query against the primary native session (SQL, CQL, Redis command).
    Native,
    /// Backend-specific admin RPC (Kafka Admin API, driver metadata).
    Admin,
    /// Shell command on the primary SSH host.
    Shell,
    /// `nodetool <command>` on the primary SSH host.
    Nodetool,
    /// `nodetool <command>` fanned out across every SSH host.
    NodetoolCluster,
    /// Managed-service HTTP endpoint.
    HttpApi,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Native => "native",
            OperationKind::Admin => "admin",
            OperationKind::Shell => "shell",
            OperationKind::Nodetool => "nodetool",
            OperationKind::NodetoolCluster => "nodetool_cluster",
            OperationKind::HttpApi => "http_api",
        }
    }
}

/// A single operation bound for a connector. The `command` payload is
/// opaque to the engine; each connector interprets it for its kind.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub command: String,
    /// Bound parameters for native queries, positionally applied.
    pub params: Vec<Value>,
    /// Whether structured rows are wanted alongside the rendered form.
    pub return_raw: bool,
}

impl OperationRequest {
    pub fn native(command: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Native,
            command: command.into(),
            params: Vec::new(),
            return_raw: true,
        }
    }

    pub fn native_with_params(command: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            params,
            ..Self::native(command)
        }
    }

    /// Admin payloads are small JSON maps with an `operation` tag,
    /// serialized into the opaque command field.
    pub fn admin(payload: Value) -> Self {
        Self {
            kind: OperationKind::Admin,
            command: payload.to_string(),
            params: Vec::new(),
            return_raw: true,
        }
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Shell,
            command: command.into(),
            params: Vec::new(),
            return_raw: true,
        }
    }

    pub fn nodetool(command: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Nodetool,
            command: command.into(),
            params: Vec::new(),
            return_raw: true,
        }
    }

    pub fn nodetool_cluster(command: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::NodetoolCluster,
            command: command.into(),
            params: Vec::new(),
            return_raw: true,
        }
    }

    pub fn http_api(command: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::HttpApi,
            command: command.into(),
            params: Vec::new(),
            return_raw: true,
        }
    }
}

/// Error record for a failed operation. Failures are data, not panics:
/// the calling check decides whether this becomes a finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationFailure {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Exactly one of rows or failure is populated on a completed call,
/// enforced by construction.
#[derive(Debug, Clone)]
pub enum OperationOutcome {
    Rows(Vec<Row>),
    Failure(OperationFailure),
}

#[derive(Debug, Clone)]
pub struct OperationResult {
    /// Report-fragment form, produced by the formatter, never ad hoc.
    pub rendered: String,
    pub outcome: OperationOutcome,
}

impl OperationResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            rendered: formatter::render_rows(&rows),
            outcome: OperationOutcome::Rows(rows),
        }
    }

    /// Rows with a caller-supplied rendering (e.g. attribute maps or
    /// pre-parsed tool output).
    pub fn from_rows_rendered(rows: Vec<Row>, rendered: String) -> Self {
        Self {
            rendered,
            outcome: OperationOutcome::Rows(rows),
        }
    }

    pub fn from_error(error: impl Into<String>, context: Option<String>) -> Self {
        let failure = OperationFailure {
            error: error.into(),
            context,
        };
        Self {
            rendered: formatter::render_error(&failure.error),
            outcome: OperationOutcome::Failure(failure),
        }
    }

    pub fn rows(&self) -> Option<&[Row]> {
        match &self.outcome {
            OperationOutcome::Rows(rows) => Some(rows),
            OperationOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&OperationFailure> {
        match &self.outcome {
            OperationOutcome::Rows(_) => None,
            OperationOutcome::Failure(f) => Some(f),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, OperationOutcome::Failure(_))
    }

    /// First value of the named column across rows, for scalar queries.
    pub fn scalar(&self, column: &str) -> Option<&Value> {
        self.rows()?.first()?.get(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_is_rows_xor_failure() {
        let ok = OperationResult::from_rows(vec![Row::new()]);
        assert!(ok.rows().is_some());
        assert!(ok.failure().is_none());

        let err = OperationResult::from_error("query failed", Some("SELECT 1".into()));
        assert!(err.rows().is_none());
        assert_eq!(err.failure().unwrap().error, "query failed");
        assert!(err.rendered.starts_with("[ERROR]"));
    }

    #[test]
    fn test_admin_payload_round_trips() {
        let op = OperationRequest::admin(json!({"operation": "list_topics"}));
        let parsed: Value = serde_json::from_str(&op.command).unwrap();
        assert_eq!(parsed["operation"], "list_topics");
        assert_eq!(op.kind, OperationKind::Admin);
    }

    #[test]
    fn test_scalar_reads_first_row() {
        let mut row = Row::new();
        row.insert("version".into(), json!("16.3"));
        let res = OperationResult::from_rows(vec![row]);
        assert_eq!(res.scalar("version"), Some(&json!("16.3")));
        assert_eq!(res.scalar("missing"), None);
    }
}
