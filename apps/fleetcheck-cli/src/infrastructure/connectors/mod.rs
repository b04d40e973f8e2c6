//! The per-technology connector contract.
//!
//! A connector is the single channel through which checks reach a backend:
//! one operation-dispatch entry point hiding SQL/CQL/admin-API/shell/HTTP
//! heterogeneity. Capabilities (SSH, cloud) are plain struct fields
//! initialized from settings; a connector without one simply exposes
//! `None` and dependent checks skip.

pub mod cassandra;
pub mod clickhouse;
pub mod kafka;
pub mod postgres;
pub mod valkey;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cli::settings::Settings;
use crate::engine::operation::{OperationKind, OperationRequest, OperationResult};
use crate::engine::topology::Topology;
use crate::infrastructure::cloud::CloudProbes;
use crate::infrastructure::ssh::SshPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    Postgres,
    Kafka,
    Cassandra,
    Clickhouse,
    Valkey,
}

impl Technology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Technology::Postgres => "postgres",
            Technology::Kafka => "kafka",
            Technology::Cassandra => "cassandra",
            Technology::Clickhouse => "clickhouse",
            Technology::Valkey => "valkey",
        }
    }
}

impl std::fmt::Display for Technology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature flags discovered during `connect()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Capabilities {
    pub has_pgstat: bool,
    pub has_io_timing: bool,
    pub is_kraft: bool,
    pub has_ssh_support: bool,
    pub has_cloud_metrics: bool,
}

/// Connection lifecycle. Reconnection is not automatic: a lost primary
/// connection terminates the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectorError {
    #[error("could not connect to {technology} at {target}: {reason}")]
    Connection {
        technology: &'static str,
        target: String,
        reason: String,
    },

    #[error("connector is not connected")]
    NotConnected,

    #[error("operation kind '{kind}' is not supported by the {technology} connector")]
    UnsupportedOperation {
        kind: &'static str,
        technology: &'static str,
    },
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn technology(&self) -> Technology;

    fn state(&self) -> ConnectionState;

    /// Establishes the native connection, discovers version and topology,
    /// opens auxiliary channels, and detects capabilities. Fails only when
    /// the native channel is unreachable; auxiliary-channel failures are
    /// logged and non-fatal.
    async fn connect(&mut self) -> Result<(), ConnectorError>;

    /// Releases native connection, then SSH sessions, then cloud clients.
    /// Idempotent.
    async fn disconnect(&mut self);

    fn capabilities(&self) -> &Capabilities;

    fn topology(&self) -> &Topology;

    fn target_version(&self) -> Option<&str>;

    fn ssh(&self) -> Option<&SshPool>;

    fn cloud(&self) -> Option<&CloudProbes>;

    /// The universal entry point. Single-op failures come back as error
    /// records in the result, never as Err.
    async fn execute_operation(&self, op: &OperationRequest) -> OperationResult;

    /// Fan-out variant: `{node id -> result}` with per-node semantics
    /// identical to `execute_operation`.
    async fn execute_operation_all_nodes(
        &self,
        op: &OperationRequest,
    ) -> BTreeMap<String, OperationResult>;
}

/// Plugin selection: settings name a technology, this returns its
/// connector.
pub fn build_connector(settings: &Settings) -> Box<dyn Connector> {
    match settings.technology {
        Technology::Postgres => Box::new(postgres::PostgresConnector::new(settings.clone())),
        Technology::Kafka => Box::new(kafka::KafkaConnector::new(settings.clone())),
        Technology::Cassandra => Box::new(cassandra::CassandraConnector::new(settings.clone())),
        Technology::Clickhouse => Box::new(clickhouse::ClickhouseConnector::new(settings.clone())),
        Technology::Valkey => Box::new(valkey::ValkeyConnector::new(settings.clone())),
    }
}

/// Standard error result for a kind the connector does not declare.
pub fn unsupported_operation(technology: Technology, kind: OperationKind) -> OperationResult {
    OperationResult::from_error(
        ConnectorError::UnsupportedOperation {
            kind: kind.as_str(),
            technology: technology.as_str(),
        }
        .to_string(),
        None,
    )
}

#[cfg(test)]
pub mod test_support {
    //! A scripted connector for exercising the runner, the metric
    //! collector, and checks without live backends.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::engine::operation::Row;

    pub struct MockConnector {
        pub technology: Technology,
        pub capabilities: Capabilities,
        pub topology: Topology,
        pub version: Option<String>,
        /// command -> scripted result (applies to every operation kind)
        responses: Mutex<BTreeMap<String, OperationResult>>,
        pub executed: Mutex<Vec<String>>,
    }

    impl MockConnector {
        pub fn new(technology: Technology) -> Self {
            Self {
                technology,
                capabilities: Capabilities::default(),
                topology: Topology::new(),
                version: Some("0.0-test".to_string()),
                responses: Mutex::new(BTreeMap::new()),
                executed: Mutex::new(Vec::new()),
            }
        }

        pub fn script(&self, command: &str, result: OperationResult) {
            self.responses
                .lock()
                .unwrap()
                .insert(command.to_string(), result);
        }

        pub fn script_rows(&self, command: &str, rows: Vec<Row>) {
            self.script(command, OperationResult::from_rows(rows));
        }

        pub fn script_error(&self, command: &str, error: &str) {
            self.script(command, OperationResult::from_error(error, None));
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        fn technology(&self) -> Technology {
            self.technology
        }

        fn state(&self) -> ConnectionState {
            ConnectionState::Connected
        }

        async fn connect(&mut self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn disconnect(&mut self) {}

        fn capabilities(&self) -> &Capabilities {
            &self.capabilities
        }

        fn topology(&self) -> &Topology {
            &self.topology
        }

        fn target_version(&self) -> Option<&str> {
            self.version.as_deref()
        }

        fn ssh(&self) -> Option<&SshPool> {
            None
        }

        fn cloud(&self) -> Option<&CloudProbes> {
            None
        }

        async fn execute_operation(&self, op: &OperationRequest) -> OperationResult {
            self.executed.lock().unwrap().push(op.command.clone());
            self.responses
                .lock()
                .unwrap()
                .get(&op.command)
                .cloned()
                .unwrap_or_else(|| {
                    OperationResult::from_error(
                        format!("no scripted response for '{}'", op.command),
                        None,
                    )
                })
        }

        async fn execute_operation_all_nodes(
            &self,
            op: &OperationRequest,
        ) -> BTreeMap<String, OperationResult> {
            let mut out = BTreeMap::new();
            for node in self.topology.instances() {
                out.insert(node.id.clone(), self.execute_operation(op).await);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::operation::Row;
    use serde_json::json;
    use test_support::MockConnector;

    #[tokio::test]
    async fn test_dispatch_totality_on_mock() {
        // Every operation kind yields rendered + rows-or-error, no panic.
        let mock = MockConnector::new(Technology::Kafka);
        mock.script_rows("ok", vec![Row::new()]);
        for op in [
            OperationRequest::native("ok"),
            OperationRequest::admin(json!({"operation": "list_topics"})),
            OperationRequest::shell("free -m"),
            OperationRequest::nodetool("status"),
            OperationRequest::nodetool_cluster("status"),
            OperationRequest::http_api("/metrics"),
        ] {
            let result = mock.execute_operation(&op).await;
            assert!(!result.rendered.is_empty());
            assert!(result.rows().is_some() || result.failure().is_some());
        }
    }

    #[test]
    fn test_technology_parses_from_config_names() {
        let tech: Technology = serde_yaml::from_str("kafka").unwrap();
        assert_eq!(tech, Technology::Kafka);
        assert_eq!(tech.to_string(), "kafka");
    }
}
