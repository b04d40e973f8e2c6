//! Cassandra connector: CQL over the native driver, topology from the
//! driver's own cluster metadata (contact-point system-table queries can
//! produce inconsistent snapshots under round-robin), and nodetool/shell
//! routing for everything the wire protocol does not expose.

use std::collections::BTreeMap;

use async_trait::async_trait;
use scylla::frame::response::result::CqlValue;
use scylla::{Session, SessionBuilder};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{
    unsupported_operation, Capabilities, ConnectionState, Connector, ConnectorError, Technology,
};
use crate::cli::settings::Settings;
use crate::engine::operation::{OperationKind, OperationRequest, OperationResult, Row};
use crate::engine::topology::{
    map_ssh_hosts_to_nodes, NodeIdentity, NodeRole, Topology,
};
use crate::infrastructure::cloud::CloudProbes;
use crate::infrastructure::shell::ShellExecutor;
use crate::infrastructure::ssh::SshPool;

pub struct CassandraConnector {
    settings: Settings,
    state: ConnectionState,
    session: Option<Session>,
    capabilities: Capabilities,
    topology: Topology,
    version: Option<String>,
    ssh: Option<SshPool>,
    cloud: Option<CloudProbes>,
    shell: ShellExecutor,
}

impl CassandraConnector {
    pub fn new(settings: Settings) -> Self {
        let shell = ShellExecutor::new(settings.allow_unsafe_commands);
        Self {
            settings,
            state: ConnectionState::Disconnected,
            session: None,
            capabilities: Capabilities::default(),
            topology: Topology::new(),
            version: None,
            ssh: None,
            cloud: None,
            shell,
        }
    }

    async fn run_cql(&self, query: &str) -> Result<Vec<Row>, String> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| ConnectorError::NotConnected.to_string())?;
        let result = session
            .query_unpaged(query, ())
            .await
            .map_err(|e| e.to_string())?;

        let column_names: Vec<String> = result
            .col_specs()
            .iter()
            .map(|spec| spec.name.clone())
            .collect();
        let rows = result.rows.unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut out = Row::new();
                for (index, column) in row.columns.into_iter().enumerate() {
                    let name = column_names
                        .get(index)
                        .cloned()
                        .unwrap_or_else(|| format!("column_{index}"));
                    out.insert(name, cql_value_to_json(column));
                }
                out
            })
            .collect())
    }

    /// Driver metadata is the source of truth for membership; the driver
    /// already maintains a consistent cluster view.
    fn discover_topology(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let mut topology = Topology::new();
        let cluster_data = session.get_cluster_data();
        for node in cluster_data.get_nodes_info() {
            let address = node.address.ip().to_string();
            let mut identity = NodeIdentity::instance(address.clone(), address)
                .with_role(NodeRole::Unknown)
                .with_metadata("host_id", node.host_id.to_string());
            if let Some(datacenter) = &node.datacenter {
                identity = identity.with_metadata("datacenter", datacenter.clone());
            }
            if let Some(rack) = &node.rack {
                identity = identity.with_metadata("rack", rack.clone());
            }
            topology.insert(identity);
        }

        if topology.is_empty() {
            warn!("driver metadata empty; falling back to the contact point");
            topology.insert(
                NodeIdentity::instance(self.settings.host.clone(), self.settings.host.clone())
                    .with_port(self.settings.port)
                    .with_role(NodeRole::Unknown),
            );
        }
        self.topology = topology;
    }

    async fn open_auxiliary_channels(&mut self) {
        if let Some(config) = self.settings.ssh_pool_config() {
            let pool = SshPool::initialize(config);
            let connected = pool.connect_all().await;
            info!(
                "SSH: {}/{} host(s) connected",
                connected.len(),
                pool.hosts().len()
            );
            self.ssh = Some(pool);
            self.capabilities.has_ssh_support = true;
        }
        let probes = CloudProbes::initialize(&self.settings.cloud_config()).await;
        if probes.has_any() {
            self.capabilities.has_cloud_metrics = true;
            self.cloud = Some(probes);
        }
    }

    async fn nodetool_on_primary(&self, command: &str) -> OperationResult {
        match &self.ssh {
            Some(pool) => self.shell.run_nodetool(pool, command).await,
            None => OperationResult::from_error(
                "nodetool operations require SSH access",
                Some(command.to_string()),
            ),
        }
    }
}

fn cql_value_to_json(value: Option<CqlValue>) -> Value {
    let Some(value) = value else {
        return Value::Null;
    };
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => json!(s),
        CqlValue::Boolean(b) => json!(b),
        CqlValue::Int(i) => json!(i),
        CqlValue::BigInt(i) => json!(i),
        CqlValue::SmallInt(i) => json!(i),
        CqlValue::TinyInt(i) => json!(i),
        CqlValue::Double(f) => json!(f),
        CqlValue::Float(f) => json!(f),
        CqlValue::Counter(c) => json!(c.0),
        CqlValue::Uuid(u) => json!(u.to_string()),
        CqlValue::Inet(addr) => json!(addr.to_string()),
        CqlValue::List(items) => {
            Value::Array(items.into_iter().map(|v| cql_value_to_json(Some(v))).collect())
        }
        CqlValue::Set(items) => {
            Value::Array(items.into_iter().map(|v| cql_value_to_json(Some(v))).collect())
        }
        other => json!(format!("{other:?}")),
    }
}

#[async_trait]
impl Connector for CassandraConnector {
    fn technology(&self) -> Technology {
        Technology::Cassandra
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        self.state = ConnectionState::Connecting;
        let node = format!("{}:{}", self.settings.host, self.settings.port);

        let mut builder = SessionBuilder::new().known_node(&node);
        if !self.settings.user.is_empty() {
            builder = builder.user(&self.settings.user, &self.settings.password);
        }
        let session = builder.build().await.map_err(|e| {
            self.state = ConnectionState::Disconnected;
            ConnectorError::Connection {
                technology: "cassandra",
                target: node.clone(),
                reason: e.to_string(),
            }
        })?;
        self.session = Some(session);

        match self
            .run_cql("SELECT release_version, cluster_name FROM system.local")
            .await
        {
            Ok(rows) => {
                self.version = rows
                    .first()
                    .and_then(|row| row.get("release_version"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            Err(e) => warn!("system.local query failed: {}", e),
        }

        self.open_auxiliary_channels().await;
        self.discover_topology();
        if let Some(pool) = self.ssh.as_mut() {
            let hosts = pool.hosts();
            let mapping = map_ssh_hosts_to_nodes(&hosts, &self.topology, None);
            pool.set_node_mapping(mapping);
        }

        self.state = ConnectionState::Connected;
        info!(
            "cassandra connector ready: version {}, {} node(s)",
            self.version.as_deref().unwrap_or("unknown"),
            self.topology.nodes().len()
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnecting;
        self.session = None;
        if let Some(pool) = &self.ssh {
            pool.close_all();
        }
        self.cloud = None;
        self.state = ConnectionState::Disconnected;
        info!("cassandra connector disconnected");
    }

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
        self.ssh.as_ref()
    }

    fn cloud(&self) -> Option<&CloudProbes> {
        self.cloud.as_ref()
    }

    async fn execute_operation(&self, op: &OperationRequest) -> OperationResult {
        match op.kind {
            OperationKind::Native => match self.run_cql(&op.command).await {
                Ok(rows) => OperationResult::from_rows(rows),
                Err(e) => OperationResult::from_error(
                    format!("Query failed: {e}"),
                    Some(op.command.clone()),
                ),
            },
            OperationKind::Nodetool => self.nodetool_on_primary(&op.command).await,
            OperationKind::NodetoolCluster => match &self.ssh {
                Some(pool) => {
                    let per_node = self.shell.run_nodetool_cluster(pool, &op.command).await;
                    let mut fragments = Vec::new();
                    let mut rows = Vec::new();
                    for (node_id, result) in per_node {
                        fragments.push(format!("Node {node_id}:\n{}", result.rendered));
                        if let Some(node_rows) = result.rows() {
                            for row in node_rows {
                                let mut tagged = Row::new();
                                tagged.insert("node_id".into(), json!(node_id));
                                tagged.extend(row.clone());
                                rows.push(tagged);
                            }
                        } else if let Some(failure) = result.failure() {
                            let mut tagged = Row::new();
                            tagged.insert("node_id".into(), json!(node_id));
                            tagged.insert("error".into(), json!(failure.error));
                            rows.push(tagged);
                        }
                    }
                    OperationResult::from_rows_rendered(rows, fragments.join("\n\n"))
                }
                None => OperationResult::from_error(
                    "nodetool operations require SSH access",
                    Some(op.command.clone()),
                ),
            },
            OperationKind::Shell => match &self.ssh {
                Some(pool) => self.shell.run_shell(pool, &op.command).await,
                None => OperationResult::from_error(
                    "SSH not configured",
                    Some(op.command.clone()),
                ),
            },
            kind => unsupported_operation(Technology::Cassandra, kind),
        }
    }

    async fn execute_operation_all_nodes(
        &self,
        op: &OperationRequest,
    ) -> BTreeMap<String, OperationResult> {
        let mut results = BTreeMap::new();
        match op.kind {
            OperationKind::Shell | OperationKind::Nodetool | OperationKind::NodetoolCluster => {
                if let Some(pool) = &self.ssh {
                    let command = if matches!(
                        op.kind,
                        OperationKind::Nodetool | OperationKind::NodetoolCluster
                    ) {
                        format!("nodetool {}", op.command)
                    } else {
                        op.command.clone()
                    };
                    for entry in pool.execute_all(&command).await {
                        let result = if entry.success {
                            self.shell.parse_shell_stdout(
                                &command,
                                entry.stdout.as_deref().unwrap_or(""),
                            )
                        } else {
                            OperationResult::from_error(
                                entry.error.unwrap_or_else(|| "command failed".into()),
                                Some(entry.host.clone()),
                            )
                        };
                        results.insert(entry.node_id, result);
                    }
                }
            }
            _ => {
                let key = self
                    .topology
                    .nodes()
                    .first()
                    .map(|n| n.id.clone())
                    .unwrap_or_else(|| "primary".to_string());
                results.insert(key, self.execute_operation(op).await);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cql_value_conversion() {
        assert_eq!(cql_value_to_json(None), Value::Null);
        assert_eq!(cql_value_to_json(Some(CqlValue::Int(42))), json!(42));
        assert_eq!(
            cql_value_to_json(Some(CqlValue::Text("dc1".into()))),
            json!("dc1")
        );
        assert_eq!(
            cql_value_to_json(Some(CqlValue::List(vec![
                CqlValue::Int(1),
                CqlValue::Int(2)
            ]))),
            json!([1, 2])
        );
    }
}
