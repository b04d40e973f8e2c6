//! Valkey/Redis connector. The native channel speaks RESP commands;
//! `INFO` sections are parsed into attribute rows, and replication info
//! drives topology discovery.

use std::collections::BTreeMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    unsupported_operation, Capabilities, ConnectionState, Connector, ConnectorError, Technology,
};
use crate::cli::settings::Settings;
use crate::engine::operation::{OperationKind, OperationRequest, OperationResult, Row};
use crate::engine::topology::{
    map_ssh_hosts_to_nodes, NodeIdentity, NodeRole, NodeState, Topology,
};
use crate::infrastructure::cloud::CloudProbes;
use crate::infrastructure::shell::ShellExecutor;
use crate::infrastructure::ssh::SshPool;
use crate::report::formatter;

pub struct ValkeyConnector {
    settings: Settings,
    state: ConnectionState,
    connection: Option<Mutex<ConnectionManager>>,
    capabilities: Capabilities,
    topology: Topology,
    version: Option<String>,
    ssh: Option<SshPool>,
    cloud: Option<CloudProbes>,
    shell: ShellExecutor,
}

impl ValkeyConnector {
    pub fn new(settings: Settings) -> Self {
        let shell = ShellExecutor::new(settings.allow_unsafe_commands);
        Self {
            settings,
            state: ConnectionState::Disconnected,
            connection: None,
            capabilities: Capabilities::default(),
            topology: Topology::new(),
            version: None,
            ssh: None,
            cloud: None,
            shell,
        }
    }

    /// Credentials go in as fields, never into a URL, so passwords with
    /// reserved characters survive intact.
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.settings.host.clone(), self.settings.port),
            redis: RedisConnectionInfo {
                password: (!self.settings.password.is_empty())
                    .then(|| self.settings.password.clone()),
                username: (!self.settings.user.is_empty())
                    .then(|| self.settings.user.clone()),
                ..RedisConnectionInfo::default()
            },
        }
    }

    async fn raw_command(&self, command: &str) -> Result<String, String> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| ConnectorError::NotConnected.to_string())?;
        let mut tokens = command.split_whitespace();
        let Some(name) = tokens.next() else {
            return Err("empty command".to_string());
        };
        let mut cmd = redis::cmd(name);
        for token in tokens {
            cmd.arg(token);
        }
        let mut guard = connection.lock().await;
        let value: redis::Value = cmd
            .query_async(&mut *guard)
            .await
            .map_err(|e| e.to_string())?;
        Ok(render_redis_value(&value))
    }

    async fn discover_topology(&mut self) {
        let mut topology = Topology::new();
        let primary_id = format!("{}:{}", self.settings.host, self.settings.port);

        let replication = match self.raw_command("INFO replication").await {
            Ok(body) => body,
            Err(e) => {
                warn!("INFO replication failed: {}", e);
                topology.insert(
                    NodeIdentity::instance(primary_id.clone(), self.settings.host.clone())
                        .with_port(self.settings.port)
                        .with_role(NodeRole::Writer),
                );
                self.topology = topology;
                return;
            }
        };

        let fields = parse_info_section(&replication);
        let role = match fields.get("role").and_then(|v| v.as_str()) {
            Some("master") => NodeRole::Writer,
            Some("slave") => NodeRole::Reader,
            _ => NodeRole::Unknown,
        };
        topology.insert(
            NodeIdentity::instance(primary_id, self.settings.host.clone())
                .with_port(self.settings.port)
                .with_role(role),
        );

        // slaveN lines look like: ip=10.0.1.12,port=6379,state=online,...
        for (key, value) in &fields {
            if !key.starts_with("slave") || !key[5..].chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let Some(raw) = value.as_str() else { continue };
            let mut ip = None;
            let mut port = None;
            let mut state = None;
            for pair in raw.split(',') {
                match pair.split_once('=') {
                    Some(("ip", v)) => ip = Some(v.to_string()),
                    Some(("port", v)) => port = v.parse::<u16>().ok(),
                    Some(("state", v)) => state = Some(v.to_string()),
                    _ => {}
                }
            }
            if let Some(ip) = ip {
                let id = format!("{}:{}", ip, port.unwrap_or(self.settings.port));
                let mut node = NodeIdentity::instance(id, ip)
                    .with_role(NodeRole::Reader)
                    .with_state(match state.as_deref() {
                        Some("online") => NodeState::Active,
                        _ => NodeState::Down,
                    });
                node.port = port;
                topology.insert(node);
            }
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
}

/// Parses `INFO` output (`key:value` lines, `#` section headers) into an
/// attribute row. Numeric values become numbers.
pub fn parse_info_section(body: &str) -> Row {
    let mut row = Row::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        let parsed = if let Ok(i) = value.parse::<i64>() {
            json!(i)
        } else if let Ok(f) = value.parse::<f64>() {
            json!(f)
        } else {
            json!(value)
        };
        row.insert(key.trim().to_string(), parsed);
    }
    row
}

fn render_redis_value(value: &redis::Value) -> String {
    match value {
        redis::Value::Nil => String::new(),
        redis::Value::Int(i) => i.to_string(),
        redis::Value::SimpleString(s) => s.clone(),
        redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes).to_string(),
        redis::Value::Array(items) => items
            .iter()
            .map(render_redis_value)
            .collect::<Vec<_>>()
            .join("\n"),
        other => format!("{other:?}"),
    }
}

#[async_trait]
impl Connector for ValkeyConnector {
    fn technology(&self) -> Technology {
        Technology::Valkey
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        self.state = ConnectionState::Connecting;
        let info = self.connection_info();
        let target = format!("{}:{}", self.settings.host, self.settings.port);

        let client = redis::Client::open(info).map_err(|e| {
            self.state = ConnectionState::Disconnected;
            ConnectorError::Connection {
                technology: "valkey",
                target: target.clone(),
                reason: e.to_string(),
            }
        })?;
        let manager = ConnectionManager::new(client).await.map_err(|e| {
            self.state = ConnectionState::Disconnected;
            ConnectorError::Connection {
                technology: "valkey",
                target: target.clone(),
                reason: e.to_string(),
            }
        })?;
        self.connection = Some(Mutex::new(manager));

        if let Ok(body) = self.raw_command("INFO server").await {
            let fields = parse_info_section(&body);
            self.version = fields
                .get("valkey_version")
                .or_else(|| fields.get("redis_version"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
        }

        self.open_auxiliary_channels().await;
        self.discover_topology().await;
        if let Some(pool) = self.ssh.as_mut() {
            let hosts = pool.hosts();
            let mapping = map_ssh_hosts_to_nodes(&hosts, &self.topology, None);
            pool.set_node_mapping(mapping);
        }

        self.state = ConnectionState::Connected;
        info!(
            "valkey connector ready: version {}, {} node(s)",
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
        self.connection = None;
        if let Some(pool) = &self.ssh {
            pool.close_all();
        }
        self.cloud = None;
        self.state = ConnectionState::Disconnected;
        info!("valkey connector disconnected");
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
            OperationKind::Native => match self.raw_command(&op.command).await {
                Ok(body) => {
                    if op.command.to_uppercase().starts_with("INFO") {
                        let row = parse_info_section(&body);
                        let rendered = formatter::render_attributes(&row);
                        OperationResult::from_rows_rendered(vec![row], rendered)
                    } else {
                        let mut row = Row::new();
                        row.insert("command".into(), json!(op.command));
                        row.insert("output".into(), json!(body));
                        OperationResult::from_rows_rendered(
                            vec![row],
                            formatter::render_literal(&body),
                        )
                    }
                }
                Err(e) => OperationResult::from_error(e, Some(op.command.clone())),
            },
            OperationKind::Shell => match &self.ssh {
                Some(pool) => self.shell.run_shell(pool, &op.command).await,
                None => OperationResult::from_error(
                    "SSH not configured",
                    Some(op.command.clone()),
                ),
            },
            kind => unsupported_operation(Technology::Valkey, kind),
        }
    }

    async fn execute_operation_all_nodes(
        &self,
        op: &OperationRequest,
    ) -> BTreeMap<String, OperationResult> {
        let mut results = BTreeMap::new();
        match op.kind {
            OperationKind::Shell => {
                if let Some(pool) = &self.ssh {
                    for entry in pool.execute_all(&op.command).await {
                        let result = if entry.success {
                            self.shell.parse_shell_stdout(
                                &op.command,
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
                    .writer()
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
    fn test_parse_info_section_types() {
        let body = "\
# Memory
used_memory:1048576
used_memory_human:1.00M
mem_fragmentation_ratio:1.08
";
        let row = parse_info_section(body);
        assert_eq!(row["used_memory"], json!(1048576));
        assert_eq!(row["mem_fragmentation_ratio"], json!(1.08));
        assert_eq!(row["used_memory_human"], json!("1.00M"));
        assert!(row.get("# Memory").is_none());
    }

    #[test]
    fn test_connection_info_keeps_reserved_characters_in_password() {
        let mut settings = Settings::for_tests(Technology::Valkey);
        settings.host = "cache-1.internal".to_string();
        settings.port = 6379;
        settings.user = String::new();
        settings.password = "p@ss:w/ord%100".to_string();

        let info = ValkeyConnector::new(settings).connection_info();
        assert!(matches!(
            &info.addr,
            ConnectionAddr::Tcp(host, 6379) if host == "cache-1.internal"
        ));
        assert_eq!(info.redis.password.as_deref(), Some("p@ss:w/ord%100"));
        assert!(info.redis.username.is_none(), "empty user must not become an ACL login");
    }

    #[test]
    fn test_connection_info_omits_absent_password() {
        let connector = ValkeyConnector::new(Settings::for_tests(Technology::Valkey));
        assert!(connector.connection_info().redis.password.is_none());
    }

    #[test]
    fn test_parse_replication_slaves() {
        let body = "\
role:master
connected_slaves:2
slave0:ip=10.0.1.12,port=6379,state=online,offset=100,lag=0
slave1:ip=10.0.1.13,port=6379,state=wait_bgsave,offset=90,lag=1
";
        let row = parse_info_section(body);
        assert_eq!(row["role"], json!("master"));
        assert_eq!(row["connected_slaves"], json!(2));
        assert!(row["slave0"].as_str().unwrap().contains("state=online"));
    }
}
