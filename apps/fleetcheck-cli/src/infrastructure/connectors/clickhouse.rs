//! ClickHouse connector over the HTTP interface.
//!
//! Queries go out as `POST /?query=...` with basic auth and come back as
//! `FORMAT JSON` documents that map directly onto ordered row maps.
//! Connection establishment retries with exponential backoff since a
//! cold instance can take a while to wake up.

use std::collections::BTreeMap;

use async_recursion::async_recursion;
use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

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

const BACKOFF_START_MILLIS: u64 = 1000;
const MAX_CONNECT_RETRIES: u8 = 5;

struct HttpChannel {
    client: Client<HttpConnector, Full<Bytes>>,
    ssl_client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    host: String,
    port: u16,
    user: String,
    password: String,
    use_ssl: bool,
}

impl HttpChannel {
    fn new(settings: &Settings) -> Self {
        let builder = Client::builder(hyper_util::rt::TokioExecutor::new());
        Self {
            client: builder.build(HttpConnector::new()),
            ssl_client: builder.build(HttpsConnector::new()),
            host: settings.host.clone(),
            port: settings.port,
            user: settings.user.clone(),
            password: settings.password.clone(),
            use_ssl: settings.use_ssl,
        }
    }

    fn auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.user, self.password);
        format!("Basic {}", BASE64_STANDARD.encode(credentials))
    }

    fn host_header(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn uri(&self, path: &str) -> Result<Uri, String> {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.host_header(), path)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| e.to_string())
    }

    #[async_recursion]
    async fn request(
        &self,
        req: Request<Full<Bytes>>,
        retries: u8,
        backoff_millis: u64,
    ) -> Result<Response<hyper::body::Incoming>, String> {
        let res = if self.use_ssl {
            self.ssl_client.request(req.clone()).await
        } else {
            self.client.request(req.clone()).await
        };
        match res {
            Ok(res) => Ok(res),
            Err(e) if e.is_connect() && retries > 0 => {
                sleep(Duration::from_millis(backoff_millis)).await;
                self.request(req, retries - 1, backoff_millis * 2).await
            }
            Err(e) => Err(e.to_string()),
        }
    }

    async fn execute_sql(&self, sql: &str) -> Result<String, String> {
        let query =
            serde_urlencoded::to_string([("query", sql)]).map_err(|e| e.to_string())?;
        let uri = self.uri(&format!("/?{query}"))?;
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Host", self.host_header())
            .header("Authorization", self.auth_header())
            .header("Content-Length", 0)
            .body(Full::new(Bytes::new()))
            .map_err(|e| e.to_string())?;

        let res = self
            .request(req, MAX_CONNECT_RETRIES, BACKOFF_START_MILLIS)
            .await?;
        let status = res.status();
        let body = res
            .collect()
            .await
            .map_err(|e| e.to_string())?
            .to_bytes()
            .to_vec();
        let body = String::from_utf8(body).map_err(|e| e.to_string())?;

        if status != 200 {
            return Err(format!("HTTP {status}: {}", body.trim()));
        }
        debug!("clickhouse query ok: {:.80}", sql);
        Ok(body)
    }
}

pub struct ClickhouseConnector {
    settings: Settings,
    state: ConnectionState,
    channel: Option<HttpChannel>,
    capabilities: Capabilities,
    topology: Topology,
    version: Option<String>,
    ssh: Option<SshPool>,
    cloud: Option<CloudProbes>,
    shell: ShellExecutor,
}

impl ClickhouseConnector {
    pub fn new(settings: Settings) -> Self {
        let shell = ShellExecutor::new(settings.allow_unsafe_commands);
        Self {
            settings,
            state: ConnectionState::Disconnected,
            channel: None,
            capabilities: Capabilities::default(),
            topology: Topology::new(),
            version: None,
            ssh: None,
            cloud: None,
            shell,
        }
    }

    async fn query_json(&self, sql: &str) -> Result<Vec<Row>, String> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| ConnectorError::NotConnected.to_string())?;
        let wants_rows = {
            let head = sql.trim_start().to_uppercase();
            head.starts_with("SELECT") || head.starts_with("SHOW") || head.starts_with("DESCRIBE")
        };
        if !wants_rows {
            let body = channel.execute_sql(sql).await?;
            let mut row = Row::new();
            row.insert("result".into(), Value::String(body.trim().to_string()));
            return Ok(vec![row]);
        }

        let with_format = if sql.to_uppercase().contains("FORMAT JSON") {
            sql.to_string()
        } else {
            format!("{} FORMAT JSON", sql.trim_end_matches(';'))
        };
        let body = channel.execute_sql(&with_format).await?;
        parse_json_rows(&body)
    }

    async fn discover_topology(&mut self) {
        let mut topology = Topology::new();
        match self
            .query_json(
                "SELECT host_name, host_address, port, is_local, cluster
                 FROM system.clusters",
            )
            .await
        {
            Ok(rows) if !rows.is_empty() => {
                for row in rows {
                    let host = row
                        .get("host_address")
                        .and_then(Value::as_str)
                        .or_else(|| row.get("host_name").and_then(Value::as_str))
                        .unwrap_or_default()
                        .to_string();
                    if host.is_empty() {
                        continue;
                    }
                    let name = row
                        .get("host_name")
                        .and_then(Value::as_str)
                        .unwrap_or(&host)
                        .to_string();
                    let mut node = NodeIdentity::instance(name, host).with_role(NodeRole::Unknown);
                    if let Some(cluster) = row.get("cluster").and_then(Value::as_str) {
                        node = node.with_metadata("cluster", cluster);
                    }
                    topology.insert(node);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("system.clusters query failed: {}", e),
        }

        if topology.is_empty() {
            topology.insert(
                NodeIdentity::instance(self.settings.host.clone(), self.settings.host.clone())
                    .with_port(self.settings.port)
                    .with_role(NodeRole::Writer),
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
}

/// Parses a ClickHouse `FORMAT JSON` document into ordered row maps.
pub fn parse_json_rows(body: &str) -> Result<Vec<Row>, String> {
    let document: Value = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let data = document
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing 'data' field in response".to_string())?;
    Ok(data
        .iter()
        .filter_map(|row| row.as_object().cloned())
        .collect())
}

#[async_trait]
impl Connector for ClickhouseConnector {
    fn technology(&self) -> Technology {
        Technology::Clickhouse
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        self.state = ConnectionState::Connecting;
        self.channel = Some(HttpChannel::new(&self.settings));

        let version = self
            .query_json("SELECT version() AS version")
            .await
            .map_err(|reason| {
                self.state = ConnectionState::Disconnected;
                self.channel = None;
                ConnectorError::Connection {
                    technology: "clickhouse",
                    target: format!("{}:{}", self.settings.host, self.settings.port),
                    reason,
                }
            })?;
        self.version = version
            .first()
            .and_then(|row| row.get("version"))
            .and_then(Value::as_str)
            .map(str::to_string);

        self.open_auxiliary_channels().await;
        self.discover_topology().await;
        if let Some(pool) = self.ssh.as_mut() {
            let hosts = pool.hosts();
            let mapping = map_ssh_hosts_to_nodes(&hosts, &self.topology, None);
            pool.set_node_mapping(mapping);
        }

        self.state = ConnectionState::Connected;
        info!(
            "clickhouse connector ready: version {}, {} node(s)",
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
        self.channel = None;
        if let Some(pool) = &self.ssh {
            pool.close_all();
        }
        self.cloud = None;
        self.state = ConnectionState::Disconnected;
        info!("clickhouse connector disconnected");
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
            OperationKind::Native => match self.query_json(&op.command).await {
                Ok(rows) => OperationResult::from_rows(rows),
                Err(e) => OperationResult::from_error(
                    format!("Query failed: {e}"),
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
            kind => unsupported_operation(Technology::Clickhouse, kind),
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
    use serde_json::json;

    #[test]
    fn test_parse_json_rows_keeps_column_order() {
        let body = r#"{
            "meta": [{"name": "partition"}, {"name": "part_count"}],
            "data": [
                {"partition": "202401", "part_count": 120},
                {"partition": "202402", "part_count": 80}
            ],
            "rows": 2
        }"#;
        let rows = parse_json_rows(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["partition"], json!("202401"));
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, ["partition", "part_count"]);
    }

    #[test]
    fn test_parse_json_rows_requires_data_field() {
        assert!(parse_json_rows(r#"{"rows": 0}"#).is_err());
        assert!(parse_json_rows("not json").is_err());
    }
}
