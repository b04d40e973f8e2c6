//! Kafka connector: admin/metadata operations over the wire protocol,
//! broker topology from cluster metadata, KRaft detection, and shell
//! routing for OS-level probes on brokers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, ResourceSpecifier};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{
    unsupported_operation, Capabilities, ConnectionState, Connector, ConnectorError, Technology,
};
use crate::cli::settings::Settings;
use crate::engine::operation::{OperationKind, OperationRequest, OperationResult, Row};
use crate::engine::topology::{map_ssh_hosts_to_nodes, NodeIdentity, NodeRole, Topology};
use crate::infrastructure::cloud::CloudProbes;
use crate::infrastructure::shell::ShellExecutor;
use crate::infrastructure::ssh::SshPool;
use crate::report::formatter;

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
const INTERNAL_TOPIC_PREFIX: &str = "__";

pub struct KafkaConnector {
    settings: Settings,
    state: ConnectionState,
    admin: Option<AdminClient<DefaultClientContext>>,
    consumer: Option<Arc<BaseConsumer>>,
    capabilities: Capabilities,
    topology: Topology,
    version: Option<String>,
    ssh: Option<SshPool>,
    cloud: Option<CloudProbes>,
    shell: ShellExecutor,
}

/// Plain snapshot of cluster metadata, detached from the librdkafka
/// handle so it can cross task boundaries freely.
#[derive(Debug, Clone)]
struct MetadataSnapshot {
    brokers: Vec<(i32, String, i32)>,
    topics: Vec<TopicSnapshot>,
}

#[derive(Debug, Clone)]
struct TopicSnapshot {
    name: String,
    partitions: Vec<PartitionSnapshot>,
}

#[derive(Debug, Clone)]
struct PartitionSnapshot {
    id: i32,
    leader: i32,
    replicas: usize,
    isr: usize,
}

impl KafkaConnector {
    pub fn new(settings: Settings) -> Self {
        let shell = ShellExecutor::new(settings.allow_unsafe_commands);
        Self {
            settings,
            state: ConnectionState::Disconnected,
            admin: None,
            consumer: None,
            capabilities: Capabilities::default(),
            topology: Topology::new(),
            version: None,
            ssh: None,
            cloud: None,
            shell,
        }
    }

    fn bootstrap_servers(&self) -> String {
        match &self.settings.bootstrap_servers {
            Some(servers) if !servers.is_empty() => servers.join(","),
            _ => format!("{}:{}", self.settings.host, self.settings.port),
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.bootstrap_servers())
            .set("client.id", "fleetcheck_client")
            .set("socket.timeout.ms", "30000");
        config
    }

    async fn fetch_metadata_snapshot(&self) -> Result<MetadataSnapshot, String> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| ConnectorError::NotConnected.to_string())?
            .clone();
        tokio::task::spawn_blocking(move || {
            let metadata = consumer
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map_err(|e| e.to_string())?;
            let brokers = metadata
                .brokers()
                .iter()
                .map(|b| (b.id(), b.host().to_string(), b.port()))
                .collect();
            let topics = metadata
                .topics()
                .iter()
                .map(|t| TopicSnapshot {
                    name: t.name().to_string(),
                    partitions: t
                        .partitions()
                        .iter()
                        .map(|p| PartitionSnapshot {
                            id: p.id(),
                            leader: p.leader(),
                            replicas: p.replicas().len(),
                            isr: p.isr().len(),
                        })
                        .collect(),
                })
                .collect();
            Ok(MetadataSnapshot { brokers, topics })
        })
        .await
        .map_err(|e| format!("metadata task failed: {e}"))?
    }

    async fn detect_kraft(&mut self) {
        let Some(broker_id) = self.topology.nodes().first().map(|n| n.id.clone()) else {
            return;
        };
        let Ok(id) = broker_id.parse::<i32>() else {
            return;
        };
        match self.describe_config(ResourceSpecifier::Broker(id)).await {
            Ok(entries) => {
                let roles = entries
                    .iter()
                    .find(|(name, _)| name == "process.roles")
                    .and_then(|(_, value)| value.clone())
                    .unwrap_or_default();
                self.capabilities.is_kraft = !roles.is_empty();
                debug!(
                    "KRaft detection: process.roles='{}' -> {}",
                    roles, self.capabilities.is_kraft
                );
            }
            Err(e) => debug!("KRaft detection unavailable: {}", e),
        }
    }

    async fn describe_config(
        &self,
        spec: ResourceSpecifier<'_>,
    ) -> Result<Vec<(String, Option<String>)>, String> {
        let admin = self
            .admin
            .as_ref()
            .ok_or_else(|| ConnectorError::NotConnected.to_string())?;
        let results = admin
            .describe_configs([&spec], &AdminOptions::new())
            .await
            .map_err(|e| e.to_string())?;
        let resource = results
            .into_iter()
            .next()
            .ok_or_else(|| "empty describe_configs response".to_string())?
            .map_err(|e| e.to_string())?;
        Ok(resource
            .entries
            .into_iter()
            .map(|entry| (entry.name, entry.value))
            .collect())
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

    fn map_hosts(&mut self) {
        if let Some(pool) = self.ssh.as_mut() {
            let hosts = pool.hosts();
            let mapping = map_ssh_hosts_to_nodes(&hosts, &self.topology, None);
            pool.set_node_mapping(mapping);
        }
    }

    async fn run_admin(&self, op: &OperationRequest) -> OperationResult {
        let payload: Value = match serde_json::from_str(&op.command) {
            Ok(v) => v,
            Err(e) => {
                return OperationResult::from_error(
                    format!("Invalid JSON payload: {e}"),
                    Some(op.command.clone()),
                )
            }
        };
        let Some(operation) = payload["operation"].as_str() else {
            return OperationResult::from_error(
                "admin payload requires an 'operation' tag",
                Some(op.command.clone()),
            );
        };

        match operation {
            "list_topics" => self.op_list_topics().await,
            "describe_topics" => {
                let topics: Vec<String> = payload["topics"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                self.op_describe_topics(&topics).await
            }
            "list_consumer_groups" => self.op_list_consumer_groups().await,
            "consumer_lag" => match payload["group_id"].as_str() {
                Some(group) => self.op_consumer_lag(group).await,
                None => OperationResult::from_error(
                    "'consumer_lag' operation requires a 'group_id'",
                    Some(op.command.clone()),
                ),
            },
            "broker_config" => match payload["broker_id"].as_i64() {
                Some(id) => self.op_resource_config(ResourceSpecifier::Broker(id as i32)).await,
                None => OperationResult::from_error(
                    "'broker_config' operation requires a 'broker_id'",
                    Some(op.command.clone()),
                ),
            },
            "topic_config" => match payload["topic"].as_str() {
                Some(topic) => self.op_resource_config(ResourceSpecifier::Topic(topic)).await,
                None => OperationResult::from_error(
                    "'topic_config' operation requires a 'topic'",
                    Some(op.command.clone()),
                ),
            },
            "cluster_metadata" => self.op_cluster_metadata().await,
            "describe_log_dirs" => self.op_describe_log_dirs().await,
            other => OperationResult::from_error(
                format!("Unsupported operation: {other}"),
                Some(op.command.clone()),
            ),
        }
    }

    async fn op_list_topics(&self) -> OperationResult {
        match self.fetch_metadata_snapshot().await {
            Ok(snapshot) => {
                let mut names: Vec<&str> = snapshot
                    .topics
                    .iter()
                    .map(|t| t.name.as_str())
                    .filter(|n| !n.starts_with(INTERNAL_TOPIC_PREFIX))
                    .collect();
                names.sort_unstable();
                let rows: Vec<Row> = names
                    .iter()
                    .map(|name| {
                        let mut row = Row::new();
                        row.insert("topic".into(), json!(name));
                        row
                    })
                    .collect();
                OperationResult::from_rows(rows)
            }
            Err(e) => OperationResult::from_error(e, Some("list_topics".into())),
        }
    }

    async fn op_describe_topics(&self, requested: &[String]) -> OperationResult {
        match self.fetch_metadata_snapshot().await {
            Ok(snapshot) => {
                let rows: Vec<Row> = snapshot
                    .topics
                    .iter()
                    .filter(|t| {
                        if requested.is_empty() {
                            !t.name.starts_with(INTERNAL_TOPIC_PREFIX)
                        } else {
                            requested.contains(&t.name)
                        }
                    })
                    .map(|topic| {
                        let under_replicated = topic
                            .partitions
                            .iter()
                            .filter(|p| p.isr < p.replicas)
                            .count();
                        let offline = topic
                            .partitions
                            .iter()
                            .filter(|p| p.leader < 0)
                            .count();
                        let replication_factor =
                            topic.partitions.first().map(|p| p.replicas).unwrap_or(0);
                        let mut row = Row::new();
                        row.insert("topic".into(), json!(topic.name));
                        row.insert("partitions".into(), json!(topic.partitions.len()));
                        row.insert("replication_factor".into(), json!(replication_factor));
                        row.insert("under_replicated_partitions".into(), json!(under_replicated));
                        row.insert("offline_partitions".into(), json!(offline));
                        row
                    })
                    .collect();
                OperationResult::from_rows(rows)
            }
            Err(e) => OperationResult::from_error(e, Some("describe_topics".into())),
        }
    }

    async fn op_list_consumer_groups(&self) -> OperationResult {
        let consumer = match self.consumer.as_ref() {
            Some(c) => c.clone(),
            None => {
                return OperationResult::from_error(
                    ConnectorError::NotConnected.to_string(),
                    None,
                )
            }
        };
        let groups = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_group_list(None, METADATA_TIMEOUT)
                .map(|list| {
                    list.groups()
                        .iter()
                        .map(|g| {
                            (
                                g.name().to_string(),
                                g.state().to_string(),
                                g.protocol_type().to_string(),
                                g.members().len(),
                            )
                        })
                        .collect::<Vec<_>>()
                })
                .map_err(|e| e.to_string())
        })
        .await
        .unwrap_or_else(|e| Err(format!("group list task failed: {e}")));

        match groups {
            Ok(mut groups) => {
                groups.sort_by(|a, b| a.0.cmp(&b.0));
                let rows: Vec<Row> = groups
                    .into_iter()
                    .map(|(name, state, protocol, members)| {
                        let mut row = Row::new();
                        row.insert("group_id".into(), json!(name));
                        row.insert("state".into(), json!(state));
                        row.insert("members".into(), json!(members));
                        row.insert("protocol_type".into(), json!(protocol));
                        row
                    })
                    .collect();
                OperationResult::from_rows(rows)
            }
            Err(e) => OperationResult::from_error(e, Some("list_consumer_groups".into())),
        }
    }

    /// Lag per partition for one group, or for every group with `*`.
    async fn op_consumer_lag(&self, group_id: &str) -> OperationResult {
        let snapshot = match self.fetch_metadata_snapshot().await {
            Ok(s) => s,
            Err(e) => return OperationResult::from_error(e, Some("consumer_lag".into())),
        };

        let groups: Vec<String> = if group_id == "*" {
            let consumer = match self.consumer.as_ref() {
                Some(c) => c.clone(),
                None => {
                    return OperationResult::from_error(
                        ConnectorError::NotConnected.to_string(),
                        None,
                    )
                }
            };
            let fetched = tokio::task::spawn_blocking(move || {
                consumer
                    .fetch_group_list(None, METADATA_TIMEOUT)
                    .map(|list| {
                        list.groups()
                            .iter()
                            .map(|g| g.name().to_string())
                            .collect::<Vec<_>>()
                    })
                    .map_err(|e| e.to_string())
            })
            .await
            .unwrap_or_else(|e| Err(format!("group list task failed: {e}")));
            match fetched {
                Ok(groups) => groups,
                Err(e) => return OperationResult::from_error(e, Some("consumer_lag".into())),
            }
        } else {
            vec![group_id.to_string()]
        };

        let mut rows = Vec::new();
        let mut total_lag: i64 = 0;
        for group in groups {
            match self.group_lag(&group, &snapshot).await {
                Ok(entries) => {
                    for (topic, partition, committed, end, lag) in entries {
                        total_lag += lag;
                        let mut row = Row::new();
                        row.insert("group_id".into(), json!(group.as_str()));
                        row.insert("topic".into(), json!(topic));
                        row.insert("partition".into(), json!(partition));
                        row.insert("current_offset".into(), json!(committed));
                        row.insert("log_end_offset".into(), json!(end));
                        row.insert("lag".into(), json!(lag));
                        rows.push(row);
                    }
                }
                Err(e) => warn!("lag computation failed for group {}: {}", group, e),
            }
        }

        let rendered = format!(
            "Total lag: {} message(s)\n\n{}",
            total_lag,
            formatter::render_rows(&rows)
        );
        let mut summary = Row::new();
        summary.insert("total_lag".into(), json!(total_lag));
        summary.insert("partitions".into(), json!(rows.len()));
        let mut all = vec![summary];
        all.extend(rows);
        OperationResult::from_rows_rendered(all, rendered)
    }

    async fn group_lag(
        &self,
        group: &str,
        snapshot: &MetadataSnapshot,
    ) -> Result<Vec<(String, i32, i64, i64, i64)>, String> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| ConnectorError::NotConnected.to_string())?
            .clone();
        let mut config = self.client_config();
        config.set("group.id", group);
        let group_name = group.to_string();

        let topics: Vec<(String, Vec<i32>)> = snapshot
            .topics
            .iter()
            .filter(|t| !t.name.starts_with(INTERNAL_TOPIC_PREFIX))
            .map(|t| (t.name.clone(), t.partitions.iter().map(|p| p.id).collect()))
            .collect();

        tokio::task::spawn_blocking(move || {
            let group_consumer: BaseConsumer = config
                .create()
                .map_err(|e| format!("consumer for group {group_name}: {e}"))?;

            let mut tpl = TopicPartitionList::new();
            for (topic, partitions) in &topics {
                for partition in partitions {
                    tpl.add_partition(topic, *partition);
                }
            }

            let committed = group_consumer
                .committed_offsets(tpl, METADATA_TIMEOUT)
                .map_err(|e| e.to_string())?;

            let mut out = Vec::new();
            for elem in committed.elements() {
                let Offset::Offset(committed_offset) = elem.offset() else {
                    continue;
                };
                let (_, end) = consumer
                    .fetch_watermarks(elem.topic(), elem.partition(), METADATA_TIMEOUT)
                    .map_err(|e| e.to_string())?;
                let lag = (end - committed_offset).max(0);
                out.push((
                    elem.topic().to_string(),
                    elem.partition(),
                    committed_offset,
                    end,
                    lag,
                ));
            }
            out.sort();
            Ok(out)
        })
        .await
        .map_err(|e| format!("lag task failed: {e}"))?
    }

    async fn op_resource_config(&self, spec: ResourceSpecifier<'_>) -> OperationResult {
        match self.describe_config(spec).await {
            Ok(entries) => {
                let rows: Vec<Row> = entries
                    .into_iter()
                    .map(|(name, value)| {
                        let mut row = Row::new();
                        row.insert("config_key".into(), json!(name));
                        row.insert("value".into(), json!(value));
                        row
                    })
                    .collect();
                OperationResult::from_rows(rows)
            }
            Err(e) => OperationResult::from_error(e, Some("describe_configs".into())),
        }
    }

    async fn op_cluster_metadata(&self) -> OperationResult {
        match self.fetch_metadata_snapshot().await {
            Ok(snapshot) => {
                let rows: Vec<Row> = snapshot
                    .brokers
                    .iter()
                    .map(|(id, host, port)| {
                        let mut row = Row::new();
                        row.insert("broker_id".into(), json!(id));
                        row.insert("address".into(), json!(format!("{host}:{port}")));
                        row
                    })
                    .collect();
                OperationResult::from_rows(rows)
            }
            Err(e) => OperationResult::from_error(e, Some("cluster_metadata".into())),
        }
    }

    /// The wire admin protocol offers no log-dir listing through this
    /// client; sizes come from a `du` fan-out over the brokers' log.dirs.
    async fn op_describe_log_dirs(&self) -> OperationResult {
        let Some(pool) = &self.ssh else {
            return OperationResult::from_error(
                "describe_log_dirs requires SSH access to the brokers",
                None,
            );
        };
        let broker_id = self.topology.nodes().first().and_then(|n| n.id.parse::<i32>().ok());
        let log_dirs = match broker_id {
            Some(id) => self
                .describe_config(ResourceSpecifier::Broker(id))
                .await
                .ok()
                .and_then(|entries| {
                    entries
                        .into_iter()
                        .find(|(name, _)| name == "log.dirs" || name == "log.dir")
                        .and_then(|(_, value)| value)
                }),
            None => None,
        }
        .unwrap_or_else(|| "/var/lib/kafka/data".to_string());

        let mut rows = Vec::new();
        for dir in log_dirs.split(',') {
            let command = format!("du -sb {}", dir.trim());
            for entry in pool.execute_all(&command).await {
                let mut row = Row::new();
                row.insert("broker".into(), json!(entry.node_id));
                row.insert("log_dir".into(), json!(dir.trim()));
                match entry.stdout.as_deref().and_then(|s| {
                    s.split_whitespace().next().and_then(|v| v.parse::<i64>().ok())
                }) {
                    Some(bytes) if entry.success => {
                        row.insert("size_bytes".into(), json!(bytes));
                    }
                    _ => {
                        row.insert(
                            "error".into(),
                            json!(entry.error.unwrap_or_else(|| "du failed".into())),
                        );
                    }
                }
                rows.push(row);
            }
        }
        OperationResult::from_rows(rows)
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    fn technology(&self) -> Technology {
        Technology::Kafka
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        self.state = ConnectionState::Connecting;
        let target = self.bootstrap_servers();

        let consumer: BaseConsumer =
            self.client_config().create().map_err(|e| {
                self.state = ConnectionState::Disconnected;
                ConnectorError::Connection {
                    technology: "kafka",
                    target: target.clone(),
                    reason: e.to_string(),
                }
            })?;
        self.consumer = Some(Arc::new(consumer));

        let admin: AdminClient<DefaultClientContext> =
            self.client_config().create().map_err(|e| {
                self.state = ConnectionState::Disconnected;
                ConnectorError::Connection {
                    technology: "kafka",
                    target: target.clone(),
                    reason: e.to_string(),
                }
            })?;
        self.admin = Some(admin);

        // Metadata reachability is the actual connection test.
        let snapshot = self.fetch_metadata_snapshot().await.map_err(|reason| {
            self.state = ConnectionState::Disconnected;
            ConnectorError::Connection {
                technology: "kafka",
                target: target.clone(),
                reason,
            }
        })?;

        let mut topology = Topology::new();
        for (id, host, port) in &snapshot.brokers {
            topology.insert(
                NodeIdentity::instance(id.to_string(), host.clone())
                    .with_port(*port as u16)
                    .with_role(NodeRole::Unknown),
            );
        }
        self.topology = topology;
        self.version = Some("Kafka (version API not exposed by wire client)".to_string());

        self.open_auxiliary_channels().await;
        self.map_hosts();
        self.detect_kraft().await;

        self.state = ConnectionState::Connected;
        info!(
            "kafka connector ready: {} broker(s), kraft={}",
            snapshot.brokers.len(),
            self.capabilities.is_kraft
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnecting;
        self.admin = None;
        self.consumer = None;
        if let Some(pool) = &self.ssh {
            pool.close_all();
        }
        self.cloud = None;
        self.state = ConnectionState::Disconnected;
        info!("kafka connector disconnected");
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
            OperationKind::Admin => self.run_admin(op).await,
            OperationKind::Shell => match &self.ssh {
                Some(pool) => self.shell.run_shell(pool, &op.command).await,
                None => OperationResult::from_error(
                    "SSH not configured",
                    Some(op.command.clone()),
                ),
            },
            kind => unsupported_operation(Technology::Kafka, kind),
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
                results.insert("cluster".to_string(), self.execute_operation(op).await);
            }
        }
        results
    }
}
