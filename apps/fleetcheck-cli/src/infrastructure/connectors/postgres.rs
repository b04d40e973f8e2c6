//! PostgreSQL connector: native SQL channel, capability probes,
//! environment detection (Aurora / RDS / Patroni / self-hosted), and
//! topology discovery from the replication catalog or the managed-service
//! describe-cluster API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use super::{
    unsupported_operation, Capabilities, ConnectionState, Connector, ConnectorError, Technology,
};
use crate::cli::settings::Settings;
use crate::engine::environment::{EnvironmentDetection, EnvironmentKind, SignalScore};
use crate::engine::operation::{OperationKind, OperationRequest, OperationResult, Row};
use crate::engine::topology::{
    map_ssh_hosts_to_nodes, NodeIdentity, NodeRole, NodeState, Topology,
};
use crate::infrastructure::cloud::CloudProbes;
use crate::infrastructure::shell::ShellExecutor;
use crate::infrastructure::ssh::SshPool;

const AURORA_CONFIDENCE_THRESHOLD: u32 = 40;
const RDS_CONFIDENCE_THRESHOLD: u32 = 40;
const PATRONI_CONFIDENCE_THRESHOLD: u32 = 30;

pub struct PostgresConnector {
    settings: Settings,
    state: ConnectionState,
    client: Option<tokio_postgres::Client>,
    connection_task: Option<tokio::task::JoinHandle<()>>,
    capabilities: Capabilities,
    topology: Topology,
    environment: Option<EnvironmentDetection>,
    version: Option<String>,
    ssh: Option<SshPool>,
    cloud: Option<CloudProbes>,
    shell: ShellExecutor,
}

impl PostgresConnector {
    pub fn new(settings: Settings) -> Self {
        let shell = ShellExecutor::new(settings.allow_unsafe_commands);
        Self {
            settings,
            state: ConnectionState::Disconnected,
            client: None,
            connection_task: None,
            capabilities: Capabilities::default(),
            topology: Topology::new(),
            environment: None,
            version: None,
            ssh: None,
            cloud: None,
            shell,
        }
    }

    pub fn environment(&self) -> Option<&EnvironmentDetection> {
        self.environment.as_ref()
    }

    fn client(&self) -> Result<&tokio_postgres::Client, ConnectorError> {
        self.client.as_ref().ok_or(ConnectorError::NotConnected)
    }

    async fn scalar_string(&self, query: &str) -> Option<String> {
        let client = self.client.as_ref()?;
        match client.query_opt(query, &[]).await {
            Ok(Some(row)) => row.try_get::<_, String>(0).ok(),
            _ => None,
        }
    }

    async fn probe_capabilities(&mut self) {
        // pg_stat_statements_info exists on newer versions; fall back to
        // the older view before concluding the extension is absent.
        let client = match self.client.as_ref() {
            Some(c) => c,
            None => return,
        };
        let has_pgstat = client
            .query_one("SELECT count(*) FROM pg_stat_statements_info", &[])
            .await
            .is_ok()
            || client
                .query_one("SELECT count(*) FROM pg_stat_statements LIMIT 1", &[])
                .await
                .is_ok();
        if !has_pgstat {
            warn!("pg_stat_statements is not accessible; statement-level checks will degrade");
        }
        self.capabilities.has_pgstat = has_pgstat;

        self.capabilities.has_io_timing = self
            .scalar_string("SHOW track_io_timing")
            .await
            .is_some_and(|v| v == "on");
    }

    async fn detect_environment(&mut self) {
        if let Some(raw) = &self.settings.environment_override {
            if let Some(kind) = EnvironmentKind::from_override(raw) {
                info!("using explicit environment override: {}", raw);
                self.environment = Some(EnvironmentDetection::overridden(kind));
                return;
            }
            warn!("unknown environment_override '{}', detecting instead", raw);
        }

        if let Some(detection) = self.detect_aurora().await {
            info!("Aurora detected (confidence {})", detection.confidence);
            self.environment = Some(detection);
            return;
        }
        if let Some(detection) = self.detect_rds().await {
            info!("RDS detected (confidence {})", detection.confidence);
            self.environment = Some(detection);
            return;
        }
        if let Some(detection) = self.detect_patroni().await {
            info!("Patroni cluster detected (confidence {})", detection.confidence);
            self.environment = Some(detection);
            return;
        }
        self.environment = Some(EnvironmentDetection::self_hosted());
    }

    async fn detect_aurora(&self) -> Option<EnvironmentDetection> {
        let client = self.client.as_ref()?;
        let mut score = SignalScore::new();

        if let Some(version) = &self.version {
            if version.contains("Aurora") {
                score.add("version_string", 40);
                score.add_detail("version_string", json!(version));
            }
        }

        if let Ok(row) = client.query_one("SELECT aurora_version()", &[]).await {
            score.add("aurora_version_function", 30);
            if let Ok(v) = row.try_get::<_, String>(0) {
                score.add_detail("aurora_version", json!(v));
            }
        }

        if let Ok(rows) = client
            .query(
                "SELECT name FROM pg_settings WHERE name LIKE 'rds.%' OR name LIKE 'apg.%' LIMIT 5",
                &[],
            )
            .await
        {
            if !rows.is_empty() {
                score.add("managed_parameters", 20);
                score.add_detail("managed_parameter_count", json!(rows.len()));
            }
        }

        score
            .passes(AURORA_CONFIDENCE_THRESHOLD)
            .then(|| score.into_detection(EnvironmentKind::Aurora))
    }

    async fn detect_rds(&self) -> Option<EnvironmentDetection> {
        let client = self.client.as_ref()?;
        let mut score = SignalScore::new();

        if self.settings.aws_region.is_some() && self.settings.db_cluster_id.is_some() {
            score.add("aws_settings_present", 20);
        }

        if let Ok(Some(_)) = client
            .query_opt("SELECT 1 FROM pg_roles WHERE rolname = 'rds_superuser'", &[])
            .await
        {
            score.add("rds_superuser_role", 40);
        }

        score
            .passes(RDS_CONFIDENCE_THRESHOLD)
            .then(|| score.into_detection(EnvironmentKind::Rds))
    }

    async fn detect_patroni(&self) -> Option<EnvironmentDetection> {
        let client = self.client.as_ref()?;
        let mut score = SignalScore::new();

        if let Ok(rows) = client
            .query(
                "SELECT slot_name FROM pg_replication_slots
                 WHERE slot_name LIKE '%patroni%' OR slot_name LIKE '%pgsql%' LIMIT 5",
                &[],
            )
            .await
        {
            if !rows.is_empty() {
                score.add("replication_slots", 30);
            }
        }

        if let Ok(rows) = client
            .query(
                "SELECT DISTINCT application_name FROM pg_stat_activity
                 WHERE application_name ILIKE '%patroni%' LIMIT 5",
                &[],
            )
            .await
        {
            if !rows.is_empty() {
                score.add("application_names", 25);
            }
        }

        // Control-plane REST endpoint, 200 on the leader, 503 on replicas.
        let patroni_port = self.settings.patroni_port;
        let endpoint = format!("http://{}:{}/patroni", self.settings.host, patroni_port);
        if let Ok(client_http) = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
        {
            if let Ok(response) = client_http.get(&endpoint).send().await {
                let status = response.status().as_u16();
                if status == 200 || status == 503 {
                    score.add("rest_api", 35);
                    score.add_detail("patroni_api_endpoint", json!(endpoint));
                    if let Ok(body) = response.json::<Value>().await {
                        if body.get("role").is_some() || body.get("state").is_some() {
                            score.add("rest_api_role", 10);
                            score.add_detail("patroni_node_role", body["role"].clone());
                        }
                    }
                }
            }
        }

        if let Some(pool) = &self.ssh {
            if let Ok((stdout, _, 0)) = pool
                .execute_on_primary("ps aux | grep -i '[p]atroni' | head -1", None)
                .await
            {
                if !stdout.trim().is_empty() {
                    score.add("process_check", 20);
                }
            }
            for config_path in [
                "/etc/patroni/patroni.yml",
                "/etc/patroni.yml",
                "/var/lib/postgresql/patroni.yml",
            ] {
                let probe = format!("test -f {config_path} && echo exists || echo not_found");
                if let Ok((stdout, _, _)) = pool.execute_on_primary(&probe, None).await {
                    if stdout.contains("exists") {
                        score.add("config_file", 15);
                        score.add_detail("patroni_config_file", json!(config_path));
                        break;
                    }
                }
            }
        }

        if let Ok(rows) = client
            .query(
                "SELECT name FROM pg_settings
                 WHERE name IN ('archive_command', 'restore_command', 'primary_conninfo')
                   AND setting ILIKE '%patroni%' LIMIT 5",
                &[],
            )
            .await
        {
            if !rows.is_empty() {
                score.add("config_params", 15);
            }
        }

        score
            .passes(PATRONI_CONFIDENCE_THRESHOLD)
            .then(|| score.into_detection(EnvironmentKind::Patroni))
    }

    async fn discover_topology(&mut self) {
        let is_aurora = self
            .environment
            .as_ref()
            .is_some_and(|e| e.kind == EnvironmentKind::Aurora);

        if is_aurora {
            if let (Some(cloud), Some(cluster_id)) = (
                self.cloud.as_ref().and_then(|c| c.aws.as_ref()),
                self.aurora_cluster_id(),
            ) {
                match cloud.describe_cluster_topology(&cluster_id).await {
                    Ok(topology) => {
                        self.topology = topology;
                        return;
                    }
                    Err(e) => {
                        warn!("managed-service topology discovery failed: {}", e);
                    }
                }
            } else {
                warn!("Aurora detected but AWS client or cluster id unavailable; falling back to catalog discovery");
            }
        }
        self.discover_standard_topology().await;
    }

    /// Cluster id from settings, or parsed out of a
    /// `name.cluster-xxxx.region.rds.amazonaws.com` endpoint.
    fn aurora_cluster_id(&self) -> Option<String> {
        if let Some(id) = &self.settings.db_cluster_id {
            return Some(id.clone());
        }
        let host = &self.settings.host;
        host.contains(".cluster-")
            .then(|| host.split('.').next().map(str::to_string))
            .flatten()
    }

    /// Catalog discovery: the connection endpoint is the primary, rows in
    /// `pg_stat_replication` are the replicas, with lag derived from the
    /// replay timestamp.
    async fn discover_standard_topology(&mut self) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let mut topology = Topology::new();

        let primary_host = match client
            .query_one("SELECT COALESCE(inet_server_addr()::text, '')", &[])
            .await
        {
            Ok(row) => {
                let addr: String = row.try_get(0).unwrap_or_default();
                if addr.is_empty() {
                    self.settings.host.clone()
                } else {
                    addr
                }
            }
            Err(_) => self.settings.host.clone(),
        };
        topology.insert(
            NodeIdentity::instance(primary_host.clone(), primary_host)
                .with_role(NodeRole::Writer)
                .with_port(self.settings.port),
        );

        let replica_query = "SELECT
                client_addr::text,
                state,
                sync_state,
                COALESCE(EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::float8, 0)
             FROM pg_stat_replication
             WHERE client_addr IS NOT NULL";
        match client.query(replica_query, &[]).await {
            Ok(rows) => {
                for row in rows {
                    let addr: String = match row.try_get(0) {
                        Ok(a) => a,
                        Err(_) => continue,
                    };
                    let state: String = row.try_get(1).unwrap_or_else(|_| "unknown".into());
                    let sync_state: String = row.try_get(2).unwrap_or_default();
                    let lag: f64 = row.try_get(3).unwrap_or(0.0);
                    topology.insert(
                        NodeIdentity::instance(addr.clone(), addr)
                            .with_role(NodeRole::Reader)
                            .with_port(self.settings.port)
                            .with_state(if state == "streaming" {
                                NodeState::Active
                            } else {
                                NodeState::Down
                            })
                            .with_metadata("sync_state", sync_state)
                            .with_metadata("replication_lag_seconds", format!("{lag:.1}")),
                    );
                }
            }
            Err(e) => warn!("replication catalog query failed: {}", e),
        }

        info!("discovered topology: {} node(s)", topology.nodes().len());
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

        let cloud_config = self.settings.cloud_config();
        let probes = CloudProbes::initialize(&cloud_config).await;
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

    async fn run_native(&self, op: &OperationRequest) -> OperationResult {
        let client = match self.client() {
            Ok(c) => c,
            Err(e) => return OperationResult::from_error(e.to_string(), None),
        };

        let boxed = match params_to_sql(&op.params) {
            Ok(boxed) => boxed,
            Err(e) => return OperationResult::from_error(e, Some(op.command.clone())),
        };
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b.as_ref() as &(dyn ToSql + Sync))
            .collect();

        match client.query(&op.command, &refs).await {
            Ok(rows) => OperationResult::from_rows(pg_rows_to_json(&rows)),
            Err(e) => OperationResult::from_error(
                format!("Query failed: {e}"),
                Some(op.command.clone()),
            ),
        }
    }
}

/// Positional parameter binding for the supported JSON scalar types.
fn params_to_sql(params: &[Value]) -> Result<Vec<Box<dyn ToSql + Sync + Send>>, String> {
    params
        .iter()
        .map(|value| -> Result<Box<dyn ToSql + Sync + Send>, String> {
            match value {
                Value::String(s) => Ok(Box::new(s.clone())),
                Value::Bool(b) => Ok(Box::new(*b)),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Box::new(i))
                    } else if let Some(f) = n.as_f64() {
                        Ok(Box::new(f))
                    } else {
                        Err(format!("unsupported numeric parameter: {n}"))
                    }
                }
                Value::Null => Ok(Box::new(Option::<String>::None)),
                other => Err(format!("unsupported parameter type: {other}")),
            }
        })
        .collect()
}

/// Converts driver rows into ordered JSON row maps. Driver decimals
/// become double-precision floats, timestamps become ISO-8601 strings.
fn pg_rows_to_json(rows: &[tokio_postgres::Row]) -> Vec<Row> {
    rows.iter()
        .map(|row| {
            let mut out = Row::new();
            for (index, column) in row.columns().iter().enumerate() {
                out.insert(column.name().to_string(), pg_value_to_json(row, index));
            }
            out
        })
        .collect()
}

fn pg_value_to_json(row: &tokio_postgres::Row, index: usize) -> Value {
    let ty = row.columns()[index].type_();
    if *ty == Type::INT2 {
        return row
            .try_get::<_, Option<i16>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| json!(v));
    }
    if *ty == Type::INT4 {
        return row
            .try_get::<_, Option<i32>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| json!(v));
    }
    if *ty == Type::INT8 {
        return row
            .try_get::<_, Option<i64>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| json!(v));
    }
    if *ty == Type::FLOAT4 {
        return row
            .try_get::<_, Option<f32>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| json!(v));
    }
    if *ty == Type::FLOAT8 {
        return row
            .try_get::<_, Option<f64>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| json!(v));
    }
    if *ty == Type::BOOL {
        return row
            .try_get::<_, Option<bool>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| json!(v));
    }
    if *ty == Type::TIMESTAMPTZ {
        return row
            .try_get::<_, Option<DateTime<Utc>>>(index)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| json!(v.to_rfc3339()));
    }
    if *ty == Type::JSON || *ty == Type::JSONB {
        return row
            .try_get::<_, Option<Value>>(index)
            .ok()
            .flatten()
            .unwrap_or(Value::Null);
    }
    // Text-ish and everything else that the driver can read as a string.
    row.try_get::<_, Option<String>>(index)
        .ok()
        .flatten()
        .map_or(Value::Null, Value::String)
}

#[async_trait]
impl Connector for PostgresConnector {
    fn technology(&self) -> Technology {
        Technology::Postgres
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), ConnectorError> {
        self.state = ConnectionState::Connecting;

        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.settings.host)
            .port(self.settings.port)
            .dbname(&self.settings.database)
            .user(&self.settings.user)
            .password(&self.settings.password)
            .connect_timeout(Duration::from_secs(10));

        let (client, connection) = config.connect(NoTls).await.map_err(|e| {
            self.state = ConnectionState::Disconnected;
            ConnectorError::Connection {
                technology: "postgres",
                target: format!("{}:{}", self.settings.host, self.settings.port),
                reason: e.to_string(),
            }
        })?;
        self.connection_task = Some(tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("postgres connection closed: {}", e);
            }
        }));

        let timeout_ms = self.settings.statement_timeout_secs * 1000;
        if let Err(e) = client
            .batch_execute(&format!("SET statement_timeout = {timeout_ms}"))
            .await
        {
            warn!("could not set statement_timeout: {}", e);
        }
        self.client = Some(client);

        self.version = self.scalar_string("SELECT version()").await;
        debug!("connected: {}", self.version.as_deref().unwrap_or("unknown version"));

        self.probe_capabilities().await;
        self.open_auxiliary_channels().await;
        self.detect_environment().await;
        self.discover_topology().await;
        self.map_hosts();

        self.state = ConnectionState::Connected;
        info!(
            "postgres connector ready: {} node(s), environment {}",
            self.topology.nodes().len(),
            self.environment
                .as_ref()
                .map(|e| e.kind.as_str())
                .unwrap_or("unknown")
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnecting;
        self.client = None;
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
        if let Some(pool) = &self.ssh {
            pool.close_all();
        }
        self.cloud = None;
        self.state = ConnectionState::Disconnected;
        info!("postgres connector disconnected");
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
            OperationKind::Native => self.run_native(op).await,
            OperationKind::Shell => match &self.ssh {
                Some(pool) => self.shell.run_shell(pool, &op.command).await,
                None => OperationResult::from_error(
                    "SSH not configured",
                    Some(op.command.clone()),
                ),
            },
            kind => unsupported_operation(Technology::Postgres, kind),
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
                // Native queries run against the primary session only; the
                // primary's node id keys the single entry.
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
