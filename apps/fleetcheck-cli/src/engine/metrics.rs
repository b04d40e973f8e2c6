//! Adaptive metric collection.
//!
//! A metric is defined once with an ordered list of collection strategies;
//! `collect_metric` tries them in declared order and the first strategy
//! that yields data wins. The collector never errors: per-strategy
//! failures are recorded in the sample metadata (or swallowed into a None
//! when nothing worked), and callers distinguish "no strategy had data"
//! from a legitimate zero.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::infrastructure::connectors::Connector;
use crate::infrastructure::shell::parsers;
use crate::engine::operation::OperationRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Avg,
    Max,
    PerNode,
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
}

/// How stdout of a shell probe becomes a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeParser {
    /// First whitespace-separated token that parses as a float.
    FirstNumber,
    /// Used-memory percentage out of `free -m` output.
    FreeUsedPct,
    /// Highest `Use%` across filesystems in `df -h` output.
    DfMaxUsePct,
}

impl ProbeParser {
    pub fn parse(&self, stdout: &str) -> Option<f64> {
        match self {
            ProbeParser::FirstNumber => stdout
                .split_whitespace()
                .find_map(|token| token.parse::<f64>().ok()),
            ProbeParser::FreeUsedPct => parsers::parse_free(stdout)
                .get("used_pct")
                .and_then(Value::as_f64),
            ProbeParser::DfMaxUsePct => parsers::parse_df(stdout)
                .iter()
                .filter_map(|row| row.get("use_pct").and_then(Value::as_f64))
                .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v)))),
        }
    }
}

/// One entry in a metric's strategy chain.
#[derive(Debug, Clone)]
pub enum CollectionStrategy {
    /// Managed-service Prometheus endpoint: one HTTP call, per-node values.
    ManagedPrometheus { metric: String },
    /// Local Prometheus exporter scraped through an SSH-tunneled curl.
    LocalExporter { metric: String, port: u16 },
    /// JMX attribute probe over SSH.
    JmxSsh {
        mbean: String,
        attribute: String,
        port: u16,
    },
    /// OS-level shell probe per node.
    ShellProbe { command: String, parser: ProbeParser },
    /// Metric accessible through the primary native connection.
    NativeQuery { query: String, value_column: String },
}

impl CollectionStrategy {
    pub fn method_name(&self) -> &'static str {
        match self {
            CollectionStrategy::ManagedPrometheus { .. } => "managed_prometheus",
            CollectionStrategy::LocalExporter { .. } => "local_prometheus_exporter",
            CollectionStrategy::JmxSsh { .. } => "jmx_ssh",
            CollectionStrategy::ShellProbe { .. } => "shell_probe",
            CollectionStrategy::NativeQuery { .. } => "native_query",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricDefinition {
    pub logical_name: String,
    pub strategies: Vec<CollectionStrategy>,
    pub thresholds: Thresholds,
    pub aggregation: Aggregation,
    pub unit: &'static str,
}

/// Collected values, normalized to stable node ids.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub node_metrics: BTreeMap<String, f64>,
    pub cluster_total: f64,
    pub cluster_avg: f64,
    /// Which strategy produced the data.
    pub method: String,
    pub metadata: Map<String, Value>,
}

impl MetricSample {
    pub fn node_count(&self) -> usize {
        self.node_metrics.len()
    }

    pub fn nodes_above(&self, threshold: f64) -> usize {
        self.node_metrics.values().filter(|v| **v > threshold).count()
    }
}

fn build_sample(
    def: &MetricDefinition,
    method: &str,
    node_metrics: BTreeMap<String, f64>,
    attempts: Vec<Value>,
    gaps: Vec<Value>,
) -> MetricSample {
    let sum: f64 = node_metrics.values().sum();
    let count = node_metrics.len() as f64;
    let max = node_metrics.values().cloned().fold(f64::MIN, f64::max);

    let cluster_total = match def.aggregation {
        Aggregation::Sum | Aggregation::PerNode | Aggregation::Avg => sum,
        Aggregation::Max => max,
    };
    let cluster_avg = if count > 0.0 { sum / count } else { 0.0 };

    let mut metadata = Map::new();
    metadata.insert("attempts".into(), Value::Array(attempts));
    if !gaps.is_empty() {
        metadata.insert("node_gaps".into(), Value::Array(gaps));
    }
    metadata.insert("unit".into(), json!(def.unit));

    MetricSample {
        node_metrics,
        cluster_total,
        cluster_avg,
        method: method.to_string(),
        metadata,
    }
}

struct StrategyData {
    node_metrics: BTreeMap<String, f64>,
    gaps: Vec<Value>,
}

/// Tries the definition's strategies in declared order and returns the
/// first non-empty, normalized result. Partial per-node success counts as
/// success; gaps land in metadata. Returns None when no strategy had data.
pub async fn collect_metric(
    def: &MetricDefinition,
    connector: &dyn Connector,
) -> Option<MetricSample> {
    let mut attempts: Vec<Value> = Vec::new();

    for strategy in &def.strategies {
        let method = strategy.method_name();
        match try_strategy(strategy, connector).await {
            Ok(data) if !data.node_metrics.is_empty() => {
                debug!(
                    "metric {} collected via {} ({} node(s))",
                    def.logical_name,
                    method,
                    data.node_metrics.len()
                );
                attempts.push(json!({"strategy": method, "outcome": "success"}));
                return Some(build_sample(def, method, data.node_metrics, attempts, data.gaps));
            }
            Ok(_) => {
                attempts.push(json!({"strategy": method, "error": "no data returned"}));
            }
            Err(error) => {
                debug!("metric {} strategy {} failed: {}", def.logical_name, method, error);
                attempts.push(json!({"strategy": method, "error": error}));
            }
        }
    }
    None
}

async fn try_strategy(
    strategy: &CollectionStrategy,
    connector: &dyn Connector,
) -> Result<StrategyData, String> {
    match strategy {
        CollectionStrategy::ManagedPrometheus { metric } => {
            let api = connector
                .cloud()
                .and_then(|c| c.instaclustr.as_ref())
                .ok_or_else(|| "managed-service API not configured".to_string())?;
            let node_metrics = api
                .fetch_node_metric(metric)
                .await
                .map_err(|e| e.to_string())?;
            Ok(StrategyData {
                node_metrics,
                gaps: Vec::new(),
            })
        }

        CollectionStrategy::LocalExporter { metric, port } => {
            let pool = connector
                .ssh()
                .ok_or_else(|| "SSH not configured".to_string())?;
            let command = format!("curl -s --max-time 10 http://127.0.0.1:{port}/metrics");
            let entries = pool.execute_all(&command).await;

            let mut node_metrics = BTreeMap::new();
            let mut gaps = Vec::new();
            for entry in entries {
                if !entry.success {
                    gaps.push(json!({
                        "host": entry.host,
                        "error": entry.error.unwrap_or_else(|| "exporter scrape failed".into()),
                    }));
                    continue;
                }
                let stdout = entry.stdout.as_deref().unwrap_or("");
                match scrape_metric_value(stdout, metric) {
                    Some(value) => {
                        node_metrics.insert(stable_node_key(&entry.node_id, &entry.host), value);
                    }
                    None => gaps.push(json!({
                        "host": entry.host,
                        "error": format!("metric {metric} absent from exporter output"),
                    })),
                }
            }
            if node_metrics.is_empty() && !gaps.is_empty() {
                return Err("no node returned exporter data".to_string());
            }
            Ok(StrategyData { node_metrics, gaps })
        }

        CollectionStrategy::JmxSsh {
            mbean,
            attribute,
            port,
        } => {
            let pool = connector
                .ssh()
                .ok_or_else(|| "SSH not configured".to_string())?;
            let command = format!(
                "echo 'get -s -b {mbean} {attribute}' | java -jar /opt/jmxterm/jmxterm.jar -l localhost:{port} -n -v silent"
            );
            let entries = pool.execute_all(&command).await;

            let mut node_metrics = BTreeMap::new();
            let mut gaps = Vec::new();
            for entry in entries {
                if !entry.success {
                    gaps.push(json!({
                        "host": entry.host,
                        "error": entry.error.unwrap_or_else(|| "jmx probe failed".into()),
                    }));
                    continue;
                }
                let stdout = entry.stdout.as_deref().unwrap_or("");
                match ProbeParser::FirstNumber.parse(stdout) {
                    Some(value) => {
                        node_metrics.insert(stable_node_key(&entry.node_id, &entry.host), value);
                    }
                    None => gaps.push(json!({
                        "host": entry.host,
                        "error": "jmx output was not numeric",
                    })),
                }
            }
            if node_metrics.is_empty() && !gaps.is_empty() {
                return Err("no node returned jmx data".to_string());
            }
            Ok(StrategyData { node_metrics, gaps })
        }

        CollectionStrategy::ShellProbe { command, parser } => {
            let pool = connector
                .ssh()
                .ok_or_else(|| "SSH not configured".to_string())?;
            let entries = pool.execute_all(command).await;

            let mut node_metrics = BTreeMap::new();
            let mut gaps = Vec::new();
            for entry in entries {
                if !entry.success {
                    gaps.push(json!({
                        "host": entry.host,
                        "error": entry.error.unwrap_or_else(|| "probe failed".into()),
                    }));
                    continue;
                }
                let stdout = entry.stdout.as_deref().unwrap_or("");
                match parser.parse(stdout) {
                    Some(value) => {
                        node_metrics.insert(stable_node_key(&entry.node_id, &entry.host), value);
                    }
                    None => gaps.push(json!({
                        "host": entry.host,
                        "error": "probe output was not parseable",
                    })),
                }
            }
            if node_metrics.is_empty() && !gaps.is_empty() {
                return Err("no node returned probe data".to_string());
            }
            Ok(StrategyData { node_metrics, gaps })
        }

        CollectionStrategy::NativeQuery {
            query,
            value_column,
        } => {
            let result = connector
                .execute_operation(&OperationRequest::native(query.clone()))
                .await;
            if let Some(failure) = result.failure() {
                return Err(failure.error.clone());
            }
            let value = result
                .scalar(value_column)
                .and_then(Value::as_f64)
                .ok_or_else(|| format!("column {value_column} missing or not numeric"))?;

            let node_key = connector
                .topology()
                .writer()
                .map(|n| n.id.clone())
                .unwrap_or_else(|| "primary".to_string());
            let mut node_metrics = BTreeMap::new();
            node_metrics.insert(node_key, value);
            Ok(StrategyData {
                node_metrics,
                gaps: Vec::new(),
            })
        }
    }
}

/// Output keys must be stable identifiers: broker/instance id when the
/// topology mapping provided one, hostname otherwise.
fn stable_node_key(node_id: &str, host: &str) -> String {
    if node_id == crate::engine::topology::UNMAPPED_NODE_ID {
        host.to_string()
    } else {
        node_id.to_string()
    }
}

/// Sum of all samples of one metric in scrape text (a broker exposes one
/// sample per label set; the per-node value is their sum).
fn scrape_metric_value(body: &str, metric: &str) -> Option<f64> {
    let scrape = prometheus_parse::Scrape::parse(
        body.lines().map(|l| std::io::Result::Ok(l.to_string())),
    )
    .ok()?;
    let mut found = false;
    let mut total = 0.0;
    for sample in scrape.samples.iter().filter(|s| s.metric == metric) {
        let value = match sample.value {
            prometheus_parse::Value::Counter(v)
            | prometheus_parse::Value::Gauge(v)
            | prometheus_parse::Value::Untyped(v) => v,
            _ => continue,
        };
        found = true;
        total += value;
    }
    found.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::topology::{NodeIdentity, NodeRole};
    use crate::infrastructure::connectors::test_support::MockConnector;
    use crate::infrastructure::connectors::Technology;
    use crate::engine::operation::Row;

    fn native_def(queries: &[(&str, &str)]) -> MetricDefinition {
        MetricDefinition {
            logical_name: "test_metric".to_string(),
            strategies: queries
                .iter()
                .map(|(q, col)| CollectionStrategy::NativeQuery {
                    query: q.to_string(),
                    value_column: col.to_string(),
                })
                .collect(),
            thresholds: Thresholds {
                warning: 0.0,
                critical: 10.0,
            },
            aggregation: Aggregation::Sum,
            unit: "count",
        }
    }

    fn scalar_row(column: &str, value: f64) -> Row {
        let mut row = Row::new();
        row.insert(column.to_string(), json!(value));
        row
    }

    #[tokio::test]
    async fn test_first_successful_strategy_wins() {
        // S1 fails, S2 succeeds, S3 would also succeed but must not run.
        let mut mock = MockConnector::new(Technology::Postgres);
        mock.topology
            .insert(NodeIdentity::instance("db-1", "db-1").with_role(NodeRole::Writer));
        mock.script_error("q1", "relation does not exist");
        mock.script_rows("q2", vec![scalar_row("v", 7.0)]);
        mock.script_rows("q3", vec![scalar_row("v", 99.0)]);

        let def = native_def(&[("q1", "v"), ("q2", "v"), ("q3", "v")]);
        let sample = collect_metric(&def, &mock).await.expect("sample");

        assert_eq!(sample.method, "native_query");
        assert_eq!(sample.cluster_total, 7.0);
        assert_eq!(sample.node_metrics["db-1"], 7.0);

        let executed = mock.executed.lock().unwrap().clone();
        assert_eq!(
            executed,
            ["q1", "q2"],
            "strategies past the first success must not run"
        );

        // First-strategy error is recorded in metadata.
        let attempts = sample.metadata["attempts"].as_array().unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0]["error"]
            .as_str()
            .unwrap()
            .contains("relation does not exist"));
        assert_eq!(attempts[1]["outcome"], "success");
    }

    #[tokio::test]
    async fn test_all_strategies_fail_yields_none() {
        let mock = MockConnector::new(Technology::Postgres);
        mock.script_error("q1", "boom");
        let def = native_def(&[("q1", "v")]);
        assert!(collect_metric(&def, &mock).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_is_data_not_absence() {
        let mut mock = MockConnector::new(Technology::Postgres);
        mock.topology
            .insert(NodeIdentity::instance("db-1", "db-1").with_role(NodeRole::Writer));
        mock.script_rows("q1", vec![scalar_row("v", 0.0)]);
        let def = native_def(&[("q1", "v")]);
        let sample = collect_metric(&def, &mock).await;
        assert!(
            sample.is_some(),
            "a healthy zero must be distinguishable from 'no strategy succeeded'"
        );
        assert_eq!(sample.unwrap().cluster_total, 0.0);
    }

    #[test]
    fn test_aggregation_rules() {
        let mut values = BTreeMap::new();
        values.insert("b-1".to_string(), 5.0);
        values.insert("b-2".to_string(), 0.0);
        values.insert("b-3".to_string(), 1.0);

        let mut def = native_def(&[("q", "v")]);
        def.aggregation = Aggregation::Sum;
        let sum = build_sample(&def, "test", values.clone(), vec![], vec![]);
        assert_eq!(sum.cluster_total, 6.0);
        assert_eq!(sum.cluster_avg, 2.0);

        def.aggregation = Aggregation::Max;
        let max = build_sample(&def, "test", values, vec![], vec![]);
        assert_eq!(max.cluster_total, 5.0);
    }

    #[test]
    fn test_probe_parsers() {
        assert_eq!(ProbeParser::FirstNumber.parse("lines: 512\n"), Some(512.0));
        assert_eq!(ProbeParser::FirstNumber.parse("no numbers here"), None);

        let free = "              total        used\nMem:          1000       250        700\n";
        assert_eq!(ProbeParser::FreeUsedPct.parse(free), Some(25.0));

        let df = "Filesystem Size Used Avail Use% Mounted on\n/dev/a 10G 8G 2G 80% /\n/dev/b 10G 1G 9G 10% /data\n";
        assert_eq!(ProbeParser::DfMaxUsePct.parse(df), Some(80.0));
    }

    #[test]
    fn test_scrape_metric_value_sums_label_sets() {
        let body = "\
kafka_urp{topic=\"a\"} 2
kafka_urp{topic=\"b\"} 3
kafka_other 9
";
        assert_eq!(scrape_metric_value(body, "kafka_urp"), Some(5.0));
        assert_eq!(scrape_metric_value(body, "missing"), None);
    }

    #[test]
    fn test_percent_metrics_are_not_double_divided() {
        // A ratio-style metric already in percent keeps its scale.
        let mut values = BTreeMap::new();
        values.insert("n1".to_string(), 80.0);
        values.insert("n2".to_string(), 60.0);
        let mut def = native_def(&[("q", "v")]);
        def.aggregation = Aggregation::Avg;
        def.unit = "percent";
        let sample = build_sample(&def, "test", values, vec![], vec![]);
        assert_eq!(sample.cluster_avg, 70.0);
    }
}
