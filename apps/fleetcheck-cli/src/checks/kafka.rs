//! Kafka checks: partition health via adaptive collection, broker OS
//! resources via SSH fan-out, topic and consumer-group state via the
//! admin channel.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::ssh_skip_output;
use crate::engine::check::{Check, CheckContext, CheckOutput};
use crate::engine::findings::{
    CheckStatus, FindingEnvelope, SEVERITY_CRITICAL, SEVERITY_WARNING,
};
use crate::engine::metrics::{
    collect_metric, Aggregation, CollectionStrategy, MetricDefinition, MetricSample, Thresholds,
};
use crate::engine::operation::OperationRequest;
use crate::engine::EngineError;
use crate::infrastructure::shell::parsers;
use crate::report::formatter::FragmentBuilder;

const LOCAL_EXPORTER_PORT: u16 = 7500;
const JMX_PORT: u16 = 9999;

fn urp_definition(thresholds: Thresholds) -> MetricDefinition {
    MetricDefinition {
        logical_name: "under_replicated_partitions".to_string(),
        strategies: vec![
            CollectionStrategy::ManagedPrometheus {
                metric: "kafka_server_replicamanager_underreplicatedpartitions".to_string(),
            },
            CollectionStrategy::LocalExporter {
                metric: "kafka_server_replicamanager_underreplicatedpartitions".to_string(),
                port: LOCAL_EXPORTER_PORT,
            },
            CollectionStrategy::JmxSsh {
                mbean: "kafka.server:type=ReplicaManager,name=UnderReplicatedPartitions"
                    .to_string(),
                attribute: "Value".to_string(),
                port: JMX_PORT,
            },
        ],
        thresholds,
        aggregation: Aggregation::Sum,
        unit: "count",
    }
}

/// Severity mapping shared by the partition-health checks: at or above
/// critical is critical, anything above warning is a warning.
pub(crate) fn classify_count(
    total: f64,
    thresholds: Thresholds,
) -> (CheckStatus, u8) {
    if total >= thresholds.critical {
        (CheckStatus::Critical, SEVERITY_CRITICAL)
    } else if total > thresholds.warning {
        (CheckStatus::Warning, SEVERITY_WARNING)
    } else {
        (CheckStatus::Success, 0)
    }
}

fn unavailable_output(title: &str, metric: &str) -> CheckOutput {
    let mut builder = FragmentBuilder::new();
    builder.h3(title).warning(&format!(
        "Could not collect {metric}.\n\n\
         Tried collection methods:\n\
         1. Managed-service Prometheus endpoint - not configured or unavailable\n\
         2. Local Prometheus exporter - not found or SSH unavailable\n\
         3. JMX over SSH - not available"
    ));
    CheckOutput::new(
        builder.build(),
        FindingEnvelope::unavailable("no collection method available"),
    )
}

pub struct UnderReplicatedPartitionsCheck;

impl UnderReplicatedPartitionsCheck {
    fn build_finding(sample: &MetricSample, thresholds: Thresholds) -> FindingEnvelope {
        let total = sample.cluster_total;
        let nodes_with_urp = sample.nodes_above(0.0);
        let (status, severity) = classify_count(total, thresholds);

        let mut node_metrics = Map::new();
        for (node, value) in &sample.node_metrics {
            node_metrics.insert(node.clone(), json!(value));
        }
        let data = json!({
            "total_urp": total as i64,
            "nodes_with_urp": nodes_with_urp,
            "node_count": sample.node_count(),
            "warning_threshold": thresholds.warning,
            "critical_threshold": thresholds.critical,
            "node_metrics": node_metrics,
            "collection_metadata": Value::Object(sample.metadata.clone()),
        });

        let message = match status {
            CheckStatus::Critical => {
                format!("{} under-replicated partition(s): one broker failure from data loss", total as i64)
            }
            CheckStatus::Warning => {
                format!("{} under-replicated partition(s) detected", total as i64)
            }
            _ => format!("No under-replicated partitions ({} nodes checked)", sample.node_count()),
        };

        let envelope = match status {
            CheckStatus::Critical => FindingEnvelope::critical(severity, message, data),
            CheckStatus::Warning => FindingEnvelope::warning(severity, message, data),
            _ => FindingEnvelope::success(message, data),
        };
        envelope
            .with_collection_method(sample.method.clone())
            .with_node_count(sample.node_count())
    }
}

#[async_trait]
impl Check for UnderReplicatedPartitionsCheck {
    fn name(&self) -> &'static str {
        "under_replicated_partitions"
    }

    fn weight(&self) -> u8 {
        10
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let thresholds = Thresholds {
            warning: ctx.threshold("kafka_urp_warning", 0.0),
            critical: ctx.threshold("kafka_urp_critical", 10.0),
        };
        let def = urp_definition(thresholds);

        let Some(sample) = collect_metric(&def, ctx.connector).await else {
            return Ok(unavailable_output(
                "Under-Replicated Partitions",
                "the under-replicated partition count",
            ));
        };

        let finding = Self::build_finding(&sample, thresholds);
        let mut builder = FragmentBuilder::new();
        builder.h3("Under-Replicated Partitions");
        match finding.status {
            CheckStatus::Critical => builder.critical(&finding.message),
            CheckStatus::Warning => builder.warning(&finding.message),
            _ => builder.note(&finding.message),
        };
        builder
            .blank()
            .text(format!("Collection method: {}", sample.method))
            .blank();
        for (node, value) in &sample.node_metrics {
            builder.text(format!("- {}: {} under-replicated partition(s)", node, *value as i64));
        }

        Ok(CheckOutput::new(builder.build(), finding))
    }
}

pub struct OfflinePartitionsCheck;

#[async_trait]
impl Check for OfflinePartitionsCheck {
    fn name(&self) -> &'static str {
        "offline_partitions"
    }

    fn weight(&self) -> u8 {
        10
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let op = OperationRequest::admin(json!({"operation": "describe_topics"}));
        let result = ctx.connector.execute_operation(&op).await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Offline Partitions");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&format!("Topic metadata unavailable: {failure}"));
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("topic metadata unavailable: {failure}")),
            ));
        };

        let total_offline: i64 = rows
            .iter()
            .filter_map(|row| row.get("offline_partitions").and_then(Value::as_i64))
            .sum();
        let affected: Vec<&str> = rows
            .iter()
            .filter(|row| {
                row.get("offline_partitions")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    > 0
            })
            .filter_map(|row| row.get("topic").and_then(Value::as_str))
            .collect();

        let thresholds = Thresholds {
            warning: ctx.threshold("kafka_offline_warning", 0.0),
            critical: ctx.threshold("kafka_offline_critical", 1.0),
        };
        let (status, severity) = classify_count(total_offline as f64, thresholds);

        let data = json!({
            "total_offline": total_offline,
            "affected_topics": affected,
            "topic_count": rows.len(),
        });

        let finding = match status {
            CheckStatus::Critical => {
                builder.critical(&format!(
                    "{total_offline} offline partition(s): producers and consumers are failing"
                ));
                FindingEnvelope::critical(
                    severity,
                    format!("{total_offline} offline partition(s)"),
                    data,
                )
            }
            CheckStatus::Warning => {
                builder.warning(&format!("{total_offline} offline partition(s)"));
                FindingEnvelope::warning(
                    severity,
                    format!("{total_offline} offline partition(s)"),
                    data,
                )
            }
            _ => {
                builder.note(&format!(
                    "No offline partitions across {} topic(s)",
                    rows.len()
                ));
                FindingEnvelope::success("No offline partitions", data)
            }
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding.with_collection_method("admin_api"),
        ))
    }
}

pub struct MemoryUsageCheck;

#[async_trait]
impl Check for MemoryUsageCheck {
    fn name(&self) -> &'static str {
        "memory_usage"
    }

    fn weight(&self) -> u8 {
        7
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let Some(pool) = ctx.connector.ssh() else {
            return Ok(ssh_skip_output("Broker Memory Usage"));
        };

        let warning = ctx.threshold("kafka_memory_warning", 80.0);
        let critical = ctx.threshold("kafka_memory_critical", 90.0);

        let entries = pool.execute_all("free -m").await;
        let mut builder = FragmentBuilder::new();
        builder.h3("Broker Memory Usage");

        let mut per_node = Vec::new();
        let mut failed_hosts = Vec::new();
        let mut worst: f64 = 0.0;
        let mut sum = 0.0;
        for entry in &entries {
            if !entry.success {
                failed_hosts.push(json!({
                    "host": entry.host,
                    "error": entry.error.clone().unwrap_or_else(|| "command failed".into()),
                }));
                continue;
            }
            let mem = parsers::parse_free(entry.stdout.as_deref().unwrap_or(""));
            let used_pct = mem.get("used_pct").and_then(Value::as_f64).unwrap_or(0.0);
            worst = worst.max(used_pct);
            sum += used_pct;
            per_node.push(json!({
                "node_id": entry.node_id,
                "host": entry.host,
                "used_pct": used_pct,
                "total_mb": mem.get("total_mb").cloned().unwrap_or(json!(0)),
                "available_mb": mem.get("available_mb").cloned().unwrap_or(json!(0)),
            }));
        }

        if per_node.is_empty() {
            builder.error("No broker returned memory data");
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error("no broker returned memory data"),
            ));
        }

        let avg = sum / per_node.len() as f64;
        let data = json!({
            "per_node": per_node,
            "failed_hosts": failed_hosts,
            "cluster_aggregate": {
                "avg_used_pct": avg,
                "max_used_pct": worst,
                "node_count": per_node.len(),
            },
            "thresholds": {"warning": warning, "critical": critical},
        });

        let finding = if worst >= critical {
            builder.critical(&format!("Memory usage at {worst:.1}% on at least one broker"));
            FindingEnvelope::critical(
                SEVERITY_CRITICAL,
                format!("broker memory usage at {worst:.1}%"),
                data,
            )
        } else if worst >= warning {
            builder.warning(&format!("Memory usage at {worst:.1}% on at least one broker"));
            FindingEnvelope::warning(
                SEVERITY_WARNING,
                format!("broker memory usage at {worst:.1}%"),
                data,
            )
        } else {
            builder.note(&format!(
                "Memory healthy on {} broker(s), worst {worst:.1}%",
                per_node.len()
            ));
            FindingEnvelope::success(format!("memory healthy, worst {worst:.1}%"), data)
        };

        if !failed_hosts.is_empty() {
            let hosts: Vec<String> = failed_hosts
                .iter()
                .filter_map(|f| f["host"].as_str().map(str::to_string))
                .collect();
            builder.blank().warning(&format!(
                "No memory data from: {}",
                hosts.join(", ")
            ));
        }

        Ok(CheckOutput::new(
            builder.build(),
            finding
                .with_collection_method("shell_probe")
                .with_node_count(entries.len()),
        ))
    }
}

pub struct FileDescriptorsCheck;

#[async_trait]
impl Check for FileDescriptorsCheck {
    fn name(&self) -> &'static str {
        "file_descriptors"
    }

    fn weight(&self) -> u8 {
        7
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        if ctx.connector.ssh().is_none() {
            return Ok(ssh_skip_output("File Descriptors"));
        }

        let warning = ctx.threshold("kafka_fd_warning", 70.0);
        let critical = ctx.threshold("kafka_fd_critical", 85.0);
        let fd_limit = ctx.threshold("kafka_fd_limit", 100_000.0);

        let def = MetricDefinition {
            logical_name: "broker_open_fds".to_string(),
            strategies: vec![
                CollectionStrategy::ManagedPrometheus {
                    metric: "kafka_server_open_file_descriptor_count".to_string(),
                },
                CollectionStrategy::ShellProbe {
                    command: "ls /proc/$(pgrep -f kafka.Kafka | head -1)/fd | wc -l".to_string(),
                    parser: crate::engine::metrics::ProbeParser::FirstNumber,
                },
            ],
            thresholds: Thresholds {
                warning,
                critical,
            },
            aggregation: Aggregation::Max,
            unit: "count",
        };

        let mut builder = FragmentBuilder::new();
        builder.h3("File Descriptors");

        let Some(sample) = collect_metric(&def, ctx.connector).await else {
            builder.warning("Could not collect file-descriptor counts from any source");
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::unavailable("no collection method available"),
            ));
        };

        let mut per_node = Vec::new();
        let mut worst_pct: f64 = 0.0;
        for (node, open) in &sample.node_metrics {
            let pct = open / fd_limit * 100.0;
            worst_pct = worst_pct.max(pct);
            per_node.push(json!({
                "node_id": node,
                "open_fds": open,
                "usage_pct": pct,
            }));
        }

        let data = json!({
            "per_node": per_node,
            "cluster_aggregate": {
                "max_fd_usage_pct": worst_pct,
                "fd_limit": fd_limit,
                "node_count": sample.node_count(),
            },
            "thresholds": {"warning": warning, "critical": critical},
            "collection_metadata": Value::Object(sample.metadata.clone()),
        });

        let finding = if worst_pct >= critical {
            builder.critical(&format!(
                "File-descriptor usage at {worst_pct:.1}% of the limit"
            ));
            FindingEnvelope::critical(
                SEVERITY_CRITICAL,
                format!("fd usage at {worst_pct:.1}%"),
                data,
            )
        } else if worst_pct >= warning {
            builder.warning(&format!(
                "File-descriptor usage at {worst_pct:.1}% of the limit"
            ));
            FindingEnvelope::warning(SEVERITY_WARNING, format!("fd usage at {worst_pct:.1}%"), data)
        } else {
            builder.note(&format!(
                "File descriptors healthy, worst {worst_pct:.1}% of limit"
            ));
            FindingEnvelope::success(format!("fd usage healthy, worst {worst_pct:.1}%"), data)
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding
                .with_collection_method(sample.method.clone())
                .with_node_count(sample.node_count()),
        ))
    }
}

pub struct TopicOverviewCheck;

#[async_trait]
impl Check for TopicOverviewCheck {
    fn name(&self) -> &'static str {
        "topic_overview"
    }

    fn weight(&self) -> u8 {
        5
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let op = OperationRequest::admin(json!({"operation": "describe_topics"}));
        let result = ctx.connector.execute_operation(&op).await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Topic Overview");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("topic metadata unavailable: {failure}")),
            ));
        };

        let total_partitions: i64 = rows
            .iter()
            .filter_map(|row| row.get("partitions").and_then(Value::as_i64))
            .sum();
        let rf1_topics: Vec<&str> = rows
            .iter()
            .filter(|row| {
                row.get("replication_factor")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    <= 1
            })
            .filter_map(|row| row.get("topic").and_then(Value::as_str))
            .collect();

        builder.text(result.rendered.clone()).blank();

        let data = json!({
            "topic_count": rows.len(),
            "total_partitions": total_partitions,
            "unreplicated_topics": rf1_topics,
        });

        let finding = if rf1_topics.is_empty() {
            builder.note(&format!(
                "{} topic(s), {} partition(s), all replicated",
                rows.len(),
                total_partitions
            ));
            FindingEnvelope::success(
                format!("{} topic(s), {} partition(s)", rows.len(), total_partitions),
                data,
            )
        } else {
            builder.warning(&format!(
                "{} topic(s) with replication factor 1: {}",
                rf1_topics.len(),
                rf1_topics.join(", ")
            ));
            FindingEnvelope::warning(
                5,
                format!("{} topic(s) without replication", rf1_topics.len()),
                data,
            )
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding.with_collection_method("admin_api"),
        ))
    }
}

pub struct ConsumerLagCheck;

#[async_trait]
impl Check for ConsumerLagCheck {
    fn name(&self) -> &'static str {
        "consumer_lag"
    }

    fn weight(&self) -> u8 {
        6
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let warning = ctx.threshold("kafka_lag_warning", 10_000.0);
        let critical = ctx.threshold("kafka_lag_critical", 100_000.0);

        let op = OperationRequest::admin(json!({"operation": "consumer_lag", "group_id": "*"}));
        let result = ctx.connector.execute_operation(&op).await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Consumer Lag");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("consumer lag unavailable: {failure}")),
            ));
        };

        // The connector puts a summary row first, partitions after.
        let total_lag = rows
            .first()
            .and_then(|row| row.get("total_lag"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let partitions = rows.len().saturating_sub(1);

        builder.text(result.rendered.clone()).blank();

        let thresholds = Thresholds { warning, critical };
        let (status, severity) = classify_count(total_lag as f64, thresholds);
        let data = json!({
            "total_lag": total_lag,
            "partitions_tracked": partitions,
            "thresholds": {"warning": warning, "critical": critical},
        });

        let finding = match status {
            CheckStatus::Critical => FindingEnvelope::critical(
                severity,
                format!("total consumer lag {total_lag} messages"),
                data,
            ),
            CheckStatus::Warning => FindingEnvelope::warning(
                severity,
                format!("total consumer lag {total_lag} messages"),
                data,
            ),
            _ => FindingEnvelope::success(
                format!("total consumer lag {total_lag} messages"),
                data,
            ),
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding.with_collection_method("admin_api"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample(values: &[(&str, f64)], method: &str) -> MetricSample {
        let mut node_metrics = BTreeMap::new();
        for (node, value) in values {
            node_metrics.insert(node.to_string(), *value);
        }
        let sum: f64 = node_metrics.values().sum();
        let avg = sum / node_metrics.len() as f64;
        MetricSample {
            node_metrics,
            cluster_total: sum,
            cluster_avg: avg,
            method: method.to_string(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_urp_warning_shape() {
        // Three brokers, one with 5 URPs, warning=0 critical=10.
        let sample = sample(
            &[("broker-1", 5.0), ("broker-2", 0.0), ("broker-3", 0.0)],
            "managed_prometheus",
        );
        let thresholds = Thresholds {
            warning: 0.0,
            critical: 10.0,
        };
        let finding = UnderReplicatedPartitionsCheck::build_finding(&sample, thresholds);

        assert_eq!(finding.status, CheckStatus::Warning);
        assert_eq!(finding.severity, 7);
        assert_eq!(finding.data["total_urp"], json!(5));
        assert_eq!(finding.data["nodes_with_urp"], json!(1));
        assert_eq!(finding.data["node_count"], json!(3));
        assert_eq!(
            finding.metadata.collection_method.as_deref(),
            Some("managed_prometheus")
        );
    }

    #[test]
    fn test_urp_critical_at_threshold() {
        let sample = sample(&[("broker-1", 10.0)], "jmx_ssh");
        let thresholds = Thresholds {
            warning: 0.0,
            critical: 10.0,
        };
        let finding = UnderReplicatedPartitionsCheck::build_finding(&sample, thresholds);
        assert_eq!(finding.status, CheckStatus::Critical);
        assert_eq!(finding.severity, 10);
    }

    #[test]
    fn test_urp_healthy_zero() {
        let sample = sample(&[("broker-1", 0.0), ("broker-2", 0.0)], "local_prometheus_exporter");
        let thresholds = Thresholds {
            warning: 0.0,
            critical: 10.0,
        };
        let finding = UnderReplicatedPartitionsCheck::build_finding(&sample, thresholds);
        assert_eq!(finding.status, CheckStatus::Success);
        assert_eq!(finding.severity, 0);
        assert_eq!(finding.data["nodes_with_urp"], json!(0));
    }

    #[test]
    fn test_classify_count_boundaries() {
        let thresholds = Thresholds {
            warning: 0.0,
            critical: 10.0,
        };
        assert_eq!(classify_count(0.0, thresholds).0, CheckStatus::Success);
        assert_eq!(classify_count(1.0, thresholds).0, CheckStatus::Warning);
        assert_eq!(classify_count(10.0, thresholds).0, CheckStatus::Critical);
    }
}
