//! PostgreSQL checks: server overview, connection pressure, cache
//! efficiency, and replication health from the catalog.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::check::{Check, CheckContext, CheckOutput};
use crate::engine::findings::{FindingEnvelope, SEVERITY_CRITICAL, SEVERITY_WARNING};
use crate::engine::operation::OperationRequest;
use crate::engine::topology::NodeRole;
use crate::engine::EngineError;
use crate::report::formatter::FragmentBuilder;

pub struct OverviewCheck;

#[async_trait]
impl Check for OverviewCheck {
    fn name(&self) -> &'static str {
        "postgres_overview"
    }

    fn weight(&self) -> u8 {
        8
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let op = OperationRequest::native(
            "SELECT version() AS version,
                    current_database() AS database,
                    pg_postmaster_start_time()::text AS started_at,
                    EXTRACT(EPOCH FROM (now() - pg_postmaster_start_time()))::float8 AS uptime_seconds,
                    pg_database_size(current_database()) AS database_size_bytes",
        );
        let result = ctx.connector.execute_operation(&op).await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Server Overview");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("overview query failed: {failure}")),
            ));
        };
        let row = rows.first().cloned().unwrap_or_default();

        builder.text(result.rendered.clone()).blank();

        let instances = ctx.connector.topology().instance_count();
        let capabilities = ctx.connector.capabilities();
        builder.text(format!(
            "Cluster members: {instances} | pg_stat_statements: {} | track_io_timing: {}",
            if capabilities.has_pgstat { "available" } else { "absent" },
            if capabilities.has_io_timing { "on" } else { "off" },
        ));

        let data = json!({
            "version": row.get("version").cloned().unwrap_or(Value::Null),
            "database": row.get("database").cloned().unwrap_or(Value::Null),
            "uptime_seconds": row.get("uptime_seconds").cloned().unwrap_or(Value::Null),
            "database_size_bytes": row.get("database_size_bytes").cloned().unwrap_or(Value::Null),
            "instance_count": instances,
            "has_pgstat": capabilities.has_pgstat,
            "has_io_timing": capabilities.has_io_timing,
        });

        Ok(CheckOutput::new(
            builder.build(),
            FindingEnvelope::success("server reachable", data)
                .with_collection_method("native_query"),
        ))
    }
}

pub struct ConnectionMetricsCheck;

#[async_trait]
impl Check for ConnectionMetricsCheck {
    fn name(&self) -> &'static str {
        "connection_metrics"
    }

    fn weight(&self) -> u8 {
        8
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let warning = ctx.threshold("postgres_connections_warning", 80.0);
        let critical = ctx.threshold("postgres_connections_critical", 90.0);

        let op = OperationRequest::native(
            "SELECT
                (SELECT count(*) FROM pg_stat_activity)::int8 AS active_connections,
                (SELECT count(*) FROM pg_stat_activity WHERE state = 'idle in transaction')::int8
                    AS idle_in_transaction,
                current_setting('max_connections')::int8 AS max_connections",
        );
        let result = ctx.connector.execute_operation(&op).await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Connection Metrics");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("connection query failed: {failure}")),
            ));
        };
        let row = rows.first().cloned().unwrap_or_default();

        let active = row
            .get("active_connections")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let idle_in_tx = row
            .get("idle_in_transaction")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let max = row
            .get("max_connections")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let utilization = if max > 0 {
            active as f64 / max as f64 * 100.0
        } else {
            0.0
        };

        builder.text(result.rendered.clone()).blank();

        let data = json!({
            "active_connections": active,
            "idle_in_transaction": idle_in_tx,
            "max_connections": max,
            "utilization_pct": utilization,
            "thresholds": {"warning": warning, "critical": critical},
        });

        let finding = if utilization >= critical {
            builder.critical(&format!(
                "Connections at {utilization:.1}% of max_connections ({active}/{max})"
            ));
            FindingEnvelope::critical(
                SEVERITY_CRITICAL,
                format!("connections at {utilization:.1}% of limit"),
                data,
            )
        } else if utilization >= warning {
            builder.warning(&format!(
                "Connections at {utilization:.1}% of max_connections ({active}/{max})"
            ));
            FindingEnvelope::warning(
                SEVERITY_WARNING,
                format!("connections at {utilization:.1}% of limit"),
                data,
            )
        } else {
            builder.note(&format!("{active} of {max} connections in use"));
            FindingEnvelope::success(format!("{active} of {max} connections in use"), data)
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding.with_collection_method("native_query"),
        ))
    }
}

pub struct CacheHitRatioCheck;

#[async_trait]
impl Check for CacheHitRatioCheck {
    fn name(&self) -> &'static str {
        "cache_hit_ratio"
    }

    fn weight(&self) -> u8 {
        6
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let warning = ctx.threshold("postgres_cache_warning", 95.0);
        let critical = ctx.threshold("postgres_cache_critical", 90.0);

        let op = OperationRequest::native_with_params(
            "SELECT
                CASE WHEN (blks_hit + blks_read) = 0 THEN 100.0
                     ELSE (blks_hit::float8 / (blks_hit + blks_read) * 100.0)
                END AS hit_ratio_pct,
                blks_hit, blks_read
             FROM pg_stat_database
             WHERE datname = $1",
            vec![json!(ctx.settings.database.as_str())],
        );
        let result = ctx.connector.execute_operation(&op).await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Cache Hit Ratio");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("cache query failed: {failure}")),
            ));
        };
        let row = rows.first().cloned().unwrap_or_default();
        let ratio = row
            .get("hit_ratio_pct")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let data = json!({
            "hit_ratio_pct": ratio,
            "blks_hit": row.get("blks_hit").cloned().unwrap_or(Value::Null),
            "blks_read": row.get("blks_read").cloned().unwrap_or(Value::Null),
            "thresholds": {"warning_below": warning, "critical_below": critical},
        });

        // Lower is worse here; the thresholds are floors.
        let finding = if ratio < critical {
            builder.critical(&format!("Cache hit ratio {ratio:.2}% (expected > {warning}%)"));
            FindingEnvelope::critical(8, format!("cache hit ratio {ratio:.2}%"), data)
        } else if ratio < warning {
            builder.warning(&format!("Cache hit ratio {ratio:.2}% (expected > {warning}%)"));
            FindingEnvelope::warning(5, format!("cache hit ratio {ratio:.2}%"), data)
        } else {
            builder.note(&format!("Cache hit ratio {ratio:.2}%"));
            FindingEnvelope::success(format!("cache hit ratio {ratio:.2}%"), data)
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding.with_collection_method("native_query"),
        ))
    }
}

pub struct CloudCpuMetricsCheck;

#[async_trait]
impl Check for CloudCpuMetricsCheck {
    fn name(&self) -> &'static str {
        "cloud_cpu_metrics"
    }

    fn weight(&self) -> u8 {
        5
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let mut builder = FragmentBuilder::new();
        builder.h3("Cloud CPU Metrics");

        let cloud = ctx.connector.cloud();
        let aws = cloud.and_then(|c| c.aws.as_ref());
        let azure = cloud.and_then(|c| c.azure.as_ref());
        if aws.is_none() && azure.is_none() {
            builder.important(
                "This check reads provider metrics and needs cloud access.\n\n\
                 Configure `aws_region` (and credentials if the instance profile\n\
                 does not provide them), or the `azure_*` settings.",
            );
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::skipped(
                    "cloud metrics not configured",
                    &["aws_region", "aws_access_key_id", "aws_secret_access_key"],
                ),
            ));
        }

        let warning = ctx.threshold("postgres_cpu_warning", 75.0);
        let critical = ctx.threshold("postgres_cpu_critical", 90.0);
        let collection_method = if aws.is_some() { "cloudwatch" } else { "azure_monitor" };

        let mut per_instance = Vec::new();
        let mut worst: f64 = 0.0;
        if let Some(aws) = aws {
            for node in ctx.connector.topology().instances() {
                match aws
                    .metric_average(
                        "AWS/RDS",
                        "CPUUtilization",
                        "DBInstanceIdentifier",
                        &node.id,
                        60,
                    )
                    .await
                {
                    Ok(Some(cpu)) => {
                        worst = worst.max(cpu);
                        per_instance.push(json!({
                            "instance_id": node.id,
                            "role": node.role,
                            "cpu_avg_pct": cpu,
                        }));
                    }
                    Ok(None) => per_instance.push(json!({
                        "instance_id": node.id,
                        "error": "no datapoints in the trailing hour",
                    })),
                    Err(e) => per_instance.push(json!({
                        "instance_id": node.id,
                        "error": e.to_string(),
                    })),
                }
            }
        } else if let Some(azure) = azure {
            // Azure Monitor scopes the metric to the configured resource.
            match azure.metric_average("cpu_percent", 60).await {
                Ok(Some(cpu)) => {
                    worst = cpu;
                    per_instance.push(json!({
                        "instance_id": ctx.settings.host,
                        "cpu_avg_pct": cpu,
                    }));
                }
                Ok(None) => per_instance.push(json!({
                    "instance_id": ctx.settings.host,
                    "error": "no datapoints in the trailing hour",
                })),
                Err(e) => per_instance.push(json!({
                    "instance_id": ctx.settings.host,
                    "error": e.to_string(),
                })),
            }
        }

        if per_instance.is_empty() {
            builder.note("No instance-type nodes to query.");
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::unavailable("no instances in topology"),
            ));
        }

        let data = json!({
            "per_instance": per_instance,
            "max_cpu_pct": worst,
            "window_minutes": 60,
            "thresholds": {"warning": warning, "critical": critical},
        });

        let finding = if worst >= critical {
            builder.critical(&format!("CPU at {worst:.1}% on at least one instance"));
            FindingEnvelope::critical(SEVERITY_CRITICAL, format!("CPU at {worst:.1}%"), data)
        } else if worst >= warning {
            builder.warning(&format!("CPU at {worst:.1}% on at least one instance"));
            FindingEnvelope::warning(SEVERITY_WARNING, format!("CPU at {worst:.1}%"), data)
        } else {
            builder.note(&format!("CPU healthy, worst hourly average {worst:.1}%"));
            FindingEnvelope::success(format!("CPU healthy, worst {worst:.1}%"), data)
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding.with_collection_method(collection_method),
        ))
    }
}

pub struct ReplicationStatusCheck;

#[async_trait]
impl Check for ReplicationStatusCheck {
    fn name(&self) -> &'static str {
        "replication_status"
    }

    fn weight(&self) -> u8 {
        7
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let warning = ctx.threshold("postgres_replication_lag_warning", 30.0);
        let critical = ctx.threshold("postgres_replication_lag_critical", 300.0);

        // replay_lag is per-walsender and populated on the primary;
        // NULL means the replica is idle and fully caught up.
        let op = OperationRequest::native(
            "SELECT client_addr::text AS replica,
                    state,
                    sync_state,
                    COALESCE(EXTRACT(EPOCH FROM replay_lag)::float8, 0) AS lag_seconds
             FROM pg_stat_replication
             WHERE client_addr IS NOT NULL",
        );
        let result = ctx.connector.execute_operation(&op).await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Replication Status");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("replication query failed: {failure}")),
            ));
        };

        let readers = ctx
            .connector
            .topology()
            .instances()
            .filter(|n| n.role == NodeRole::Reader)
            .count();

        if rows.is_empty() {
            builder.note("No streaming replicas attached to this server.");
            let data = json!({
                "replica_count": 0,
                "topology_readers": readers,
                "max_lag_seconds": 0.0,
            });
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::success("no streaming replicas", data)
                    .with_collection_method("native_query"),
            ));
        }

        let max_lag = rows
            .iter()
            .filter_map(|row| row.get("lag_seconds").and_then(Value::as_f64))
            .fold(0.0f64, f64::max);
        let streaming = rows
            .iter()
            .filter(|row| row.get("state").and_then(Value::as_str) == Some("streaming"))
            .count();

        builder.text(result.rendered.clone()).blank();

        let data = json!({
            "replica_count": rows.len(),
            "streaming_replicas": streaming,
            "topology_readers": readers,
            "max_lag_seconds": max_lag,
            "replicas": rows,
            "thresholds": {"warning": warning, "critical": critical},
        });

        let finding = if max_lag >= critical || streaming < rows.len() {
            builder.critical(&format!(
                "Replication degraded: {streaming}/{} streaming, worst lag {max_lag:.1}s",
                rows.len()
            ));
            FindingEnvelope::critical(
                9,
                format!("replication degraded, worst lag {max_lag:.1}s"),
                data,
            )
        } else if max_lag >= warning {
            builder.warning(&format!("Replica lag at {max_lag:.1}s"));
            FindingEnvelope::warning(SEVERITY_WARNING, format!("replica lag {max_lag:.1}s"), data)
        } else {
            builder.note(&format!(
                "{} replica(s) streaming, worst lag {max_lag:.1}s",
                rows.len()
            ));
            FindingEnvelope::success(
                format!("{} replica(s) streaming", rows.len()),
                data,
            )
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding.with_collection_method("native_query"),
        ))
    }
}
