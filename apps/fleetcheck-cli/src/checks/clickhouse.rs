//! ClickHouse checks: server overview and part-count pressure per
//! partition (excessive active parts degrade reads and signal a merge
//! backlog).

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::check::{Check, CheckContext, CheckOutput};
use crate::engine::findings::{FindingEnvelope, SEVERITY_WARNING};
use crate::engine::operation::OperationRequest;
use crate::engine::EngineError;
use crate::report::formatter::FragmentBuilder;

pub struct OverviewCheck;

#[async_trait]
impl Check for OverviewCheck {
    fn name(&self) -> &'static str {
        "clickhouse_overview"
    }

    fn weight(&self) -> u8 {
        8
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let op = OperationRequest::native(
            "SELECT version() AS version,
                    uptime() AS uptime_seconds,
                    (SELECT count() FROM system.databases) AS database_count,
                    (SELECT count() FROM system.tables WHERE database NOT IN ('system', 'INFORMATION_SCHEMA', 'information_schema')) AS table_count",
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
        builder.text(format!(
            "Cluster members: {}",
            ctx.connector.topology().instance_count()
        ));

        let data = json!({
            "version": row.get("version").cloned().unwrap_or(Value::Null),
            "uptime_seconds": row.get("uptime_seconds").cloned().unwrap_or(Value::Null),
            "database_count": row.get("database_count").cloned().unwrap_or(Value::Null),
            "table_count": row.get("table_count").cloned().unwrap_or(Value::Null),
            "instance_count": ctx.connector.topology().instance_count(),
        });

        Ok(CheckOutput::new(
            builder.build(),
            FindingEnvelope::success("server reachable", data)
                .with_collection_method("native_query"),
        ))
    }
}

pub struct ExcessivePartsCheck;

#[async_trait]
impl Check for ExcessivePartsCheck {
    fn name(&self) -> &'static str {
        "excessive_parts"
    }

    fn weight(&self) -> u8 {
        7
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let warning = ctx.threshold("clickhouse_parts_warning", 100.0);
        let critical = ctx.threshold("clickhouse_parts_critical", 300.0);

        let query = format!(
            "SELECT database, table, partition,
                    count() AS part_count,
                    sum(rows) AS total_rows,
                    sum(bytes_on_disk) AS total_bytes
             FROM system.parts
             WHERE active = 1
             GROUP BY database, table, partition
             HAVING part_count > {}
             ORDER BY part_count DESC
             LIMIT 50",
            warning as i64
        );
        let result = ctx
            .connector
            .execute_operation(&OperationRequest::native(query))
            .await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Data Parts per Partition");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("parts query failed: {failure}")),
            ));
        };

        if rows.is_empty() {
            builder.note(&format!("No partition exceeds {} active parts.", warning as i64));
            let data = json!({
                "partitions_over_warning": 0,
                "partitions_over_critical": 0,
                "warning_threshold": warning,
                "critical_threshold": critical,
            });
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::success("part counts healthy", data)
                    .with_collection_method("native_query"),
            ));
        }

        let part_count = |row: &crate::engine::operation::Row| {
            row.get("part_count")
                .and_then(Value::as_i64)
                .or_else(|| {
                    // ClickHouse serializes UInt64 as strings in JSON output.
                    row.get("part_count")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse::<i64>().ok())
                })
                .unwrap_or(0)
        };
        let over_critical = rows
            .iter()
            .filter(|row| part_count(row) > critical as i64)
            .count();

        builder.text(result.rendered.clone()).blank();

        let data = json!({
            "partitions_over_warning": rows.len(),
            "partitions_over_critical": over_critical,
            "warning_threshold": warning,
            "critical_threshold": critical,
            "partitions": rows,
        });

        let finding = if over_critical > 0 {
            builder.critical(&format!(
                "{over_critical} partition(s) above {} active parts; merges are not keeping up",
                critical as i64
            ));
            FindingEnvelope::critical(
                9,
                format!("{over_critical} partition(s) with excessive parts"),
                data,
            )
        } else {
            builder.warning(&format!(
                "{} partition(s) above {} active parts",
                rows.len(),
                warning as i64
            ));
            FindingEnvelope::warning(
                SEVERITY_WARNING,
                format!("{} partition(s) with elevated part counts", rows.len()),
                data,
            )
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding.with_collection_method("native_query"),
        ))
    }
}
