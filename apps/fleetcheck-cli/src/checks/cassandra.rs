//! Cassandra checks: ring status via nodetool (driver topology as the
//! fallback) and thread-pool pressure via tpstats.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::check::{Check, CheckContext, CheckOutput};
use crate::engine::findings::{FindingEnvelope, SEVERITY_WARNING};
use crate::engine::operation::OperationRequest;
use crate::engine::EngineError;
use crate::report::formatter::FragmentBuilder;

pub struct ClusterStatusCheck;

#[async_trait]
impl Check for ClusterStatusCheck {
    fn name(&self) -> &'static str {
        "cluster_status"
    }

    fn weight(&self) -> u8 {
        9
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let mut builder = FragmentBuilder::new();
        builder.h3("Cluster Status");

        let driver_nodes = ctx.connector.topology().instance_count();

        if ctx.connector.ssh().is_none() {
            // Driver metadata still answers membership when nodetool is
            // out of reach.
            builder.note(&format!(
                "{driver_nodes} node(s) known to the driver; nodetool status requires SSH for per-node state."
            ));
            let data = json!({
                "node_count": driver_nodes,
                "down_count": 0,
                "source": "driver_metadata",
            });
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::success(format!("{driver_nodes} node(s) in cluster"), data)
                    .with_collection_method("driver_metadata")
                    .with_node_count(driver_nodes),
            ));
        }

        let op = OperationRequest::nodetool("status");
        let result = ctx.connector.execute_operation(&op).await;

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("nodetool status failed: {failure}")),
            ));
        };

        let down: Vec<&str> = rows
            .iter()
            .filter(|row| row.get("status").and_then(Value::as_str) == Some("D"))
            .filter_map(|row| row.get("address").and_then(Value::as_str))
            .collect();

        builder.text(result.rendered.clone()).blank();

        let data = json!({
            "node_count": rows.len(),
            "down_count": down.len(),
            "down_nodes": down,
            "driver_node_count": driver_nodes,
            "nodes": rows,
            "source": "nodetool_status",
        });

        let finding = if !down.is_empty() {
            builder.critical(&format!("{} node(s) down: {}", down.len(), down.join(", ")));
            FindingEnvelope::critical(
                10,
                format!("{} node(s) down", down.len()),
                data,
            )
        } else if rows.len() != driver_nodes && driver_nodes > 0 {
            builder.warning(&format!(
                "nodetool reports {} node(s) but the driver sees {driver_nodes}",
                rows.len()
            ));
            FindingEnvelope::warning(
                SEVERITY_WARNING,
                "membership views disagree".to_string(),
                data,
            )
        } else {
            builder.note(&format!("All {} node(s) up", rows.len()));
            FindingEnvelope::success(format!("all {} node(s) up", rows.len()), data)
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding
                .with_collection_method("nodetool")
                .with_node_count(rows.len()),
        ))
    }
}

pub struct ThreadPoolsCheck;

#[async_trait]
impl Check for ThreadPoolsCheck {
    fn name(&self) -> &'static str {
        "thread_pools"
    }

    fn weight(&self) -> u8 {
        6
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        if ctx.connector.ssh().is_none() {
            return Ok(super::ssh_skip_output("Thread Pools"));
        }

        let pending_warning = ctx.threshold("cassandra_pending_warning", 100.0);

        // Pool pressure is per node; fan the command out across the ring.
        let op = OperationRequest::nodetool_cluster("tpstats");
        let result = ctx.connector.execute_operation(&op).await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Thread Pools");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("nodetool tpstats failed: {failure}")),
            ));
        };

        let label = |row: &crate::engine::operation::Row| {
            let node = row.get("node_id").and_then(Value::as_str).unwrap_or("?");
            let pool = row.get("pool_name").and_then(Value::as_str).unwrap_or("?");
            format!("{node}/{pool}")
        };
        let blocked: Vec<String> = rows
            .iter()
            .filter(|row| row.get("blocked").and_then(Value::as_i64).unwrap_or(0) > 0)
            .map(label)
            .collect();
        let backed_up: Vec<String> = rows
            .iter()
            .filter(|row| {
                row.get("pending").and_then(Value::as_i64).unwrap_or(0)
                    > pending_warning as i64
            })
            .map(label)
            .collect();

        builder.text(result.rendered.clone()).blank();

        let data = json!({
            "pool_count": rows.len(),
            "blocked_pools": blocked,
            "backed_up_pools": backed_up,
            "pools": rows,
            "pending_warning": pending_warning,
        });

        let finding = if !blocked.is_empty() {
            builder.warning(&format!("Blocked thread pool(s): {}", blocked.join(", ")));
            FindingEnvelope::warning(
                8,
                format!("{} blocked thread pool(s)", blocked.len()),
                data,
            )
        } else if !backed_up.is_empty() {
            builder.warning(&format!(
                "Pending tasks above {pending_warning} in: {}",
                backed_up.join(", ")
            ));
            FindingEnvelope::warning(
                SEVERITY_WARNING,
                format!("{} pool(s) backed up", backed_up.len()),
                data,
            )
        } else {
            builder.note(&format!("{} thread pool(s) healthy", rows.len()));
            FindingEnvelope::success(format!("{} thread pool(s) healthy", rows.len()), data)
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding.with_collection_method("nodetool"),
        ))
    }
}
