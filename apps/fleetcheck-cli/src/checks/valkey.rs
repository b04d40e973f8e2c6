//! Valkey checks: memory pressure out of `INFO memory`, keyspace volume
//! out of `INFO keyspace`.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::check::{Check, CheckContext, CheckOutput};
use crate::engine::findings::{FindingEnvelope, SEVERITY_CRITICAL, SEVERITY_WARNING};
use crate::engine::operation::{OperationRequest, Row};
use crate::engine::EngineError;
use crate::report::formatter::FragmentBuilder;
use crate::utilities::units::format_bytes;

pub struct MemoryUsageCheck;

#[async_trait]
impl Check for MemoryUsageCheck {
    fn name(&self) -> &'static str {
        "memory_usage"
    }

    fn weight(&self) -> u8 {
        8
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let warning = ctx.threshold("valkey_memory_warning", 80.0);
        let critical = ctx.threshold("valkey_memory_critical", 90.0);

        let op = OperationRequest::native("INFO memory");
        let result = ctx.connector.execute_operation(&op).await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Memory Usage");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("INFO memory failed: {failure}")),
            ));
        };
        let info = rows.first().cloned().unwrap_or_default();

        let used = info.get("used_memory").and_then(Value::as_i64).unwrap_or(0);
        let maxmemory = info.get("maxmemory").and_then(Value::as_i64).unwrap_or(0);
        let fragmentation = info
            .get("mem_fragmentation_ratio")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let mut data = json!({
            "used_memory_bytes": used,
            "maxmemory_bytes": maxmemory,
            "mem_fragmentation_ratio": fragmentation,
            "thresholds": {"warning": warning, "critical": critical},
        });

        let usage = format!(
            "{} of {}",
            format_bytes(used.max(0) as u64),
            format_bytes(maxmemory.max(0) as u64)
        );
        let finding = if maxmemory > 0 {
            let used_pct = used as f64 / maxmemory as f64 * 100.0;
            data["used_pct"] = json!(used_pct);
            if used_pct >= critical {
                builder.critical(&format!(
                    "Memory at {used_pct:.1}% of maxmemory ({usage}); eviction or OOM imminent"
                ));
                FindingEnvelope::critical(
                    SEVERITY_CRITICAL,
                    format!("memory at {used_pct:.1}% of maxmemory"),
                    data,
                )
            } else if used_pct >= warning {
                builder.warning(&format!("Memory at {used_pct:.1}% of maxmemory"));
                FindingEnvelope::warning(
                    SEVERITY_WARNING,
                    format!("memory at {used_pct:.1}% of maxmemory"),
                    data,
                )
            } else {
                builder.note(&format!("Memory at {used_pct:.1}% of maxmemory"));
                FindingEnvelope::success(format!("memory at {used_pct:.1}% of maxmemory"), data)
            }
        } else {
            builder.note(&format!(
                "maxmemory is 0 (unbounded); {} in use.",
                format_bytes(used.max(0) as u64)
            ));
            FindingEnvelope::success(
                format!("{} in use, maxmemory unbounded", format_bytes(used.max(0) as u64)),
                data,
            )
        };

        Ok(CheckOutput::new(
            builder.build(),
            finding.with_collection_method("native_query"),
        ))
    }
}

pub struct KeyspaceStatsCheck;

/// `INFO keyspace` rows look like `db0:keys=100,expires=20,avg_ttl=0`.
pub(crate) fn parse_keyspace(info: &Row) -> (i64, Vec<Value>) {
    let mut total_keys = 0;
    let mut per_db = Vec::new();
    for (key, value) in info {
        if !key.starts_with("db") || !key[2..].chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Some(raw) = value.as_str() else { continue };
        let mut keys = 0;
        let mut expires = 0;
        for pair in raw.split(',') {
            match pair.split_once('=') {
                Some(("keys", v)) => keys = v.parse::<i64>().unwrap_or(0),
                Some(("expires", v)) => expires = v.parse::<i64>().unwrap_or(0),
                _ => {}
            }
        }
        total_keys += keys;
        per_db.push(json!({"db": key, "keys": keys, "expires": expires}));
    }
    (total_keys, per_db)
}

#[async_trait]
impl Check for KeyspaceStatsCheck {
    fn name(&self) -> &'static str {
        "keyspace_stats"
    }

    fn weight(&self) -> u8 {
        5
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let op = OperationRequest::native("INFO keyspace");
        let result = ctx.connector.execute_operation(&op).await;

        let mut builder = FragmentBuilder::new();
        builder.h3("Keyspace");

        let Some(rows) = result.rows() else {
            let failure = result.failure().map(|f| f.error.clone()).unwrap_or_default();
            builder.error(&failure);
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::error(format!("INFO keyspace failed: {failure}")),
            ));
        };
        let info = rows.first().cloned().unwrap_or_default();
        let (total_keys, per_db) = parse_keyspace(&info);

        if per_db.is_empty() {
            builder.note("No keyspaces hold data on this server.");
            return Ok(CheckOutput::new(
                builder.build(),
                FindingEnvelope::not_applicable("no keyspaces with data")
                    .with_collection_method("native_query"),
            ));
        }

        builder.note(&format!(
            "{} key(s) across {} database(s)",
            total_keys,
            per_db.len()
        ));

        let data = json!({
            "total_keys": total_keys,
            "database_count": per_db.len(),
            "per_db": per_db,
        });

        Ok(CheckOutput::new(
            builder.build(),
            FindingEnvelope::success(format!("{total_keys} key(s)"), data)
                .with_collection_method("native_query"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keyspace() {
        let mut info = Row::new();
        info.insert("db0".into(), json!("keys=100,expires=20,avg_ttl=0"));
        info.insert("db2".into(), json!("keys=50,expires=0,avg_ttl=0"));
        info.insert("dbsize".into(), json!("ignored"));
        let (total, per_db) = parse_keyspace(&info);
        assert_eq!(total, 150);
        assert_eq!(per_db.len(), 2);
        assert_eq!(per_db[0]["keys"], json!(100));
    }
}
