//! Write path: one transaction per run. Run row, findings, extracted
//! metrics; commit, or roll back the entire run.

use serde_json::Value;
use tracing::{debug, info};

use super::{TrendStore, TrendStoreError};
use crate::engine::findings::{CheckStatus, FindingAccumulator};
use crate::utilities::json::numeric_at_path;

pub struct RunMetadata {
    pub company: String,
    pub database: String,
    pub host: String,
    pub target_version: Option<String>,
    pub duration_seconds: f64,
}

/// One row in the extraction table: a well-known field of a named check
/// that is worth tracking across runs. Adding an extractor never touches
/// the writer core.
pub struct MetricExtractor {
    pub check: &'static str,
    pub path: &'static [&'static str],
    pub metric: &'static str,
    pub unit: &'static str,
    pub category: &'static str,
    pub description: &'static str,
}

pub const METRIC_EXTRACTORS: &[MetricExtractor] = &[
    MetricExtractor {
        check: "connection_metrics",
        path: &["active_connections"],
        metric: "active_connections",
        unit: "count",
        category: "connections",
        description: "Connections currently established",
    },
    MetricExtractor {
        check: "connection_metrics",
        path: &["max_connections"],
        metric: "max_connections",
        unit: "count",
        category: "connections",
        description: "Configured connection ceiling",
    },
    MetricExtractor {
        check: "under_replicated_partitions",
        path: &["total_urp"],
        metric: "under_replicated_partitions",
        unit: "count",
        category: "replication",
        description: "Partitions with shrunken ISR",
    },
    MetricExtractor {
        check: "offline_partitions",
        path: &["total_offline"],
        metric: "offline_partitions",
        unit: "count",
        category: "availability",
        description: "Partitions without an active leader",
    },
    MetricExtractor {
        check: "memory_usage",
        path: &["cluster_aggregate", "avg_used_pct"],
        metric: "memory_used_pct",
        unit: "percent",
        category: "memory",
        description: "Average memory utilization across nodes",
    },
    MetricExtractor {
        check: "file_descriptors",
        path: &["cluster_aggregate", "max_fd_usage_pct"],
        metric: "fd_usage_pct",
        unit: "percent",
        category: "resources",
        description: "Worst file-descriptor utilization across nodes",
    },
    MetricExtractor {
        check: "consumer_lag",
        path: &["total_lag"],
        metric: "consumer_lag_total",
        unit: "count",
        category: "streaming",
        description: "Messages behind across all consumer groups",
    },
    MetricExtractor {
        check: "cache_hit_ratio",
        path: &["hit_ratio_pct"],
        metric: "cache_hit_ratio",
        unit: "percent",
        category: "cache",
        description: "Buffer cache hit ratio",
    },
    MetricExtractor {
        check: "replication_status",
        path: &["max_lag_seconds"],
        metric: "replication_lag_seconds",
        unit: "seconds",
        category: "replication",
        description: "Worst replica lag",
    },
    MetricExtractor {
        check: "keyspace_stats",
        path: &["total_keys"],
        metric: "total_keys",
        unit: "count",
        category: "keyspace",
        description: "Keys across all databases",
    },
];

pub struct ExtractedMetric {
    pub name: &'static str,
    pub value: f64,
    pub unit: &'static str,
    pub category: &'static str,
    pub description: &'static str,
}

/// Scans known check names for well-known numeric fields.
pub fn extract_metrics(findings: &FindingAccumulator) -> Vec<ExtractedMetric> {
    let mut out = Vec::new();
    for extractor in METRIC_EXTRACTORS {
        let Some(envelope) = findings.get(extractor.check) else {
            continue;
        };
        let Some(value) = numeric_at_path(&envelope.data, extractor.path) else {
            continue;
        };
        out.push(ExtractedMetric {
            name: extractor.metric,
            value,
            unit: extractor.unit,
            category: extractor.category,
            description: extractor.description,
        });
    }
    out
}

/// AI metadata for the run row. The enhanced recommendation finding wins
/// over the plain one; with neither, the analysis was not performed.
pub fn resolve_ai_metadata(findings: &FindingAccumulator) -> (String, Option<String>) {
    for name in ["run_recommendation_enhanced", "run_recommendation"] {
        if let Some(envelope) = findings.get(name) {
            let analysis = &envelope.data["ai_analysis"];
            let status = analysis["status"]
                .as_str()
                .unwrap_or("not_performed")
                .to_string();
            let model = analysis["model"].as_str().map(str::to_string);
            return (status, model);
        }
    }
    ("not_performed".to_string(), None)
}

/// Severity bucket persisted alongside the numeric score.
pub fn severity_level(severity: u8) -> &'static str {
    match severity {
        0..=3 => "healthy",
        4..=7 => "warning",
        _ => "critical",
    }
}

impl TrendStore {
    /// Persists a complete run: run row, every finding, extracted
    /// metrics, all inside one transaction. Any error rolls the whole
    /// run back.
    pub async fn store_run(
        &mut self,
        findings: &FindingAccumulator,
        metadata: &RunMetadata,
    ) -> Result<i32, TrendStoreError> {
        self.ensure_schema().await?;

        let total_checks = findings.len() as i32;
        let successful_checks = findings.count_with_status(CheckStatus::Success) as i32;
        let failed_checks = findings.count_with_status(CheckStatus::Error) as i32;
        let (ai_status, ai_model) = resolve_ai_metadata(findings);

        let schema = self.schema.clone();
        let tx = self
            .client
            .transaction()
            .await
            .map_err(|e| TrendStoreError::Write(e.to_string()))?;

        let insert_run = format!(
            "INSERT INTO {schema}.health_check_runs
             (company, database, host, target_version, total_checks,
              successful_checks, failed_checks, ai_status, ai_model, duration_seconds)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING run_id"
        );
        let row = tx
            .query_one(
                &insert_run,
                &[
                    &metadata.company,
                    &metadata.database,
                    &metadata.host,
                    &metadata.target_version,
                    &total_checks,
                    &successful_checks,
                    &failed_checks,
                    &ai_status,
                    &ai_model,
                    &metadata.duration_seconds,
                ],
            )
            .await
            .map_err(|e| TrendStoreError::Write(e.to_string()))?;
        let run_id: i32 = row.get(0);

        let insert_finding = format!(
            "INSERT INTO {schema}.module_findings
             (run_id, check_name, status, severity_level, severity_score, data_json, error_message)
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        );
        for (name, envelope) in findings.all() {
            tx.execute(
                &insert_finding,
                &[
                    &run_id,
                    &name,
                    &envelope.status.as_str(),
                    &severity_level(envelope.severity),
                    &(envelope.severity as i32),
                    &envelope.data,
                    &envelope.error_message,
                ],
            )
            .await
            .map_err(|e| TrendStoreError::Write(e.to_string()))?;
        }

        let insert_metric = format!(
            "INSERT INTO {schema}.trend_metrics
             (run_id, metric_name, metric_value, metric_unit, metric_category, metric_description)
             VALUES ($1, $2, $3, $4, $5, $6)"
        );
        let metrics = extract_metrics(findings);
        for metric in &metrics {
            tx.execute(
                &insert_metric,
                &[
                    &run_id,
                    &metric.name,
                    &metric.value,
                    &metric.unit,
                    &metric.category,
                    &metric.description,
                ],
            )
            .await
            .map_err(|e| TrendStoreError::Write(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| TrendStoreError::Write(e.to_string()))?;

        debug!("run {}: {} metric(s) extracted", run_id, metrics.len());
        info!(
            "stored health check run {} with {} finding(s)",
            run_id, total_checks
        );
        Ok(run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::findings::FindingEnvelope;
    use serde_json::json;

    fn findings_with(name: &str, data: Value) -> FindingAccumulator {
        let mut acc = FindingAccumulator::new();
        acc.set(name, FindingEnvelope::success("ok", data)).unwrap();
        acc
    }

    #[test]
    fn test_extract_connection_metrics() {
        let acc = findings_with(
            "connection_metrics",
            json!({"active_connections": 42, "max_connections": 100}),
        );
        let metrics = extract_metrics(&acc);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "active_connections");
        assert_eq!(metrics[0].value, 42.0);
        assert_eq!(metrics[1].value, 100.0);
    }

    #[test]
    fn test_extract_nested_path() {
        let acc = findings_with(
            "memory_usage",
            json!({"cluster_aggregate": {"avg_used_pct": 63.5}}),
        );
        let metrics = extract_metrics(&acc);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "memory_used_pct");
        assert_eq!(metrics[0].value, 63.5);
        assert_eq!(metrics[0].unit, "percent");
    }

    #[test]
    fn test_extract_skips_missing_and_non_numeric() {
        let acc = findings_with("connection_metrics", json!({"active_connections": "lots"}));
        assert!(extract_metrics(&acc).is_empty());
    }

    #[test]
    fn test_ai_metadata_enhanced_wins() {
        let mut acc = FindingAccumulator::new();
        acc.set(
            "run_recommendation",
            FindingEnvelope::success(
                "ok",
                json!({"ai_analysis": {"status": "completed", "model": "base-model"}}),
            ),
        )
        .unwrap();
        acc.set(
            "run_recommendation_enhanced",
            FindingEnvelope::success(
                "ok",
                json!({"ai_analysis": {"status": "completed", "model": "enhanced-model"}}),
            ),
        )
        .unwrap();

        let (status, model) = resolve_ai_metadata(&acc);
        assert_eq!(status, "completed");
        assert_eq!(model.as_deref(), Some("enhanced-model"));
    }

    #[test]
    fn test_ai_metadata_defaults_to_not_performed() {
        let acc = FindingAccumulator::new();
        let (status, model) = resolve_ai_metadata(&acc);
        assert_eq!(status, "not_performed");
        assert!(model.is_none());
    }

    #[test]
    fn test_severity_buckets() {
        assert_eq!(severity_level(0), "healthy");
        assert_eq!(severity_level(7), "warning");
        assert_eq!(severity_level(10), "critical");
    }
}
