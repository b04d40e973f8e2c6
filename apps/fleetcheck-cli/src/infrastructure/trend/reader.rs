//! Read path: retrospective trend queries over persisted runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use super::{TrendStore, TrendStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    InsufficientData,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Stable => "stable",
            TrendDirection::InsufficientData => "insufficient_data",
        }
    }
}

/// Half-window comparison: the mean of the second half against the mean
/// of the first. More than +10% is increasing, less than -10% is
/// decreasing; fewer than two points cannot trend.
pub fn classify_trend(values: &[f64]) -> TrendDirection {
    if values.len() < 2 {
        return TrendDirection::InsufficientData;
    }
    let split = values.len() / 2;
    let first_mean: f64 = values[..split].iter().sum::<f64>() / split as f64;
    let second_mean: f64 = values[split..].iter().sum::<f64>() / (values.len() - split) as f64;

    if second_mean > first_mean * 1.1 {
        TrendDirection::Increasing
    } else if second_mean < first_mean * 0.9 {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    }
}

#[derive(Debug, Serialize)]
pub struct RunTrends {
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub avg_duration: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricTrend {
    pub values: Vec<f64>,
    pub unit: Option<String>,
    pub trend: TrendDirection,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Serialize)]
pub struct TrendAnalysis {
    pub runs_analyzed: usize,
    pub time_period_days: i64,
    pub run_trends: RunTrends,
    pub metric_trends: BTreeMap<String, MetricTrend>,
}

fn metric_trend(values: Vec<f64>, unit: Option<String>) -> MetricTrend {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = values.iter().sum::<f64>() / values.len() as f64;
    MetricTrend {
        trend: classify_trend(&values),
        values,
        unit,
        min,
        max,
        avg,
    }
}

impl TrendStore {
    /// Trend analysis over the trailing window: run-level counters plus a
    /// per-metric time series with direction classification.
    pub async fn get_trend_analysis(
        &self,
        days_back: i64,
        metric_names: Option<Vec<String>>,
    ) -> Result<TrendAnalysis, TrendStoreError> {
        let schema = &self.schema;
        let cutoff: DateTime<Utc> = Utc::now() - Duration::days(days_back);

        let runs_query = format!(
            "SELECT run_id, total_checks, successful_checks, failed_checks, duration_seconds
             FROM {schema}.health_check_runs
             WHERE company = $1 AND database = $2 AND timestamp >= $3
             ORDER BY timestamp DESC"
        );
        let runs = self
            .client
            .query(&runs_query, &[&self.company, &self.database, &cutoff])
            .await
            .map_err(|e| TrendStoreError::Read(e.to_string()))?;

        let mut successful_runs = 0;
        let mut failed_runs = 0;
        let mut total_duration = 0.0;
        for row in &runs {
            let total: i32 = row.get(1);
            let successful: i32 = row.get(2);
            let duration: Option<f64> = row.get(4);
            if successful == total {
                successful_runs += 1;
            } else {
                failed_runs += 1;
            }
            total_duration += duration.unwrap_or(0.0);
        }

        let metrics = match metric_names {
            Some(names) => names,
            None => {
                let distinct_query = format!(
                    "SELECT DISTINCT tm.metric_name
                     FROM {schema}.trend_metrics tm
                     JOIN {schema}.health_check_runs hcr ON tm.run_id = hcr.run_id
                     WHERE hcr.company = $1 AND hcr.database = $2 AND hcr.timestamp >= $3"
                );
                self.client
                    .query(&distinct_query, &[&self.company, &self.database, &cutoff])
                    .await
                    .map_err(|e| TrendStoreError::Read(e.to_string()))?
                    .iter()
                    .map(|row| row.get::<_, String>(0))
                    .collect()
            }
        };

        let series_query = format!(
            "SELECT tm.metric_value, tm.metric_unit
             FROM {schema}.trend_metrics tm
             JOIN {schema}.health_check_runs hcr ON tm.run_id = hcr.run_id
             WHERE tm.metric_name = $1
               AND hcr.company = $2 AND hcr.database = $3 AND hcr.timestamp >= $4
             ORDER BY hcr.timestamp"
        );
        let mut metric_trends = BTreeMap::new();
        for metric in metrics {
            let rows = self
                .client
                .query(
                    &series_query,
                    &[&metric, &self.company, &self.database, &cutoff],
                )
                .await
                .map_err(|e| TrendStoreError::Read(e.to_string()))?;

            let values: Vec<f64> = rows
                .iter()
                .filter_map(|row| row.get::<_, Option<f64>>(0))
                .collect();
            if values.is_empty() {
                continue;
            }
            let unit: Option<String> = rows.first().and_then(|row| row.get(1));
            metric_trends.insert(metric, metric_trend(values, unit));
        }

        Ok(TrendAnalysis {
            runs_analyzed: runs.len(),
            time_period_days: days_back,
            run_trends: RunTrends {
                total_runs: runs.len(),
                successful_runs,
                failed_runs,
                avg_duration: if runs.is_empty() {
                    0.0
                } else {
                    total_duration / runs.len() as f64
                },
            },
            metric_trends,
        })
    }

    /// Findings of one persisted run, in insertion order, for
    /// retrospective comparison.
    pub async fn get_run_findings(
        &self,
        run_id: i32,
    ) -> Result<Vec<(String, Value)>, TrendStoreError> {
        let query = format!(
            "SELECT check_name, data_json
             FROM {}.module_findings
             WHERE run_id = $1
             ORDER BY finding_id",
            self.schema
        );
        let rows = self
            .client
            .query(&query, &[&run_id])
            .await
            .map_err(|e| TrendStoreError::Read(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<_, String>(0),
                    row.get::<_, Option<Value>>(1).unwrap_or(Value::Null),
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_directions() {
        assert_eq!(classify_trend(&[100.0, 112.0]), TrendDirection::Increasing);
        assert_eq!(classify_trend(&[100.0, 108.0]), TrendDirection::Stable);
        assert_eq!(classify_trend(&[100.0, 95.0]), TrendDirection::Stable);
        assert_eq!(classify_trend(&[100.0, 85.0]), TrendDirection::Decreasing);
    }

    #[test]
    fn test_classifier_insufficient_data() {
        assert_eq!(classify_trend(&[]), TrendDirection::InsufficientData);
        assert_eq!(classify_trend(&[5.0]), TrendDirection::InsufficientData);
    }

    #[test]
    fn test_classifier_odd_length_split() {
        // First half is len/2 elements, second half takes the remainder.
        assert_eq!(
            classify_trend(&[10.0, 10.0, 20.0]),
            TrendDirection::Increasing,
            "split of a 3-point series is 1 | 2"
        );
    }

    #[test]
    fn test_connection_series_from_acceptance_vector() {
        let values = [50.0, 51.0, 49.0, 52.0, 50.0, 70.0, 71.0, 72.0, 71.0, 73.0];
        assert_eq!(classify_trend(&values), TrendDirection::Increasing);

        let trend = metric_trend(values.to_vec(), Some("count".to_string()));
        assert_eq!(trend.min, 49.0);
        assert_eq!(trend.max, 73.0);
        assert!((trend.avg - 60.9).abs() < 0.05);
        assert_eq!(trend.values.len(), 10);
    }
}
