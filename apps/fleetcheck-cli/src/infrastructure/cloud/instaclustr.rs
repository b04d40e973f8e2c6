//! Managed-service (Instaclustr) API accessors: cluster details for
//! topology and the Prometheus metrics endpoint for adaptive collection.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{CloudError, DEFAULT_CLOUD_TIMEOUT_SECS};
use crate::utilities::retry::{with_backoff, DEFAULT_MAX_ATTEMPTS};

const BASE_URL: &str = "https://api.instaclustr.com";

/// Labels tried, in order, when attributing a Prometheus sample to a node.
const NODE_LABELS: &[&str] = &["node_id", "broker", "instance", "node"];

pub struct InstaclustrApi {
    client: reqwest::Client,
    base_url: String,
    cluster_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterDetails {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "dataCentres")]
    pub data_centres: Vec<DataCentre>,
    #[serde(default)]
    pub nodes: Vec<ClusterNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataCentre {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    #[serde(default, rename = "publicAddress")]
    pub public_address: Option<String>,
    #[serde(default, rename = "privateAddress")]
    pub private_address: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub rack: Option<String>,
}

impl InstaclustrApi {
    pub fn new(api_key: &str, cluster_id: &str) -> Result<Self, CloudError> {
        Self::with_base_url(api_key, cluster_id, BASE_URL)
    }

    pub fn with_base_url(
        api_key: &str,
        cluster_id: &str,
        base_url: &str,
    ) -> Result<Self, CloudError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| CloudError::Request(e.to_string()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(DEFAULT_CLOUD_TIMEOUT_SECS))
            .build()
            .map_err(|e| CloudError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cluster_id: cluster_id.to_string(),
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn get_text(&self, url: &str) -> Result<String, CloudError> {
        with_backoff("managed-service API", DEFAULT_MAX_ATTEMPTS, || async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        CloudError::Timeout(e.to_string())
                    } else {
                        CloudError::Request(e.to_string())
                    }
                })?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| CloudError::Request(e.to_string()))?;
            if !status.is_success() {
                return Err(CloudError::from_status(
                    status.as_u16(),
                    body.chars().take(200).collect::<String>(),
                ));
            }
            Ok(body)
        })
        .await
    }

    /// Cluster membership and status from the cluster-management API.
    pub async fn cluster_details(&self) -> Result<ClusterDetails, CloudError> {
        let url = format!(
            "{}/cluster-management/v2/resources/clusters/{}",
            self.base_url, self.cluster_id
        );
        let body = self.get_text(&url).await?;
        serde_json::from_str(&body).map_err(|e| CloudError::Parse(e.to_string()))
    }

    /// One call to the monitoring endpoint returns per-node values for a
    /// metric in Prometheus exposition format.
    pub async fn fetch_node_metric(
        &self,
        metric: &str,
    ) -> Result<BTreeMap<String, f64>, CloudError> {
        let url = format!(
            "{}/monitoring/v2/clusters/{}/metrics?metrics={}&format=prometheus",
            self.base_url, self.cluster_id, metric
        );
        let body = self.get_text(&url).await?;
        let values = parse_prometheus_node_values(&body, metric)?;
        debug!(
            "managed-service endpoint returned {} node value(s) for {}",
            values.len(),
            metric
        );
        Ok(values)
    }
}

fn sample_value(value: &prometheus_parse::Value) -> Option<f64> {
    match value {
        prometheus_parse::Value::Counter(v)
        | prometheus_parse::Value::Gauge(v)
        | prometheus_parse::Value::Untyped(v) => Some(*v),
        _ => None,
    }
}

/// Extracts `{node id -> value}` for one metric from Prometheus exposition
/// text. Sample attribution prefers an explicit node label over the
/// scrape instance.
pub fn parse_prometheus_node_values(
    body: &str,
    metric: &str,
) -> Result<BTreeMap<String, f64>, CloudError> {
    let scrape =
        prometheus_parse::Scrape::parse(body.lines().map(|l| std::io::Result::Ok(l.to_string())))
            .map_err(|e| CloudError::Parse(e.to_string()))?;

    let mut values = BTreeMap::new();
    for (index, sample) in scrape
        .samples
        .iter()
        .filter(|s| s.metric == metric)
        .enumerate()
    {
        let Some(value) = sample_value(&sample.value) else {
            continue;
        };
        let node = NODE_LABELS
            .iter()
            .find_map(|label| sample.labels.get(label))
            .map(|v| v.to_string())
            .unwrap_or_else(|| format!("sample-{index}"));
        values.insert(node, value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prometheus_node_values_by_label() {
        let body = "\
# TYPE kafka_under_replicated_partitions gauge
kafka_under_replicated_partitions{node_id=\"broker-1\"} 5
kafka_under_replicated_partitions{node_id=\"broker-2\"} 0
kafka_under_replicated_partitions{node_id=\"broker-3\"} 0
other_metric{node_id=\"broker-1\"} 99
";
        let values =
            parse_prometheus_node_values(body, "kafka_under_replicated_partitions").unwrap();
        assert_eq!(values.len(), 3, "only samples for the requested metric");
        assert_eq!(values["broker-1"], 5.0);
        assert_eq!(values["broker-2"], 0.0);
    }

    #[test]
    fn test_parse_prometheus_falls_back_to_instance_label() {
        let body = "up{instance=\"10.0.1.5:7500\"} 1\n";
        let values = parse_prometheus_node_values(body, "up").unwrap();
        assert_eq!(values["10.0.1.5:7500"], 1.0);
    }

    #[test]
    fn test_cluster_details_deserialization() {
        let body = r#"{
            "id": "c-123",
            "name": "prod-kafka",
            "status": "RUNNING",
            "dataCentres": [{"name": "AWS_VPC_US_EAST_1"}],
            "nodes": [
                {"id": "n-1", "publicAddress": "1.2.3.4", "privateAddress": "10.0.1.4", "status": "RUNNING", "rack": "us-east-1a"}
            ]
        }"#;
        let details: ClusterDetails = serde_json::from_str(body).unwrap();
        assert_eq!(details.nodes.len(), 1);
        assert_eq!(details.nodes[0].private_address.as_deref(), Some("10.0.1.4"));
    }
}
