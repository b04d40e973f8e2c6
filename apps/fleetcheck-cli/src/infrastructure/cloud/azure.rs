//! Azure Monitor accessors over the management REST API with
//! client-credentials auth.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::{CloudError, DEFAULT_CLOUD_TIMEOUT_SECS};
use crate::utilities::retry::{with_backoff, DEFAULT_MAX_ATTEMPTS};

const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const MANAGEMENT_BASE: &str = "https://management.azure.com";
const METRICS_API_VERSION: &str = "2018-01-01";

pub struct AzureMonitorProbes {
    client: reqwest::Client,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    resource_id: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    value: Vec<MetricEntry>,
}

#[derive(Deserialize)]
struct MetricEntry {
    #[serde(default)]
    timeseries: Vec<TimeSeries>,
}

#[derive(Deserialize)]
struct TimeSeries {
    #[serde(default)]
    data: Vec<MetricPoint>,
}

#[derive(Deserialize)]
struct MetricPoint {
    #[serde(default)]
    average: Option<f64>,
}

impl AzureMonitorProbes {
    pub fn new(
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        resource_id: &str,
    ) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_CLOUD_TIMEOUT_SECS))
            .build()
            .map_err(|e| CloudError::Request(e.to_string()))?;
        Ok(Self {
            client,
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            resource_id: resource_id.to_string(),
        })
    }

    async fn access_token(&self) -> Result<String, CloudError> {
        let url = format!("{LOGIN_BASE}/{}/oauth2/v2.0/token", self.tenant_id);
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", "https://management.azure.com/.default"),
        ];
        let response = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| CloudError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudError::from_status(
                status.as_u16(),
                body.chars().take(200).collect::<String>(),
            ));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CloudError::Parse(e.to_string()))?;
        Ok(token.access_token)
    }

    /// Average of an Azure Monitor metric over the trailing window.
    pub async fn metric_average(
        &self,
        metric_name: &str,
        window_minutes: i64,
    ) -> Result<Option<f64>, CloudError> {
        let token = self.access_token().await?;
        let end = chrono::Utc::now();
        let start = end - chrono::Duration::minutes(window_minutes);
        let url = format!(
            "{MANAGEMENT_BASE}{}/providers/microsoft.insights/metrics?api-version={}&metricnames={}&timespan={}/{}&aggregation=Average",
            self.resource_id,
            METRICS_API_VERSION,
            metric_name,
            start.to_rfc3339(),
            end.to_rfc3339(),
        );

        let body = with_backoff("azure monitor metrics", DEFAULT_MAX_ATTEMPTS, || {
            let url = url.clone();
            let token = token.clone();
            async move {
                let response = self
                    .client
                    .get(&url)
                    .bearer_auth(&token)
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
            }
        })
        .await?;

        let metrics: MetricsResponse =
            serde_json::from_str(&body).map_err(|e| CloudError::Parse(e.to_string()))?;
        let values: Vec<f64> = metrics
            .value
            .iter()
            .flat_map(|m| &m.timeseries)
            .flat_map(|t| &t.data)
            .filter_map(|p| p.average)
            .collect();

        if values.is_empty() {
            debug!("no Azure Monitor datapoints for {}", metric_name);
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_response_shape() {
        let body = r#"{
            "value": [
                {"timeseries": [{"data": [{"average": 10.0}, {"average": 20.0}, {}]}]}
            ]
        }"#;
        let parsed: MetricsResponse = serde_json::from_str(body).unwrap();
        let values: Vec<f64> = parsed
            .value
            .iter()
            .flat_map(|m| &m.timeseries)
            .flat_map(|t| &t.data)
            .filter_map(|p| p.average)
            .collect();
        assert_eq!(values, [10.0, 20.0], "points without an average are skipped");
    }
}
