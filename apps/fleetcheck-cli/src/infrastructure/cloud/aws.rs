//! AWS accessors: RDS describe-cluster for managed topology and
//! CloudWatch statistics for cloud metrics. All calls go through the
//! shared transient-retry policy.

use aws_config::{BehaviorVersion, Region};
use aws_sdk_cloudwatch::config::Credentials;
use aws_sdk_cloudwatch::primitives::DateTime;
use aws_sdk_cloudwatch::types::{Dimension, Statistic};
use chrono::Utc;
use tracing::{debug, info};

use super::CloudError;
use crate::engine::topology::{EndpointType, NodeIdentity, NodeRole, NodeState, Topology};
use crate::utilities::retry::{with_backoff, DEFAULT_MAX_ATTEMPTS};

pub struct AwsProbes {
    rds: aws_sdk_rds::Client,
    cloudwatch: aws_sdk_cloudwatch::Client,
    region: String,
}

impl AwsProbes {
    pub async fn initialize(
        region: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    ) -> Result<Self, CloudError> {
        let region_name = region.ok_or(CloudError::NotConfigured("aws_region"))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region_name.clone()));
        if let (Some(key), Some(secret)) = (access_key_id, secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key,
                secret,
                None,
                None,
                "fleetcheck-settings",
            ));
        }
        let config = loader.load().await;

        info!("AWS clients initialized for region {}", region_name);
        Ok(Self {
            rds: aws_sdk_rds::Client::new(&config),
            cloudwatch: aws_sdk_cloudwatch::Client::new(&config),
            region: region_name,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Describe-cluster topology for an Aurora/RDS cluster. The virtual
    /// cluster and reader endpoints are recorded as non-instance entries;
    /// members come back as instance nodes with writer/reader roles.
    pub async fn describe_cluster_topology(
        &self,
        cluster_id: &str,
    ) -> Result<Topology, CloudError> {
        let response = with_backoff("rds describe-db-clusters", DEFAULT_MAX_ATTEMPTS, || {
            let request = self
                .rds
                .describe_db_clusters()
                .db_cluster_identifier(cluster_id);
            async move { request.send().await.map_err(|e| CloudError::Request(e.to_string())) }
        })
        .await?;

        let cluster = response
            .db_clusters()
            .first()
            .ok_or_else(|| CloudError::Parse(format!("cluster {cluster_id} not found")))?;

        let mut topology = Topology::new();
        let port = cluster.port().map(|p| p as u16);

        if let Some(endpoint) = cluster.endpoint() {
            let mut node = NodeIdentity::instance(format!("{cluster_id}-cluster"), endpoint)
                .with_role(NodeRole::Writer)
                .with_endpoint_type(EndpointType::Cluster)
                .with_metadata("cluster_id", cluster_id);
            node.port = port;
            topology.insert(node);
        }
        if let Some(endpoint) = cluster.reader_endpoint() {
            let mut node = NodeIdentity::instance(format!("{cluster_id}-reader"), endpoint)
                .with_role(NodeRole::Reader)
                .with_endpoint_type(EndpointType::ReaderLb)
                .with_metadata("cluster_id", cluster_id);
            node.port = port;
            topology.insert(node);
        }

        for member in cluster.db_cluster_members() {
            let Some(instance_id) = member.db_instance_identifier() else {
                continue;
            };
            let role = if member.is_cluster_writer().unwrap_or(false) {
                NodeRole::Writer
            } else {
                NodeRole::Reader
            };
            let node = self.describe_instance(instance_id, role).await?;
            topology.insert(node);
        }

        info!(
            "discovered managed topology for {}: {} endpoint(s)",
            cluster_id,
            topology.nodes().len()
        );
        Ok(topology)
    }

    async fn describe_instance(
        &self,
        instance_id: &str,
        role: NodeRole,
    ) -> Result<NodeIdentity, CloudError> {
        let response = with_backoff("rds describe-db-instances", DEFAULT_MAX_ATTEMPTS, || {
            let request = self
                .rds
                .describe_db_instances()
                .db_instance_identifier(instance_id);
            async move { request.send().await.map_err(|e| CloudError::Request(e.to_string())) }
        })
        .await?;

        let instance = response
            .db_instances()
            .first()
            .ok_or_else(|| CloudError::Parse(format!("instance {instance_id} not found")))?;

        let host = instance
            .endpoint()
            .and_then(|e| e.address())
            .unwrap_or(instance_id)
            .to_string();
        let state = match instance.db_instance_status() {
            Some("available") | Some("backing-up") | Some("modifying") => NodeState::Active,
            Some("creating") => NodeState::Joining,
            Some("deleting") => NodeState::Leaving,
            Some(_) => NodeState::Down,
            None => NodeState::Active,
        };

        let mut node = NodeIdentity::instance(instance_id, host)
            .with_role(role)
            .with_state(state);
        node.port = instance.endpoint().and_then(|e| e.port()).map(|p| p as u16);
        if let Some(az) = instance.availability_zone() {
            node = node.with_metadata("availability_zone", az);
        }
        if let Some(class) = instance.db_instance_class() {
            node = node.with_metadata("instance_class", class);
        }
        if let Some(version) = instance.engine_version() {
            node = node.with_metadata("engine_version", version);
        }
        Ok(node)
    }

    /// Average of a CloudWatch metric over the trailing window, one
    /// dimension. Returns None when no datapoints exist.
    pub async fn metric_average(
        &self,
        namespace: &str,
        metric_name: &str,
        dimension_name: &str,
        dimension_value: &str,
        window_minutes: i64,
    ) -> Result<Option<f64>, CloudError> {
        let end = Utc::now();
        let start = end - chrono::Duration::minutes(window_minutes);

        let response = with_backoff("cloudwatch get-metric-statistics", DEFAULT_MAX_ATTEMPTS, || {
            let request = self
                .cloudwatch
                .get_metric_statistics()
                .namespace(namespace)
                .metric_name(metric_name)
                .dimensions(
                    Dimension::builder()
                        .name(dimension_name)
                        .value(dimension_value)
                        .build(),
                )
                .start_time(DateTime::from_millis(start.timestamp_millis()))
                .end_time(DateTime::from_millis(end.timestamp_millis()))
                .period(300)
                .statistics(Statistic::Average);
            async move { request.send().await.map_err(|e| CloudError::Request(e.to_string())) }
        })
        .await?;

        let datapoints = response.datapoints();
        if datapoints.is_empty() {
            debug!("no CloudWatch datapoints for {}/{}", namespace, metric_name);
            return Ok(None);
        }
        let values: Vec<f64> = datapoints.iter().filter_map(|d| d.average()).collect();
        if values.is_empty() {
            return Ok(None);
        }
        Ok(Some(values.iter().sum::<f64>() / values.len() as f64))
    }
}
