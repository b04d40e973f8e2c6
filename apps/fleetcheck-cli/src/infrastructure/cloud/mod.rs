//! Cloud and managed-service probes.
//!
//! Capabilities are plain struct fields: a connector that has credentials
//! for a provider gets a probe, everything else stays `None` and dependent
//! checks skip. Auxiliary-channel failures here are never fatal to a run.

pub mod aws;
pub mod azure;
pub mod instaclustr;

use tracing::warn;

pub use aws::AwsProbes;
pub use azure::AzureMonitorProbes;
pub use instaclustr::InstaclustrApi;

pub const DEFAULT_CLOUD_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CloudError {
    #[error("authentication failed (401): {0}")]
    Auth(String),

    #[error("permission denied (403): {0}")]
    Permission(String),

    #[error("rate limited (429): {0}")]
    RateLimited(String),

    #[error("service error ({status}): {message}")]
    Service { status: u16, message: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

impl CloudError {
    /// Maps an HTTP status to the taxonomy. 429 and 5xx are transient and
    /// picked up by the retry classifier through the Display form.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => CloudError::Auth(message),
            403 => CloudError::Permission(message),
            429 => CloudError::RateLimited(message),
            _ => CloudError::Service { status, message },
        }
    }
}

/// Credentials and identifiers for the optional cloud channels.
#[derive(Debug, Clone, Default)]
pub struct CloudConfig {
    pub aws_region: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub db_cluster_id: Option<String>,

    pub azure_tenant_id: Option<String>,
    pub azure_client_id: Option<String>,
    pub azure_client_secret: Option<String>,
    pub azure_resource_id: Option<String>,

    pub instaclustr_api_key: Option<String>,
    pub instaclustr_cluster_id: Option<String>,
}

/// Uniform accessor bundle handed to connectors. Each member is present
/// only when its configuration is complete and the client initialized.
pub struct CloudProbes {
    pub aws: Option<AwsProbes>,
    pub azure: Option<AzureMonitorProbes>,
    pub instaclustr: Option<InstaclustrApi>,
}

impl CloudProbes {
    pub async fn initialize(config: &CloudConfig) -> Self {
        let aws = if config.aws_region.is_some() {
            match AwsProbes::initialize(
                config.aws_region.clone(),
                config.aws_access_key_id.clone(),
                config.aws_secret_access_key.clone(),
            )
            .await
            {
                Ok(probes) => Some(probes),
                Err(e) => {
                    warn!("AWS probe initialization failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let azure = match (
            &config.azure_tenant_id,
            &config.azure_client_id,
            &config.azure_client_secret,
            &config.azure_resource_id,
        ) {
            (Some(tenant), Some(client), Some(secret), Some(resource)) => {
                match AzureMonitorProbes::new(tenant, client, secret, resource) {
                    Ok(probes) => Some(probes),
                    Err(e) => {
                        warn!("Azure probe initialization failed: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        let instaclustr = match (&config.instaclustr_api_key, &config.instaclustr_cluster_id) {
            (Some(key), Some(cluster)) => match InstaclustrApi::new(key, cluster) {
                Ok(api) => Some(api),
                Err(e) => {
                    warn!("managed-service API initialization failed: {}", e);
                    None
                }
            },
            _ => None,
        };

        Self {
            aws,
            azure,
            instaclustr,
        }
    }

    pub fn has_any(&self) -> bool {
        self.aws.is_some() || self.azure.is_some() || self.instaclustr.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utilities::retry::is_transient;

    #[test]
    fn test_status_classification() {
        assert!(matches!(CloudError::from_status(401, "x"), CloudError::Auth(_)));
        assert!(matches!(CloudError::from_status(403, "x"), CloudError::Permission(_)));
        assert!(matches!(CloudError::from_status(429, "x"), CloudError::RateLimited(_)));
        assert!(matches!(
            CloudError::from_status(503, "x"),
            CloudError::Service { status: 503, .. }
        ));
    }

    #[test]
    fn test_transient_statuses_retry_and_auth_does_not() {
        assert!(is_transient(&CloudError::from_status(503, "down").to_string()));
        assert!(is_transient(&CloudError::from_status(429, "slow").to_string()));
        assert!(!is_transient(&CloudError::from_status(401, "bad key").to_string()));
        assert!(!is_transient(&CloudError::from_status(403, "no access").to_string()));
    }

    #[tokio::test]
    async fn test_unconfigured_probes_are_absent() {
        let probes = CloudProbes::initialize(&CloudConfig::default()).await;
        assert!(!probes.has_any());
    }
}
