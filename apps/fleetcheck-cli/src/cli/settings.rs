//! Settings: the YAML configuration file deserialized with per-field
//! defaults. Key names follow the flat convention operators already use
//! (`ssh_host`, `aws_region`, `trend_database.host`, ...).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::logger::LoggerSettings;
use crate::infrastructure::cloud::CloudConfig;
use crate::infrastructure::connectors::Technology;
use crate::infrastructure::ssh::{SshAuth, SshPoolConfig};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("config file {0} not found")]
    NotFound(PathBuf),

    #[error("could not parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_timeout() -> u64 {
    10
}

fn default_ssh_command_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

fn default_statement_timeout() -> u64 {
    30
}

fn default_patroni_port() -> u16 {
    8008
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_trend_port() -> u16 {
    5432
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrendDatabaseSettings {
    pub host: String,
    #[serde(default = "default_trend_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub technology: Technology,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub company_name: String,

    /// Kafka only; defaults to `host:port` when absent.
    #[serde(default)]
    pub bootstrap_servers: Option<Vec<String>>,
    #[serde(default)]
    pub use_ssl: bool,

    #[serde(default)]
    pub ssh_hosts: Vec<String>,
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_key_file: Option<PathBuf>,
    #[serde(default)]
    pub ssh_password: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout: u64,
    #[serde(default = "default_ssh_command_timeout")]
    pub ssh_command_timeout: u64,
    #[serde(default = "default_true")]
    pub ssh_strict_host_key_checking: bool,
    #[serde(default)]
    pub ssh_known_hosts_file: Option<PathBuf>,
    #[serde(default = "default_keepalive_interval")]
    pub ssh_keepalive_interval: u32,

    #[serde(default)]
    pub aws_region: Option<String>,
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
    #[serde(default)]
    pub db_cluster_id: Option<String>,

    #[serde(default)]
    pub azure_tenant_id: Option<String>,
    #[serde(default)]
    pub azure_client_id: Option<String>,
    #[serde(default)]
    pub azure_client_secret: Option<String>,
    #[serde(default)]
    pub azure_resource_id: Option<String>,

    #[serde(default)]
    pub instaclustr_api_key: Option<String>,
    #[serde(default)]
    pub instaclustr_cluster_id: Option<String>,

    #[serde(default)]
    pub trend_storage_enabled: bool,
    #[serde(default)]
    pub trend_database: Option<TrendDatabaseSettings>,

    /// Per-check numeric overrides, e.g. `kafka_memory_warning: 75`.
    #[serde(default)]
    pub check_overrides: HashMap<String, f64>,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub allow_unsafe_commands: bool,
    #[serde(default)]
    pub environment_override: Option<String>,
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_patroni_port")]
    pub patroni_port: u16,

    #[serde(default)]
    pub logger: LoggerSettings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.to_path_buf()))?;
        let settings: Settings =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.company_name.trim().is_empty() {
            return Err(ConfigError::Invalid("company_name must be set".into()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must be set".into()));
        }
        if matches!(self.technology, Technology::Postgres) && self.database.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "database must be set for postgres targets".into(),
            ));
        }

        let ssh_hosts = self.effective_ssh_hosts();
        if !ssh_hosts.is_empty() {
            if self.ssh_user.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Invalid(
                    "ssh_user is required when SSH hosts are configured".into(),
                ));
            }
            if self.ssh_key_file.is_none() && self.ssh_password.is_none() {
                return Err(ConfigError::Invalid(
                    "either ssh_key_file or ssh_password is required for SSH authentication"
                        .into(),
                ));
            }
        }

        if self.trend_storage_enabled && self.trend_database.is_none() {
            return Err(ConfigError::Invalid(
                "trend_storage_enabled requires trend_database settings".into(),
            ));
        }
        Ok(())
    }

    /// `ssh_hosts` wins; a lone `ssh_host` is the single-host form.
    pub fn effective_ssh_hosts(&self) -> Vec<String> {
        if !self.ssh_hosts.is_empty() {
            self.ssh_hosts.clone()
        } else {
            self.ssh_host.clone().into_iter().collect()
        }
    }

    pub fn ssh_pool_config(&self) -> Option<SshPoolConfig> {
        let hosts = self.effective_ssh_hosts();
        if hosts.is_empty() {
            return None;
        }
        let user = self.ssh_user.clone()?;
        let auth = if let Some(key) = &self.ssh_key_file {
            SshAuth::KeyFile(key.clone())
        } else {
            SshAuth::Password(self.ssh_password.clone()?)
        };
        Some(SshPoolConfig {
            hosts,
            user,
            auth,
            port: self.ssh_port,
            connect_timeout: Duration::from_secs(self.ssh_timeout),
            command_timeout: Duration::from_secs(self.ssh_command_timeout),
            keepalive_interval_secs: self.ssh_keepalive_interval,
            strict_host_key: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
        })
    }

    pub fn cloud_config(&self) -> CloudConfig {
        CloudConfig {
            aws_region: self.aws_region.clone(),
            aws_access_key_id: self.aws_access_key_id.clone(),
            aws_secret_access_key: self.aws_secret_access_key.clone(),
            db_cluster_id: self.db_cluster_id.clone(),
            azure_tenant_id: self.azure_tenant_id.clone(),
            azure_client_id: self.azure_client_id.clone(),
            azure_client_secret: self.azure_client_secret.clone(),
            azure_resource_id: self.azure_resource_id.clone(),
            instaclustr_api_key: self.instaclustr_api_key.clone(),
            instaclustr_cluster_id: self.instaclustr_cluster_id.clone(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(technology: Technology) -> Self {
        Self {
            technology,
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            company_name: "test-co".to_string(),
            bootstrap_servers: None,
            use_ssl: false,
            ssh_hosts: Vec::new(),
            ssh_host: None,
            ssh_user: None,
            ssh_key_file: None,
            ssh_password: None,
            ssh_port: default_ssh_port(),
            ssh_timeout: default_ssh_timeout(),
            ssh_command_timeout: default_ssh_command_timeout(),
            ssh_strict_host_key_checking: true,
            ssh_known_hosts_file: None,
            ssh_keepalive_interval: default_keepalive_interval(),
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            db_cluster_id: None,
            azure_tenant_id: None,
            azure_client_id: None,
            azure_client_secret: None,
            azure_resource_id: None,
            instaclustr_api_key: None,
            instaclustr_cluster_id: None,
            trend_storage_enabled: false,
            trend_database: None,
            check_overrides: HashMap::new(),
            output_dir: default_output_dir(),
            allow_unsafe_commands: false,
            environment_override: None,
            statement_timeout_secs: default_statement_timeout(),
            patroni_port: default_patroni_port(),
            logger: LoggerSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_KAFKA: &str = "\
technology: kafka
host: broker-1.internal
port: 9092
company_name: Acme Corp
";

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let settings: Settings = serde_yaml::from_str(MINIMAL_KAFKA).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.technology, Technology::Kafka);
        assert_eq!(settings.ssh_port, 22);
        assert!(settings.ssh_strict_host_key_checking, "strict by default");
        assert_eq!(settings.statement_timeout_secs, 30);
        assert!(settings.ssh_pool_config().is_none());
    }

    #[test]
    fn test_ssh_requires_user_and_auth() {
        let raw = format!("{MINIMAL_KAFKA}ssh_hosts: [b-1, b-2]\n");
        let settings: Settings = serde_yaml::from_str(&raw).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("ssh_user"));

        let raw = format!("{MINIMAL_KAFKA}ssh_hosts: [b-1]\nssh_user: kafka\n");
        let settings: Settings = serde_yaml::from_str(&raw).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("ssh_key_file or ssh_password"));
    }

    #[test]
    fn test_single_ssh_host_form() {
        let raw = format!(
            "{MINIMAL_KAFKA}ssh_host: b-1\nssh_user: kafka\nssh_password: secret\n"
        );
        let settings: Settings = serde_yaml::from_str(&raw).unwrap();
        settings.validate().unwrap();
        let pool = settings.ssh_pool_config().unwrap();
        assert_eq!(pool.hosts, ["b-1"]);
        assert_eq!(pool.connect_timeout, Duration::from_secs(10));
        assert_eq!(pool.command_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_trend_storage_requires_database() {
        let raw = format!("{MINIMAL_KAFKA}trend_storage_enabled: true\n");
        let settings: Settings = serde_yaml::from_str(&raw).unwrap();
        assert!(settings.validate().is_err());

        let raw = format!(
            "{MINIMAL_KAFKA}trend_storage_enabled: true\ntrend_database:\n  host: trends.internal\n  database: healthcheck\n  user: trend_writer\n"
        );
        let settings: Settings = serde_yaml::from_str(&raw).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.trend_database.unwrap().port, 5432);
    }

    #[test]
    fn test_check_overrides_are_read() {
        let raw = format!(
            "{MINIMAL_KAFKA}check_overrides:\n  kafka_memory_warning: 75\n  kafka_fd_critical: 95\n"
        );
        let settings: Settings = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(settings.check_overrides["kafka_memory_warning"], 75.0);
    }
}
