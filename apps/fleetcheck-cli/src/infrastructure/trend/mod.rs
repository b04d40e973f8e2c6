//! Trend store: a relational, schema-per-tenant home for runs, findings,
//! and extracted metrics, plus the retrospective read path.

pub mod reader;
pub mod schema;
pub mod writer;

use tokio_postgres::NoTls;
use tracing::{info, warn};

use crate::cli::settings::TrendDatabaseSettings;
use crate::utilities::identifiers::sanitize_schema_name;

pub use reader::{classify_trend, MetricTrend, RunTrends, TrendAnalysis, TrendDirection};
pub use writer::RunMetadata;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TrendStoreError {
    #[error("could not connect to trend database: {0}")]
    Connection(String),

    #[error("schema setup failed: {0}")]
    Schema(String),

    #[error("persisting run failed: {0}")]
    Write(String),

    #[error("trend query failed: {0}")]
    Read(String),
}

pub struct TrendStore {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
    /// Sanitized once at construction; every later operation uses this
    /// string, never the raw tenant name.
    schema: String,
    company: String,
    database: String,
}

impl TrendStore {
    pub async fn connect(
        settings: &TrendDatabaseSettings,
        company_name: &str,
    ) -> Result<Self, TrendStoreError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&settings.host)
            .port(settings.port)
            .dbname(&settings.database)
            .user(&settings.user)
            .password(&settings.password);

        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| TrendStoreError::Connection(e.to_string()))?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("trend database connection closed: {}", e);
            }
        });

        let schema = sanitize_schema_name(company_name);
        info!(
            "connected to trend database {} (schema {})",
            settings.database, schema
        );

        Ok(Self {
            client,
            connection_task,
            schema,
            company: company_name.to_string(),
            database: settings.database.clone(),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Issues the idempotent DDL for this tenant's schema.
    pub async fn ensure_schema(&self) -> Result<(), TrendStoreError> {
        for statement in schema::ddl_statements(&self.schema) {
            self.client
                .batch_execute(&statement)
                .await
                .map_err(|e| TrendStoreError::Schema(e.to_string()))?;
        }
        Ok(())
    }

    pub fn close(self) {
        drop(self.client);
        self.connection_task.abort();
    }
}
