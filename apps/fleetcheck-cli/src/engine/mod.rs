//! # Health-Check Engine
//!
//! Top-level phase driver and the shared engine types. A run proceeds
//! through fixed phases, each gated on the previous:
//!
//! 1. Configuration resolution and plugin selection (done by the caller)
//! 2. Connector instantiation and `connect()`
//! 3. Topology discovery and SSH host mapping (inside `connect()`)
//! 4. Per-section, weight-ordered check execution
//! 5. Findings saved to disk in canonical tree form
//! 6. Trend persistence (single transaction, optional)
//! 7. Report emission
//! 8. Connector disconnect
//!
//! Anything that prevents a single check from producing a finding is
//! recovered locally; anything that prevents every check from proceeding
//! (primary connection loss, configuration faults) aborts the run.

pub mod check;
pub mod environment;
pub mod findings;
pub mod metrics;
pub mod operation;
pub mod topology;

use std::path::PathBuf;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::checks;
use crate::cli::settings::Settings;
use crate::infrastructure::connectors::{build_connector, Technology};
use crate::infrastructure::trend::{RunMetadata, TrendStore};
use crate::report::writer;
use findings::{CheckStatus, FindingAccumulator};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("finding for check '{check}' violates the envelope contract: {rule}")]
    InvalidFinding { check: String, rule: String },

    #[error("check '{check}' attempted to overwrite an existing finding")]
    DuplicateFinding { check: String },

    #[error("connector failure: {0}")]
    Connector(String),

    #[error("primary connection lost: {0}")]
    ConnectionLost(String),
}

/// Fatal, run-aborting failures. Everything else is degradation recorded
/// in findings or in the run summary.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub struct RunSummary {
    pub company: String,
    pub technology: Technology,
    pub total_checks: usize,
    pub successful_checks: usize,
    pub failed_checks: usize,
    pub duration_seconds: f64,
    pub trend_run_id: Option<i32>,
    /// Run-level failures that did not abort the run (e.g. persistence).
    pub engine_failures: Vec<String>,
    pub report_path: PathBuf,
    pub findings_path: PathBuf,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed_checks == 0 && self.engine_failures.is_empty()
    }
}

/// Drives one complete assessment run.
pub async fn run_health_check(settings: &Settings) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    let mut engine_failures = Vec::new();

    // Phase 2: connector instantiation and connection. Native-channel
    // failure is fatal; auxiliary channels degrade inside connect().
    let mut connector = build_connector(settings);
    info!(
        "connecting {} connector to {}",
        settings.technology, settings.host
    );
    if let Err(e) = connector.connect().await {
        return Err(RunError::Connection(e.to_string()));
    }

    // Phase 4: weight-ordered execution, findings accumulated in order.
    let sections = checks::sections_for(settings.technology);
    let mut accumulator = FindingAccumulator::new();
    let reports = match check::run_sections(sections, connector.as_ref(), settings, &mut accumulator)
        .await
    {
        Ok(reports) => reports,
        Err(e) => {
            connector.disconnect().await;
            return Err(RunError::Engine(e));
        }
    };

    // Phase 5: canonical findings tree on disk.
    let findings_path = match writer::write_findings(settings, &accumulator) {
        Ok(path) => path,
        Err(e) => {
            warn!("could not save findings tree: {}", e);
            engine_failures.push(format!("findings persistence failed: {e}"));
            PathBuf::new()
        }
    };

    // Phase 6: trend persistence, one transaction for the entire run.
    // Failure rolls back the run's rows but never invalidates in-memory
    // findings; the report still goes out.
    let mut trend_run_id = None;
    if settings.trend_storage_enabled {
        match &settings.trend_database {
            Some(trend_db) => {
                let metadata = RunMetadata {
                    company: settings.company_name.clone(),
                    database: settings.database.clone(),
                    host: settings.host.clone(),
                    target_version: connector.target_version().map(str::to_string),
                    duration_seconds: started.elapsed().as_secs_f64(),
                };
                match TrendStore::connect(trend_db, &settings.company_name).await {
                    Ok(mut store) => match store.store_run(&accumulator, &metadata).await {
                        Ok(run_id) => {
                            info!("stored health check run {} in trend schema", run_id);
                            trend_run_id = Some(run_id);
                        }
                        Err(e) => {
                            error!("trend persistence failed, run rolled back: {}", e);
                            engine_failures.push(format!("trend persistence failed: {e}"));
                        }
                    },
                    Err(e) => {
                        error!("trend store unreachable: {}", e);
                        engine_failures.push(format!("trend store unreachable: {e}"));
                    }
                }
            }
            None => {
                warn!("trend storage enabled but trend_database is not configured");
                engine_failures
                    .push("trend storage enabled but trend_database missing".to_string());
            }
        }
    }

    // Phase 7: report emission from the collected fragments.
    let report_path = match writer::write_report(settings, &reports) {
        Ok(path) => path,
        Err(e) => {
            warn!("could not write report: {}", e);
            engine_failures.push(format!("report emission failed: {e}"));
            PathBuf::new()
        }
    };

    // Phase 8: release native, SSH, cloud in order.
    connector.disconnect().await;

    Ok(RunSummary {
        company: settings.company_name.clone(),
        technology: settings.technology,
        total_checks: accumulator.len(),
        successful_checks: accumulator.count_with_status(CheckStatus::Success),
        failed_checks: accumulator.count_with_status(CheckStatus::Error),
        duration_seconds: started.elapsed().as_secs_f64(),
        trend_run_id,
        engine_failures,
        report_path,
        findings_path,
    })
}
