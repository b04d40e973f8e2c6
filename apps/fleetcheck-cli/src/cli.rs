#[macro_use]
pub(crate) mod display;
pub mod commands;
pub mod logger;
pub mod settings;

pub use commands::{Cli, Commands};

use display::{Message, MessageType};
use settings::Settings;

use crate::engine;
use crate::infrastructure::trend::TrendStore;

/// Terminal outcome of a command: the closing message plus the process
/// exit code.
pub struct RoutineSuccess {
    pub message: Message,
    pub exit_code: u8,
}

pub struct RoutineFailure {
    pub message: Message,
    pub error: Option<String>,
}

impl RoutineFailure {
    fn new(action: &str, details: impl Into<String>, error: Option<String>) -> Self {
        Self {
            message: Message::new(action, details),
            error,
        }
    }
}

pub async fn top_command_handler(
    settings: Settings,
    command: &Commands,
) -> Result<RoutineSuccess, RoutineFailure> {
    match command {
        Commands::Run { .. } => run_assessment(settings).await,
        Commands::Trends { days, .. } => show_trends(settings, *days).await,
    }
}

async fn run_assessment(settings: Settings) -> Result<RoutineSuccess, RoutineFailure> {
    show_message!(
        MessageType::Info,
        Message::new(
            "Assess",
            format!(
                "{} at {} for {}",
                settings.technology, settings.host, settings.company_name
            ),
        )
    );

    let summary = engine::run_health_check(&settings)
        .await
        .map_err(|e| RoutineFailure::new("Run", "health check aborted", Some(e.to_string())))?;

    show_message!(
        MessageType::Info,
        Message::new(
            "Checks",
            format!(
                "{} run, {} successful, {} errored in {:.1}s",
                summary.total_checks,
                summary.successful_checks,
                summary.failed_checks,
                summary.duration_seconds
            ),
        )
    );
    if let Some(run_id) = summary.trend_run_id {
        show_message!(
            MessageType::Info,
            Message::new("Trends", format!("stored as run {run_id}"))
        );
    }
    for failure in &summary.engine_failures {
        show_message!(MessageType::Error, Message::new("Degraded", failure.clone()));
    }
    if summary.report_path.as_os_str().is_empty() {
        show_message!(
            MessageType::Error,
            Message::new("Report", "report emission failed; findings were still collected")
        );
    } else {
        show_message!(
            MessageType::Info,
            Message::new("Report", summary.report_path.display().to_string())
        );
    }

    let exit_code = if summary.is_clean() { 0 } else { 1 };
    Ok(RoutineSuccess {
        message: Message::new(
            "Done",
            format!(
                "{} checks completed for {}",
                summary.total_checks, summary.company
            ),
        ),
        exit_code,
    })
}

async fn show_trends(settings: Settings, days: i64) -> Result<RoutineSuccess, RoutineFailure> {
    let Some(trend_db) = settings.trend_database.as_ref() else {
        return Err(RoutineFailure::new(
            "Trends",
            "trend_database is not configured",
            None,
        ));
    };

    let store = TrendStore::connect(trend_db, &settings.company_name)
        .await
        .map_err(|e| {
            RoutineFailure::new("Trends", "could not reach the trend store", Some(e.to_string()))
        })?;
    let analysis = store.get_trend_analysis(days, None).await.map_err(|e| {
        RoutineFailure::new("Trends", "trend query failed", Some(e.to_string()))
    })?;

    show_message!(
        MessageType::Info,
        Message::new(
            "Window",
            format!(
                "{} run(s) in the last {} day(s), {} clean / {} degraded",
                analysis.runs_analyzed,
                analysis.time_period_days,
                analysis.run_trends.successful_runs,
                analysis.run_trends.failed_runs
            ),
        )
    );
    for (metric, trend) in &analysis.metric_trends {
        show_message!(
            MessageType::Info,
            Message::new(
                "Metric",
                format!(
                    "{metric}: {} (min {:.2}, max {:.2}, avg {:.2}{})",
                    trend.trend.as_str(),
                    trend.min,
                    trend.max,
                    trend.avg,
                    trend
                        .unit
                        .as_deref()
                        .map(|u| format!(" {u}"))
                        .unwrap_or_default()
                ),
            )
        );
    }
    store.close();

    Ok(RoutineSuccess {
        message: Message::new("Done", format!("{} run(s) analyzed", analysis.runs_analyzed)),
        exit_code: 0,
    })
}
