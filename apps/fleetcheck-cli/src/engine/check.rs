//! Check contract, registry, and the weight-ordered runner.
//!
//! A check inspects one aspect of the target and returns a report fragment
//! plus a finding envelope. Data-quality problems are findings, never
//! errors; a check returns Err only for engine-level faults, which the
//! runner catches and converts into `status=error` findings without
//! aborting the run.

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::findings::{FindingAccumulator, FindingEnvelope};
use super::EngineError;
use crate::cli::settings::Settings;
use crate::infrastructure::connectors::Connector;
use crate::report::formatter;

pub const WEIGHT_CRITICAL: u8 = 10;
pub const WEIGHT_DEFAULT: u8 = 5;

/// Everything a check may reach: the connector, resolved settings, and
/// the findings of every earlier check. Prior findings are always passed;
/// stateless checks simply ignore them.
pub struct CheckContext<'a> {
    pub connector: &'a dyn Connector,
    pub settings: &'a Settings,
    pub prior_findings: &'a FindingAccumulator,
}

impl CheckContext<'_> {
    /// Per-check numeric override (e.g. `kafka_memory_warning`), falling
    /// back to the built-in default.
    pub fn threshold(&self, key: &str, default: f64) -> f64 {
        self.settings
            .check_overrides
            .get(key)
            .copied()
            .unwrap_or(default)
    }
}

pub struct CheckOutput {
    pub fragment: String,
    pub finding: FindingEnvelope,
}

impl CheckOutput {
    pub fn new(fragment: String, finding: FindingEnvelope) -> Self {
        Self { fragment, finding }
    }
}

#[async_trait]
pub trait Check: Send + Sync {
    /// Stable name; findings are keyed by it.
    fn name(&self) -> &'static str;

    /// Priority weight 1-10. Higher weights run first.
    fn weight(&self) -> u8 {
        WEIGHT_DEFAULT
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError>;
}

/// Report-layout grouping. Grouping affects report structure only;
/// findings are keyed by check name regardless of section.
pub struct ReportSection {
    pub title: &'static str,
    pub checks: Vec<Box<dyn Check>>,
}

/// A section's rendered output.
pub struct SectionReport {
    pub title: &'static str,
    pub fragments: Vec<String>,
}

/// Runs every check of every section, descending weight order within a
/// section (declaration order within equal weight), accumulating findings
/// as it goes so later checks can read earlier results.
pub async fn run_sections(
    sections: Vec<ReportSection>,
    connector: &dyn Connector,
    settings: &Settings,
    accumulator: &mut FindingAccumulator,
) -> Result<Vec<SectionReport>, EngineError> {
    let mut reports = Vec::with_capacity(sections.len());

    for section in sections {
        let mut checks = section.checks;
        // Stable sort: declaration order is preserved within equal weight.
        checks.sort_by(|a, b| b.weight().cmp(&a.weight()));

        let mut fragments = Vec::with_capacity(checks.len());
        for check in &checks {
            let name = check.name();
            info!("running check {} (weight {})", name, check.weight());

            let ctx = CheckContext {
                connector,
                settings,
                prior_findings: accumulator,
            };
            let output = match check.run(&ctx).await {
                Ok(output) => output,
                Err(e) => {
                    // Engine-level fault inside one check: captured as an
                    // error finding, the run continues.
                    error!("check {} failed at engine level: {}", name, e);
                    CheckOutput::new(
                        formatter::render_error(&format!("Check {name} failed: {e}")),
                        FindingEnvelope::error(e.to_string()),
                    )
                }
            };

            if let Err(violation) = output.finding.validate(name) {
                // Contract violations are engine programming errors; keep
                // the run alive but make them visible.
                warn!("{}", violation);
            }

            accumulator.set(name, output.finding)?;
            fragments.push(output.fragment);
        }

        reports.push(SectionReport {
            title: section.title,
            fragments,
        });
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::findings::CheckStatus;
    use crate::infrastructure::connectors::test_support::MockConnector;
    use crate::infrastructure::connectors::Technology;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct RecordingCheck {
        name: &'static str,
        weight: u8,
        order: Arc<AtomicUsize>,
        observed: Arc<std::sync::Mutex<Vec<(&'static str, usize)>>>,
        fail: bool,
    }

    #[async_trait]
    impl Check for RecordingCheck {
        fn name(&self) -> &'static str {
            self.name
        }

        fn weight(&self) -> u8 {
            self.weight
        }

        async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
            let position = self.order.fetch_add(1, Ordering::SeqCst);
            self.observed.lock().unwrap().push((self.name, position));
            if self.fail {
                return Err(EngineError::Connector("simulated fault".to_string()));
            }
            let visible = ctx.prior_findings.len();
            Ok(CheckOutput::new(
                format!("fragment from {}", self.name),
                FindingEnvelope::success("ok", json!({"prior_visible": visible})),
            ))
        }
    }

    fn settings() -> Settings {
        Settings::for_tests(Technology::Kafka)
    }

    #[tokio::test]
    async fn test_weight_order_and_prior_visibility() {
        let order = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mk = |name, weight| -> Box<dyn Check> {
            Box::new(RecordingCheck {
                name,
                weight,
                order: order.clone(),
                observed: observed.clone(),
                fail: false,
            })
        };

        let sections = vec![ReportSection {
            title: "Section",
            checks: vec![mk("cosmetic", 2), mk("critical", 10), mk("mid_a", 5), mk("mid_b", 5)],
        }];

        let mock = MockConnector::new(Technology::Kafka);
        let settings = settings();
        let mut acc = FindingAccumulator::new();
        let reports = run_sections(sections, &mock, &settings, &mut acc)
            .await
            .unwrap();

        let ran: Vec<&str> = observed.lock().unwrap().iter().map(|(n, _)| *n).collect();
        assert_eq!(
            ran,
            ["critical", "mid_a", "mid_b", "cosmetic"],
            "descending weight, stable within equal weight"
        );

        // Later checks see earlier findings.
        assert_eq!(
            acc.get("cosmetic").unwrap().data["prior_visible"],
            json!(3),
            "the last check must see all three earlier findings"
        );
        assert_eq!(reports[0].fragments.len(), 4);
    }

    #[tokio::test]
    async fn test_engine_fault_becomes_error_finding() {
        let order = Arc::new(AtomicUsize::new(0));
        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sections = vec![ReportSection {
            title: "Section",
            checks: vec![
                Box::new(RecordingCheck {
                    name: "exploder",
                    weight: 9,
                    order: order.clone(),
                    observed: observed.clone(),
                    fail: true,
                }) as Box<dyn Check>,
                Box::new(RecordingCheck {
                    name: "survivor",
                    weight: 1,
                    order: order.clone(),
                    observed: observed.clone(),
                    fail: false,
                }),
            ],
        }];

        let mock = MockConnector::new(Technology::Kafka);
        let settings = settings();
        let mut acc = FindingAccumulator::new();
        run_sections(sections, &mock, &settings, &mut acc)
            .await
            .unwrap();

        let exploded = acc.get("exploder").unwrap();
        assert_eq!(exploded.status, CheckStatus::Error);
        assert!(exploded.error_message.as_deref().unwrap().contains("simulated fault"));
        assert!(
            acc.get("survivor").is_some(),
            "one failing check must not abort the run"
        );
    }
}
