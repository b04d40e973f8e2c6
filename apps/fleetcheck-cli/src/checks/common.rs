//! Technology-agnostic checks.

use async_trait::async_trait;
use serde_json::json;

use crate::engine::check::{Check, CheckContext, CheckOutput};
use crate::engine::findings::{CheckStatus, FindingEnvelope};
use crate::engine::EngineError;
use crate::report::formatter::FragmentBuilder;

/// The slot where a downstream recommendation generator plugs in. It runs
/// last (weight 1) so every preceding finding is visible, and snapshots
/// what such a collaborator would consume. No outbound calls are made.
pub struct RecommendationSlotCheck;

#[async_trait]
impl Check for RecommendationSlotCheck {
    fn name(&self) -> &'static str {
        "run_recommendation"
    }

    fn weight(&self) -> u8 {
        1
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckOutput, EngineError> {
        let findings = ctx.prior_findings;
        let warnings = findings.count_with_status(CheckStatus::Warning);
        let criticals = findings.count_with_status(CheckStatus::Critical);
        let errors = findings.count_with_status(CheckStatus::Error);

        let attention: Vec<&str> = findings
            .all()
            .filter(|(_, env)| {
                matches!(env.status, CheckStatus::Warning | CheckStatus::Critical)
            })
            .map(|(name, _)| name)
            .collect();

        let mut builder = FragmentBuilder::new();
        builder.h3("Recommendation Input");
        if attention.is_empty() {
            builder.note(&format!(
                "{} finding(s) collected; nothing needs attention.",
                findings.len()
            ));
        } else {
            builder.note(&format!(
                "{} finding(s) collected; attention items: {}",
                findings.len(),
                attention.join(", ")
            ));
        }

        let data = json!({
            "checks_seen": findings.len(),
            "warnings": warnings,
            "criticals": criticals,
            "errors": errors,
            "attention_items": attention,
            "ai_analysis": {"status": "not_performed", "model": null},
        });

        Ok(CheckOutput::new(
            builder.build(),
            FindingEnvelope::success(
                format!("{} finding(s) summarized for recommendation", findings.len()),
                data,
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::settings::Settings;
    use crate::engine::findings::FindingAccumulator;
    use crate::infrastructure::connectors::test_support::MockConnector;
    use crate::infrastructure::connectors::Technology;

    #[tokio::test]
    async fn test_recommendation_slot_reads_prior_findings() {
        let mock = MockConnector::new(Technology::Kafka);
        let settings = Settings::for_tests(Technology::Kafka);
        let mut acc = FindingAccumulator::new();
        acc.set(
            "under_replicated_partitions",
            FindingEnvelope::warning(7, "5 URPs", json!({"total_urp": 5})),
        )
        .unwrap();
        acc.set(
            "memory_usage",
            FindingEnvelope::success("healthy", json!({"avg": 40.0})),
        )
        .unwrap();

        let ctx = CheckContext {
            connector: &mock,
            settings: &settings,
            prior_findings: &acc,
        };
        let output = RecommendationSlotCheck.run(&ctx).await.unwrap();
        assert_eq!(output.finding.data["checks_seen"], json!(2));
        assert_eq!(output.finding.data["warnings"], json!(1));
        assert_eq!(
            output.finding.data["attention_items"],
            json!(["under_replicated_partitions"])
        );
        // Downstream AI metadata resolution sees not_performed here.
        assert_eq!(
            output.finding.data["ai_analysis"]["status"],
            json!("not_performed")
        );
    }
}
