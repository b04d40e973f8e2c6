//! Report and findings emission. Fragments are concatenated per section
//! under `== Section` headings; the structured findings tree lands next
//! to the report as canonical JSON.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

use crate::cli::settings::Settings;
use crate::engine::check::SectionReport;
use crate::engine::findings::FindingAccumulator;
use crate::utilities::identifiers::sanitize_schema_name;

pub const REPORT_FILE: &str = "health_check.adoc";
pub const FINDINGS_FILE: &str = "structured_health_check_findings.json";

fn output_dir(settings: &Settings) -> PathBuf {
    settings
        .output_dir
        .join(sanitize_schema_name(&settings.company_name))
}

/// Writes the canonical findings tree to disk and returns its path.
pub fn write_findings(
    settings: &Settings,
    findings: &FindingAccumulator,
) -> anyhow::Result<PathBuf> {
    let dir = output_dir(settings);
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(FINDINGS_FILE);
    let tree = findings.to_tree();
    let body = serde_json::to_string_pretty(&tree).context("serializing findings tree")?;
    fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
    info!("structured findings saved to {}", path.display());
    Ok(path)
}

/// Assembles the report from section fragments and writes it to disk.
pub fn write_report(settings: &Settings, sections: &[SectionReport]) -> anyhow::Result<PathBuf> {
    let dir = output_dir(settings);
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(REPORT_FILE);

    let mut body = String::new();
    body.push_str(&format!(
        "= Health Check: {} ({})\n\n",
        settings.company_name, settings.technology
    ));
    for section in sections {
        body.push_str(&format!("== {}\n\n", section.title));
        for fragment in &section.fragments {
            body.push_str(fragment);
            body.push_str("\n\n");
        }
    }

    fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
    info!("report written to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::findings::FindingEnvelope;
    use crate::infrastructure::connectors::Technology;
    use serde_json::json;

    #[test]
    fn test_findings_and_report_round_trip_on_disk() {
        let temp = std::env::temp_dir().join(format!(
            "fleetcheck-writer-test-{}",
            std::process::id()
        ));
        let mut settings = Settings::for_tests(Technology::Kafka);
        settings.output_dir = temp.clone();
        settings.company_name = "Acme Corp".to_string();

        let mut findings = FindingAccumulator::new();
        findings
            .set(
                "under_replicated_partitions",
                FindingEnvelope::warning(7, "5 URPs", json!({"total_urp": 5})),
            )
            .unwrap();

        let findings_path = write_findings(&settings, &findings).unwrap();
        assert!(findings_path.ends_with("structured_health_check_findings.json"));
        assert!(findings_path.parent().unwrap().ends_with("acme_corp"));

        let raw = fs::read_to_string(&findings_path).unwrap();
        let tree: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            tree["under_replicated_partitions"]["data"]["total_urp"],
            json!(5)
        );

        let sections = vec![SectionReport {
            title: "Partition Health",
            fragments: vec!["=== Under-Replicated Partitions\nok".to_string()],
        }];
        let report_path = write_report(&settings, &sections).unwrap();
        let report = fs::read_to_string(&report_path).unwrap();
        assert!(report.contains("== Partition Health"));
        assert!(report.contains("=== Under-Replicated Partitions"));

        fs::remove_dir_all(&temp).ok();
    }
}
