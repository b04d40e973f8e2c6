//! The shipped check set, grouped into report sections per technology.
//!
//! Checks are content: each one reads through the connector contract and
//! emits a fragment plus a finding. The framework (registry, runner,
//! collection, persistence) lives under `engine` and `infrastructure`.

pub mod cassandra;
pub mod clickhouse;
pub mod common;
pub mod kafka;
pub mod postgres;
pub mod valkey;

use crate::engine::check::{CheckOutput, ReportSection};
use crate::engine::findings::FindingEnvelope;
use crate::infrastructure::connectors::Technology;
use crate::report::formatter::FragmentBuilder;

/// Report layout: section titles and the checks under them, per
/// technology. Within a section the runner orders by weight.
pub fn sections_for(technology: Technology) -> Vec<ReportSection> {
    match technology {
        Technology::Postgres => vec![
            ReportSection {
                title: "PostgreSQL Overview",
                checks: vec![Box::new(postgres::OverviewCheck)],
            },
            ReportSection {
                title: "Connections and Cache",
                checks: vec![
                    Box::new(postgres::ConnectionMetricsCheck),
                    Box::new(postgres::CacheHitRatioCheck),
                ],
            },
            ReportSection {
                title: "Replication",
                checks: vec![Box::new(postgres::ReplicationStatusCheck)],
            },
            ReportSection {
                title: "Cloud Metrics",
                checks: vec![Box::new(postgres::CloudCpuMetricsCheck)],
            },
            ReportSection {
                title: "Recommendations",
                checks: vec![Box::new(common::RecommendationSlotCheck)],
            },
        ],
        Technology::Kafka => vec![
            ReportSection {
                title: "Partition Health",
                checks: vec![
                    Box::new(kafka::UnderReplicatedPartitionsCheck),
                    Box::new(kafka::OfflinePartitionsCheck),
                ],
            },
            ReportSection {
                title: "Broker Resources",
                checks: vec![
                    Box::new(kafka::MemoryUsageCheck),
                    Box::new(kafka::FileDescriptorsCheck),
                ],
            },
            ReportSection {
                title: "Topics and Consumers",
                checks: vec![
                    Box::new(kafka::TopicOverviewCheck),
                    Box::new(kafka::ConsumerLagCheck),
                ],
            },
            ReportSection {
                title: "Recommendations",
                checks: vec![Box::new(common::RecommendationSlotCheck)],
            },
        ],
        Technology::Cassandra => vec![
            ReportSection {
                title: "Cluster Health",
                checks: vec![
                    Box::new(cassandra::ClusterStatusCheck),
                    Box::new(cassandra::ThreadPoolsCheck),
                ],
            },
            ReportSection {
                title: "Recommendations",
                checks: vec![Box::new(common::RecommendationSlotCheck)],
            },
        ],
        Technology::Clickhouse => vec![
            ReportSection {
                title: "Server Overview",
                checks: vec![Box::new(clickhouse::OverviewCheck)],
            },
            ReportSection {
                title: "Storage Health",
                checks: vec![Box::new(clickhouse::ExcessivePartsCheck)],
            },
            ReportSection {
                title: "Recommendations",
                checks: vec![Box::new(common::RecommendationSlotCheck)],
            },
        ],
        Technology::Valkey => vec![
            ReportSection {
                title: "Memory and Keyspace",
                checks: vec![
                    Box::new(valkey::MemoryUsageCheck),
                    Box::new(valkey::KeyspaceStatsCheck),
                ],
            },
            ReportSection {
                title: "Recommendations",
                checks: vec![Box::new(common::RecommendationSlotCheck)],
            },
        ],
    }
}

pub(crate) const SSH_REQUIRED_SETTINGS: &[&str] = &[
    "ssh_host or ssh_hosts",
    "ssh_user",
    "ssh_key_file or ssh_password",
];

/// Standard output for checks whose precondition is SSH access.
pub(crate) fn ssh_skip_output(title: &str) -> CheckOutput {
    let mut builder = FragmentBuilder::new();
    builder.h3(title).important(
        "This check requires SSH access.\n\n\
         Configure `ssh_hosts` (or `ssh_host`), `ssh_user`, and either\n\
         `ssh_key_file` or `ssh_password` in your settings.",
    );
    CheckOutput::new(
        builder.build(),
        FindingEnvelope::skipped("SSH not configured", SSH_REQUIRED_SETTINGS),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_check_names_unique_per_technology() {
        for technology in [
            Technology::Postgres,
            Technology::Kafka,
            Technology::Cassandra,
            Technology::Clickhouse,
            Technology::Valkey,
        ] {
            let mut seen = BTreeSet::new();
            for section in sections_for(technology) {
                for check in &section.checks {
                    assert!(
                        seen.insert(check.name()),
                        "duplicate check name '{}' for {technology}",
                        check.name()
                    );
                    let weight = check.weight();
                    assert!((1..=10).contains(&weight), "weight out of range");
                }
            }
        }
    }

    #[test]
    fn test_ssh_skip_output_contract() {
        let output = ssh_skip_output("File Descriptors");
        assert_eq!(
            output.finding.reason.as_deref(),
            Some("SSH not configured")
        );
        assert!(output
            .finding
            .required_settings
            .iter()
            .any(|s| s.contains("ssh_host")));
        assert!(output
            .finding
            .required_settings
            .iter()
            .any(|s| s.contains("ssh_user")));
    }
}
