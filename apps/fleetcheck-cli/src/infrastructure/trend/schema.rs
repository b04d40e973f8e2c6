//! Idempotent DDL for a tenant schema. Every statement is
//! `CREATE ... IF NOT EXISTS` and is issued at the start of each write.
//! The schema name arriving here is always the sanitized form.

pub fn ddl_statements(schema: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.health_check_runs (
                run_id SERIAL PRIMARY KEY,
                company VARCHAR(100) NOT NULL,
                database VARCHAR(100) NOT NULL,
                host VARCHAR(255) NOT NULL,
                timestamp TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                target_version VARCHAR(100),
                total_checks INTEGER DEFAULT 0,
                successful_checks INTEGER DEFAULT 0,
                failed_checks INTEGER DEFAULT 0,
                ai_status VARCHAR(50),
                ai_model VARCHAR(100),
                duration_seconds DOUBLE PRECISION,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.module_findings (
                finding_id SERIAL PRIMARY KEY,
                run_id INTEGER REFERENCES {schema}.health_check_runs(run_id) ON DELETE CASCADE,
                check_name VARCHAR(100) NOT NULL,
                status VARCHAR(50) NOT NULL,
                severity_level VARCHAR(20),
                severity_score INTEGER,
                data_json JSONB,
                error_message TEXT,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.trend_metrics (
                metric_id SERIAL PRIMARY KEY,
                run_id INTEGER REFERENCES {schema}.health_check_runs(run_id) ON DELETE CASCADE,
                metric_name VARCHAR(100) NOT NULL,
                metric_value DOUBLE PRECISION,
                metric_unit VARCHAR(20),
                metric_category VARCHAR(50),
                metric_description TEXT,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_health_check_runs_company_timestamp
             ON {schema}.health_check_runs(company, timestamp)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_module_findings_run_check
             ON {schema}.module_findings(run_id, check_name)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_trend_metrics_run_metric
             ON {schema}.trend_metrics(run_id, metric_name)"
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_statement_is_idempotent() {
        for statement in ddl_statements("acme") {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "DDL must be idempotent: {statement}"
            );
        }
    }

    #[test]
    fn test_cascade_on_child_tables() {
        let statements = ddl_statements("acme");
        let findings = statements.iter().find(|s| s.contains("module_findings")).unwrap();
        let metrics = statements.iter().find(|s| s.contains("trend_metrics")).unwrap();
        assert!(findings.contains("ON DELETE CASCADE"));
        assert!(metrics.contains("ON DELETE CASCADE"));
    }

    #[test]
    fn test_schema_name_is_used_verbatim() {
        // The sanitized name is the only identifier ever interpolated.
        let statements = ddl_statements("acme_corp");
        assert!(statements[0].ends_with("acme_corp"));
        assert!(statements[1].contains("acme_corp.health_check_runs"));
    }
}
