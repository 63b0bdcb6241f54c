//! End-to-end analysis of a project snapshot

use chrono::{DateTime, Duration, Utc};
use dbtlens_core::{DiagnosticCode, Report, SqlDialect};
use dbtlens_dbt::{DependencyGraph, Project};
use dbtlens_engine::{BuildAnalyzer, ExecutionSummary, ProjectLineage, ReasonCode, StalenessPolicy};
use dbtlens_sql::SqlParser;
use pretty_assertions::assert_eq;

const SNAPSHOT: &str = r#"
{
  "models": {
    "stg_customers": {
      "path": "models/staging/stg_customers.sql",
      "sql": "SELECT id AS customer_id, name FROM {{ source('raw', 'customers') }}",
      "depends_on": { "sources": ["raw__customers"] },
      "cache": { "last_built": "2026-03-01T11:00:00Z", "status": "succeeded" }
    },
    "stg_orders": {
      "path": "models/staging/stg_orders.sql",
      "sql": "SELECT id AS order_id, customer_id, amount / 100.0 AS amount FROM {{ source('raw', 'orders') }}",
      "depends_on": { "macros": ["cents_to_dollars"], "sources": ["raw__orders"] },
      "cache": { "last_built": "2026-02-20T00:00:00Z", "status": "succeeded" }
    },
    "customer_orders": {
      "path": "models/marts/customer_orders.sql",
      "sql": "WITH orders AS (SELECT customer_id, SUM(amount) AS lifetime_value FROM {{ ref('stg_orders') }} GROUP BY customer_id) SELECT c.customer_id, c.name, o.lifetime_value, c.segment FROM {{ ref('stg_customers') }} c LEFT JOIN orders o ON o.customer_id = c.customer_id",
      "depends_on": { "models": ["stg_customers", "stg_orders"] },
      "cache": { "last_built": "2026-03-01T11:30:00Z", "status": "succeeded" }
    }
  },
  "macros": {
    "cents_to_dollars": { "changed": false }
  },
  "sources": {
    "raw__customers": { "source_name": "raw", "name": "customers", "columns": ["id", "name"] },
    "raw__orders": { "source_name": "raw", "name": "orders", "columns": ["id", "customer_id", "amount"] }
  }
}
"#;

fn now() -> DateTime<Utc> {
    "2026-03-01T12:00:00Z".parse().unwrap()
}

#[test]
fn expired_staging_model_rebuilds_its_mart() {
    let project = Project::from_str(SNAPSHOT).unwrap();
    let graph = DependencyGraph::from_project(&project);
    let analyzer = BuildAnalyzer::new(&project, &graph, StalenessPolicy::new(Duration::days(1), now()));

    let analyses = analyzer.analyze_build_execution(None);

    assert!(!analyses["stg_customers"].needs_execution());
    assert_eq!(
        analyses["stg_orders"].reasons()[0].description,
        "Model 'stg_orders' cache timed out (1440min limit)"
    );
    assert_eq!(
        analyses["customer_orders"].reasons()[0].description,
        "Upstream models changed: stg_orders"
    );
    assert_eq!(
        analyses["stg_customers"].cache_age(now()),
        Some(Duration::hours(1))
    );
    assert_eq!(
        ExecutionSummary::from_analyses(analyses.values()),
        ExecutionSummary { total: 3, to_execute: 2, to_skip: 1 }
    );
}

#[test]
fn selection_limits_the_analysis() {
    let project = Project::from_str(SNAPSHOT).unwrap();
    let graph = DependencyGraph::from_project(&project);
    let analyzer = BuildAnalyzer::new(&project, &graph, StalenessPolicy::new(Duration::days(30), now()));

    let analyses = analyzer.analyze_build_execution(Some("stg_customers+"));

    let selected: Vec<&str> = analyses.keys().map(String::as_str).collect();
    assert_eq!(selected, vec!["customer_orders", "stg_customers"]);
    assert!(analyses.values().all(|a| !a.has_reason(ReasonCode::UpstreamModelsChanged)));
}

#[test]
fn lineage_report_flags_undocumented_column() {
    let project = Project::from_str(SNAPSHOT).unwrap();
    let graph = DependencyGraph::from_project(&project);
    let lineage = ProjectLineage::analyze(&project, &SqlParser::from_dialect(SqlDialect::DuckDb));

    assert_eq!(lineage.models.len(), 3);
    assert_eq!(
        lineage.models["stg_customers"].output_columns,
        vec!["customer_id", "name"]
    );

    let report = Report::from_diagnostics(lineage.diagnostics(&project, &graph))
        .with_coverage(lineage.models.len(), lineage.columns_traced());

    let codes: Vec<DiagnosticCode> = report.diagnostics.iter().map(|d| d.code).collect();
    assert_eq!(codes, vec![DiagnosticCode::LineageMissingColumn]);
    assert_eq!(report.diagnostics[0].message, "Column 'segment' does not exist in 'stg_customers'");
    assert_eq!(report.diagnostics[0].model.as_deref(), Some("customer_orders"));
    assert!(report.has_errors());
    assert_eq!(report.summary.models_checked, 3);
}
