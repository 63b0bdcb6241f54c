//! Project-wide column lineage and column cross-check
//!
//! Resolves the column lineage of every model, then checks each external
//! reference against what the project knows: model output columns and the
//! documented columns of sources.

use dbtlens_core::{ColumnReference, Diagnostic, DiagnosticCode, Location, ReferenceType, Severity};
use dbtlens_dbt::{DependencyGraph, Project};
use dbtlens_sql::{DbtFunctionExtractor, LineageResolver, SqlParser, TracedReference};
use indexmap::IndexSet;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Lineage of one model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelLineage {
    pub model: String,
    pub path: String,
    pub references: Vec<TracedReference>,
    pub output_columns: Vec<String>,

    /// Output contains `*`, so its column list is incomplete
    pub wildcard_output: bool,

    /// CTEs whose select list has `*`
    pub wildcard_ctes: BTreeSet<String>,
}

impl ModelLineage {
    /// Column references as classified by the resolver
    pub fn column_references(&self) -> impl Iterator<Item = &ColumnReference> {
        self.references.iter().map(|traced| &traced.reference)
    }
}

/// Lineage of every model that could be analyzed
#[derive(Debug, Clone, Default)]
pub struct ProjectLineage {
    pub models: BTreeMap<String, ModelLineage>,

    /// Parse failures and unsupported statements
    pub diagnostics: Vec<Diagnostic>,
}

impl ProjectLineage {
    /// Parse and resolve every model; one failing model never stops the rest
    pub fn analyze(project: &Project, parser: &SqlParser) -> Self {
        let mut lineage = Self::default();

        for (name, model) in &project.models {
            let rendered = DbtFunctionExtractor::render(&model.sql);
            let file = (!model.path.is_empty()).then(|| Path::new(&model.path));

            let parsed = match parser.parse(&rendered, file) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(model = name.as_str(), error = %e.error, "failed to parse model SQL");
                    lineage.diagnostics.push(e.to_diagnostic().with_model(name));
                    continue;
                }
            };

            let Some(query) = parsed.as_query() else {
                let mut diag = Diagnostic::new(
                    DiagnosticCode::SqlUnsupportedStatement,
                    Severity::Warn,
                    format!("Model '{name}' is not a SELECT query; lineage skipped"),
                )
                .with_model(name);
                if let Some(location) = location_of(&model.path) {
                    diag = diag.with_location(location);
                }
                lineage.diagnostics.push(diag);
                continue;
            };

            let resolver = LineageResolver::new(query);
            let catalog = resolver.catalog();
            lineage.models.insert(
                name.clone(),
                ModelLineage {
                    model: name.clone(),
                    path: model.path.clone(),
                    references: resolver.resolve_traced(),
                    output_columns: catalog.output_columns(),
                    wildcard_output: catalog.has_wildcard_output(),
                    wildcard_ctes: catalog
                        .cte_names()
                        .filter(|cte| catalog.cte_has_wildcard(cte))
                        .map(str::to_string)
                        .collect(),
                },
            );
        }

        tracing::debug!(
            analyzed = lineage.models.len(),
            failed = lineage.diagnostics.len(),
            "project lineage resolved"
        );

        lineage
    }

    /// Number of column references across all models
    pub fn columns_traced(&self) -> usize {
        self.models.values().map(|m| m.references.len()).sum()
    }

    /// Cross-check external references against the project's known columns
    pub fn column_analysis(&self, project: &Project) -> ColumnAnalysis {
        let known = KnownColumns::build(project, self);
        let mut analysis = ColumnAnalysis::default();

        for (name, lineage) in &self.models {
            for traced in lineage.references.iter().filter(|t| t.reference.needs_external_check()) {
                let Some(table) = &traced.reference.table_reference else {
                    continue;
                };

                match known.columns_of(table) {
                    None => {
                        let unknown = analysis.referenced_non_existent_models.entry(name.clone()).or_default();
                        if !unknown.contains(table) {
                            unknown.push(table.clone());
                        }
                    }
                    Some(Checkable::Unchecked) => {}
                    Some(Checkable::Columns(columns)) => {
                        // Renamed columns are checked under their upstream name
                        if !columns.contains(&traced.source_column) {
                            let missing = analysis
                                .non_existent_columns
                                .entry(name.clone())
                                .or_default()
                                .entry(table.clone())
                                .or_default();
                            if !missing.contains(&traced.source_column) {
                                missing.push(traced.source_column.clone());
                            }
                        }
                    }
                }
            }
        }

        analysis
    }

    /// Every finding as a diagnostic, with the model's downstream impact
    pub fn diagnostics(&self, project: &Project, graph: &DependencyGraph) -> Vec<Diagnostic> {
        let mut diagnostics: Vec<Diagnostic> = self.diagnostics.clone();

        for (name, lineage) in &self.models {
            for reference in lineage.column_references() {
                match (reference.reference_type, &reference.table_reference, reference.resolved) {
                    (ReferenceType::Cte, Some(cte), Some(false)) if lineage.wildcard_ctes.contains(cte) => diagnostics
                        .push(
                            Diagnostic::new(
                                DiagnosticCode::SqlSelectStarUnexpandable,
                                Severity::Info,
                                format!(
                                    "Column '{}' is read from CTE '{cte}', whose SELECT * is not expanded; it is not checked",
                                    reference.column_name
                                ),
                            )
                            .with_model(name),
                        ),
                    (ReferenceType::Cte, Some(cte), Some(false)) => diagnostics.push(
                        Diagnostic::new(
                            DiagnosticCode::LineageInvalidCteReference,
                            Severity::Error,
                            format!("Column '{}' is not produced by CTE '{cte}'", reference.column_name),
                        )
                        .with_model(name),
                    ),
                    (ReferenceType::Internal, None, _) => diagnostics.push(
                        Diagnostic::new(
                            DiagnosticCode::LineageAmbiguousColumn,
                            Severity::Info,
                            format!(
                                "Column '{}' could come from more than one table; qualify it to trace its lineage",
                                reference.column_name
                            ),
                        )
                        .with_model(name),
                    ),
                    _ => {}
                }
            }

            if lineage.wildcard_output {
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticCode::SqlSelectStarUnexpandable,
                        Severity::Info,
                        format!("Output of '{name}' contains SELECT *; columns read from it are not checked"),
                    )
                    .with_model(name),
                );
            }
        }

        let analysis = self.column_analysis(project);
        for (name, tables) in &analysis.referenced_non_existent_models {
            for table in tables {
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticCode::LineageUnknownReference,
                        Severity::Error,
                        format!("'{table}' is neither a model nor a source of this project"),
                    )
                    .with_model(name),
                );
            }
        }
        for (name, tables) in &analysis.non_existent_columns {
            for (table, columns) in tables {
                for column in columns {
                    diagnostics.push(
                        Diagnostic::new(
                            DiagnosticCode::LineageMissingColumn,
                            Severity::Error,
                            format!("Column '{column}' does not exist in '{table}'"),
                        )
                        .with_model(name),
                    );
                }
            }
        }

        diagnostics
            .into_iter()
            .map(|diag| self.attach_context(diag, project, graph))
            .collect()
    }

    /// Fill in location and downstream impact from the diagnostic's model
    fn attach_context(&self, mut diag: Diagnostic, project: &Project, graph: &DependencyGraph) -> Diagnostic {
        let Some(name) = diag.model.clone() else {
            return diag;
        };

        if diag.location.is_none() {
            if let Some(location) = project.model(&name).and_then(|m| location_of(&m.path)) {
                diag = diag.with_location(location);
            }
        }

        let impact = graph.downstream(&name);
        if impact.is_empty() {
            diag
        } else {
            diag.with_impact(impact)
        }
    }
}

fn location_of(path: &str) -> Option<Location> {
    (!path.is_empty()).then(|| Location::new(path))
}

/// Result of the column cross-check
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ColumnAnalysis {
    /// model -> referenced unit -> columns it lacks
    pub non_existent_columns: BTreeMap<String, BTreeMap<String, Vec<String>>>,

    /// model -> referenced names that are neither models nor sources
    pub referenced_non_existent_models: BTreeMap<String, Vec<String>>,
}

impl ColumnAnalysis {
    pub fn is_clean(&self) -> bool {
        self.non_existent_columns.is_empty() && self.referenced_non_existent_models.is_empty()
    }
}

enum Checkable<'a> {
    /// Exists, but its columns are not fully known
    Unchecked,
    Columns(&'a IndexSet<String>),
}

/// Columns of every model and source in the project
struct KnownColumns {
    /// None when the column list is incomplete or unknown
    units: BTreeMap<String, Option<IndexSet<String>>>,
}

impl KnownColumns {
    fn build(project: &Project, lineage: &ProjectLineage) -> Self {
        let mut units = BTreeMap::new();

        for (name, source) in &project.sources {
            let columns = (!source.columns.is_empty()).then(|| source.columns.iter().cloned().collect());
            units.insert(name.clone(), columns);
        }

        // Models that failed to parse stay unchecked
        for name in project.models.keys() {
            let columns = lineage
                .models
                .get(name)
                .filter(|m| !m.wildcard_output)
                .map(|m| m.output_columns.iter().cloned().collect());
            units.insert(name.clone(), columns);
        }

        Self { units }
    }

    fn columns_of(&self, unit: &str) -> Option<Checkable<'_>> {
        self.units.get(unit).map(|columns| match columns {
            Some(columns) => Checkable::Columns(columns),
            None => Checkable::Unchecked,
        })
    }
}
