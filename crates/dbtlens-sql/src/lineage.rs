//! Column lineage resolution
//!
//! Classifies every column read by a query's top-level SELECT list, then adds the
//! columns that nested scopes read straight from external tables.
//!
//! Column names are unique across one resolution: the first scope to mention a
//! name (root query first, then nested scopes in discovery order) decides its
//! lineage. Same-named columns from different tables are therefore not told apart.

use crate::catalog::{QueryCatalog, Scope};
use dbtlens_core::{ColumnReference, ReferenceType};
use indexmap::IndexMap;
use sqlparser::ast::{Query, Statement};
use std::collections::HashSet;

/// Where one output column of a named scope comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceTarget {
    /// Read from exactly one column of exactly one table
    Column { table: String, column: String },

    /// Computed, aggregated, ambiguous or constant
    Opaque,
}

/// Result of following a trace to its end
#[derive(Debug, Clone, PartialEq, Eq)]
enum Traced {
    External { table: String, column: String },
    Opaque,
}

/// Flat trace table: scope name -> output column -> source
///
/// Covers every named nested scope (CTEs and aliased derived tables). Chains are
/// followed by repeated lookup rather than recursion.
#[derive(Debug, Clone, Default)]
pub struct ColumnTrace {
    scopes: IndexMap<String, IndexMap<String, TraceTarget>>,
}

impl ColumnTrace {
    pub fn build(catalog: &QueryCatalog) -> Self {
        let mut trace = Self::default();

        for scope in catalog.nested() {
            let Some(name) = &scope.name else {
                continue;
            };

            let entries = trace.scopes.entry(name.clone()).or_default();
            for item in scope.items.iter().filter(|item| !item.wildcard) {
                let target = match item.columns.iter().collect::<Vec<_>>().as_slice() {
                    [(column, Some(table))] => TraceTarget::Column {
                        table: table.clone(),
                        column: (*column).clone(),
                    },
                    _ => TraceTarget::Opaque,
                };
                entries.entry(item.output_name.clone()).or_insert(target);
            }
        }

        trace
    }

    /// Whether `name` is a traced scope
    pub fn is_traced(&self, name: &str) -> bool {
        self.scopes.contains_key(name)
    }

    /// One hop of the trace
    pub fn get(&self, scope: &str, column: &str) -> Option<&TraceTarget> {
        self.scopes.get(scope).and_then(|columns| columns.get(column))
    }

    /// Follow `table.column` through traced scopes until it leaves the query
    ///
    /// A missing or opaque entry ends the trace as opaque; so does a cycle.
    fn follow(&self, table: &str, column: &str) -> Traced {
        let mut table = table.to_string();
        let mut column = column.to_string();

        for _ in 0..=self.scopes.len() {
            let Some(columns) = self.scopes.get(&table) else {
                return Traced::External { table, column };
            };

            match columns.get(&column) {
                Some(TraceTarget::Column { table: next_table, column: next_column }) => {
                    table = next_table.clone();
                    column = next_column.clone();
                }
                Some(TraceTarget::Opaque) | None => return Traced::Opaque,
            }
        }

        Traced::Opaque
    }
}

/// A classified column and the column it reads in its attributed table
///
/// `source_column` differs from `reference.column_name` when the column was
/// traced through a renaming CTE or derived table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedReference {
    pub reference: ColumnReference,
    pub source_column: String,
}

impl TracedReference {
    fn untraced(reference: ColumnReference) -> Self {
        let source_column = reference.column_name.clone();
        Self { reference, source_column }
    }
}

/// Column names already placed in the result
#[derive(Debug, Default)]
struct SeenColumns(HashSet<String>);

impl SeenColumns {
    /// True the first time a name is offered
    fn first_sighting(&mut self, column: &str) -> bool {
        self.0.insert(column.to_string())
    }
}

/// Lineage resolver for one query
#[derive(Debug, Clone)]
pub struct LineageResolver {
    catalog: QueryCatalog,
    trace: ColumnTrace,
}

impl LineageResolver {
    /// Catalog and trace a query
    pub fn new(query: &Query) -> Self {
        let catalog = QueryCatalog::build(query);
        let trace = ColumnTrace::build(&catalog);
        Self { catalog, trace }
    }

    pub fn catalog(&self) -> &QueryCatalog {
        &self.catalog
    }

    pub fn trace(&self) -> &ColumnTrace {
        &self.trace
    }

    /// Column references of the query
    pub fn resolve(&self) -> Vec<ColumnReference> {
        self.resolve_traced().into_iter().map(|traced| traced.reference).collect()
    }

    /// Column references of the query, each with its upstream column name
    pub fn resolve_traced(&self) -> Vec<TracedReference> {
        let mut seen = SeenColumns::default();
        let mut result = Vec::new();

        for scope in self.catalog.root() {
            for (column, table) in Self::scope_columns(scope) {
                if seen.first_sighting(column) {
                    result.push(self.classify_traced(column, table));
                }
            }
        }

        for scope in self.catalog.nested() {
            // A scope reading a CTE would attribute CTE columns to the wrong table
            if scope.bindings.targets().any(|t| self.catalog.is_cte(t)) {
                tracing::trace!(scope = scope.name.as_deref(), "skipping scope that reads a CTE");
                continue;
            }

            for (column, table) in Self::scope_columns(scope) {
                if !seen.first_sighting(column) {
                    continue;
                }

                let traced = self.classify_traced(column, table);
                if traced.reference.reference_type == ReferenceType::External {
                    result.push(traced);
                }
            }
        }

        tracing::debug!(
            columns = result.len(),
            scopes = self.catalog.scopes().len(),
            "resolved column lineage"
        );

        result
    }

    /// Classify one column read from `table` (None = unattributed)
    pub fn classify(&self, column: &str, table: Option<&str>) -> ColumnReference {
        self.classify_traced(column, table).reference
    }

    /// Classify one column, keeping the name it has in the table it resolves to
    pub fn classify_traced(&self, column: &str, table: Option<&str>) -> TracedReference {
        let Some(table) = table else {
            return TracedReference::untraced(ColumnReference::unattributed(column));
        };

        if self.catalog.is_cte(table) {
            if !self.catalog.cte_has_column(table, column) {
                return TracedReference::untraced(ColumnReference::cte(column, table, false));
            }
            return match self.trace.follow(table, column) {
                Traced::External { table: source, column: source_column } => TracedReference {
                    reference: ColumnReference::external(column, source),
                    source_column,
                },
                Traced::Opaque => TracedReference::untraced(ColumnReference::cte(column, table, true)),
            };
        }

        if self.trace.is_traced(table) {
            return match self.trace.follow(table, column) {
                Traced::External { table: source, column: source_column } => TracedReference {
                    reference: ColumnReference::external(column, source),
                    source_column,
                },
                Traced::Opaque => TracedReference::untraced(ColumnReference::subquery(column, table)),
            };
        }

        TracedReference::untraced(ColumnReference::external(column, table))
    }

    /// Leaf columns of every non-wildcard item of a scope
    fn scope_columns(scope: &Scope) -> impl Iterator<Item = (&str, Option<&str>)> {
        scope
            .items
            .iter()
            .filter(|item| !item.wildcard)
            .flat_map(|item| item.columns.iter())
            .map(|(column, table)| (column.as_str(), table.as_deref()))
    }
}

/// Column lineage of a parsed query; no query means no columns
pub fn resolve_column_lineage(query: Option<&Query>) -> Vec<ColumnReference> {
    match query {
        Some(query) => LineageResolver::new(query).resolve(),
        None => Vec::new(),
    }
}

/// Column lineage of a statement; only queries have lineage
pub fn resolve_statement_lineage(statement: &Statement) -> Vec<ColumnReference> {
    match statement {
        Statement::Query(query) => resolve_column_lineage(Some(query)),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn resolver(sql: &str) -> LineageResolver {
        let statements = Parser::parse_sql(&GenericDialect {}, sql).unwrap();
        let Statement::Query(query) = &statements[0] else {
            panic!("not a query");
        };
        LineageResolver::new(query)
    }

    #[test]
    fn trace_records_single_leaf_columns() {
        let resolver = resolver(
            "WITH c AS (SELECT id, amount * 2 AS doubled, 1 AS one FROM orders) SELECT id FROM c",
        );
        let trace = resolver.trace();

        assert_eq!(
            trace.get("c", "id"),
            Some(&TraceTarget::Column { table: "orders".into(), column: "id".into() })
        );
        assert_eq!(
            trace.get("c", "doubled"),
            Some(&TraceTarget::Column { table: "orders".into(), column: "amount".into() })
        );
        assert_eq!(trace.get("c", "one"), Some(&TraceTarget::Opaque));
        assert!(trace.is_traced("c"));
        assert!(!trace.is_traced("orders"));
    }

    #[test]
    fn chained_ctes_resolve_to_the_real_table() {
        let resolver = resolver(
            r#"
            WITH base AS (SELECT id FROM ___ref___stg_orders___),
                 renamed AS (SELECT id AS order_id FROM base)
            SELECT order_id FROM renamed
            "#,
        );

        let traced = resolver.classify_traced("order_id", Some("renamed"));
        assert_eq!(traced.reference, ColumnReference::external("order_id", "stg_orders"));
        assert_eq!(traced.source_column, "id");
    }

    #[test]
    fn cyclic_names_end_as_opaque() {
        // Derived tables may reuse names, so a name can point back at itself
        let resolver = resolver("SELECT x FROM (SELECT x FROM (SELECT x FROM t) AS d) AS d");

        let reference = resolver.classify("x", Some("d"));
        assert_eq!(reference.reference_type, ReferenceType::Subquery);
        assert_eq!(reference.resolved, Some(true));
    }

    #[test]
    fn classification_rules() {
        let resolver = resolver(
            r#"
            WITH totals AS (
                SELECT customer_id, SUM(amount) AS total, SUM(amount - refund) AS net
                FROM payments GROUP BY customer_id
            )
            SELECT t.total, t.customer_id, s.n, c.name
            FROM totals t
            JOIN (SELECT COUNT(*) AS n, region FROM stores GROUP BY region) s ON true
            JOIN customers c ON c.id = t.customer_id
            "#,
        );

        assert_eq!(
            resolver.classify("total", Some("totals")),
            ColumnReference::external("total", "payments")
        );
        assert_eq!(resolver.classify_traced("total", Some("totals")).source_column, "amount");
        assert_eq!(resolver.classify("net", Some("totals")), ColumnReference::cte("net", "totals", true));
        assert_eq!(
            resolver.classify("customer_id", Some("totals")),
            ColumnReference::external("customer_id", "payments")
        );
        assert_eq!(resolver.classify("missing", Some("totals")), ColumnReference::cte("missing", "totals", false));
        assert_eq!(resolver.classify("n", Some("s")), ColumnReference::subquery("n", "s"));
        assert_eq!(resolver.classify("region", Some("s")), ColumnReference::external("region", "stores"));
        assert_eq!(resolver.classify("name", Some("customers")), ColumnReference::external("name", "customers"));
        assert_eq!(resolver.classify("id", None), ColumnReference::unattributed("id"));
    }

    #[test]
    fn renamed_column_keeps_selected_name() {
        let resolver = resolver("WITH c AS (SELECT id AS order_id FROM orders) SELECT order_id, id FROM c");

        assert_eq!(
            resolver.resolve(),
            vec![
                ColumnReference::external("order_id", "orders"),
                ColumnReference::cte("id", "c", false),
            ]
        );
    }

    #[test]
    fn traced_aggregate_and_its_input_both_surface() {
        let resolver = resolver(
            "WITH t AS (SELECT SUM(amount) AS total, amount FROM payments GROUP BY amount) SELECT total, amount FROM t",
        );

        let traced = resolver.resolve_traced();
        let pairs: Vec<(&str, &str)> = traced
            .iter()
            .map(|t| (t.reference.column_name.as_str(), t.source_column.as_str()))
            .collect();
        assert_eq!(pairs, vec![("total", "amount"), ("amount", "amount")]);
        assert!(traced
            .iter()
            .all(|t| t.reference.table_reference.as_deref() == Some("payments")));
    }

    #[test]
    fn wildcard_cte_column_is_unresolved() {
        let resolver = resolver("WITH a AS (SELECT * FROM users) SELECT x FROM a");

        assert_eq!(resolver.resolve(), vec![ColumnReference::cte("x", "a", false)]);
    }

    #[test]
    fn empty_input() {
        assert!(resolve_column_lineage(None).is_empty());
    }

    #[test]
    fn non_query_statements_have_no_lineage() {
        let statements = Parser::parse_sql(&GenericDialect {}, "DROP TABLE orders").unwrap();
        assert!(resolve_statement_lineage(&statements[0]).is_empty());
    }
}
