//! CTE/subquery catalog
//!
//! One pass over a query tree enumerates every SELECT scope: the root query,
//! each CTE body, each derived table in FROM/JOIN and each query nested in an
//! expression. Scopes are told apart by the address of their `Query` node, so
//! same-named scopes at different depths never alias each other.

use crate::alias::{AliasBinding, AliasMapBuilder};
use crate::extractor::{ColumnReferenceExtractor, ExtractedColumns};
use indexmap::{IndexMap, IndexSet};
use sqlparser::ast::{Expr, Query, Select, SelectItem, SetExpr, TableFactor, TableWithJoins, Visit, Visitor};
use std::collections::HashMap;
use std::ops::ControlFlow;

/// How a scope is reached from its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// The query being analyzed
    Root,

    /// Body of a `WITH name AS (...)` definition
    Cte,

    /// Subquery in FROM/JOIN
    Derived,

    /// Subquery inside an expression (scalar, `IN`, `EXISTS`)
    Expression,
}

/// One SELECT-list item of a scope
#[derive(Debug, Clone, PartialEq)]
pub struct SelectEntry {
    /// Alias, column name, or expression text
    pub output_name: String,

    /// `*` or `t.*`
    pub wildcard: bool,

    /// Leaf columns of the item, resolved against the scope's bindings
    pub columns: ExtractedColumns,
}

impl SelectEntry {
    fn from_item(item: &SelectItem, bindings: &AliasBinding) -> Self {
        match item {
            SelectItem::UnnamedExpr(expr) => Self {
                output_name: expr_output_name(expr),
                wildcard: false,
                columns: ColumnReferenceExtractor::extract(expr, bindings),
            },
            SelectItem::ExprWithAlias { expr, alias } => Self {
                output_name: alias.value.clone(),
                wildcard: false,
                columns: ColumnReferenceExtractor::extract(expr, bindings),
            },
            SelectItem::QualifiedWildcard(..) | SelectItem::Wildcard(..) => Self {
                output_name: item.to_string(),
                wildcard: true,
                columns: ExtractedColumns::new(),
            },
        }
    }
}

/// Name a non-aliased expression is exposed under
fn expr_output_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_default(),
        Expr::Nested(inner) => expr_output_name(inner),
        Expr::Cast { expr, .. } => expr_output_name(expr),
        other => other.to_string(),
    }
}

/// A single SELECT with its own alias bindings
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub kind: ScopeKind,

    /// CTE name or derived-table alias
    pub name: Option<String>,

    pub bindings: AliasBinding,

    pub items: Vec<SelectEntry>,
}

impl Scope {
    /// Names of the non-wildcard output columns
    pub fn output_columns(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|item| !item.wildcard)
            .map(|item| item.output_name.as_str())
    }

    /// Whether any output item is a wildcard
    pub fn has_wildcard(&self) -> bool {
        self.items.iter().any(|item| item.wildcard)
    }
}

/// Output columns of one CTE
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CteColumns {
    pub columns: IndexSet<String>,

    /// Select list has `*`; the columns it expands to are not in `columns`
    pub has_wildcard: bool,
}

/// Every scope of a query plus the CTE column catalog
#[derive(Debug, Clone, Default)]
pub struct QueryCatalog {
    scopes: Vec<Scope>,
    cte_columns: IndexMap<String, CteColumns>,
}

impl QueryCatalog {
    /// Catalog a query tree
    pub fn build(query: &Query) -> Self {
        let mut collector = ScopeCollector::default();
        collector
            .origins
            .insert(query as *const Query, (ScopeKind::Root, None));
        match query.visit(&mut collector) {
            ControlFlow::Continue(()) => {}
            ControlFlow::Break(never) => match never {},
        }

        let mut cte_columns: IndexMap<String, CteColumns> = IndexMap::new();
        for scope in &collector.scopes {
            if let (ScopeKind::Cte, Some(name)) = (scope.kind, &scope.name) {
                // The leftmost branch of a set operation names the columns
                cte_columns.entry(name.clone()).or_insert_with(|| CteColumns {
                    columns: scope.output_columns().map(str::to_string).collect(),
                    has_wildcard: scope.has_wildcard(),
                });
            }
        }

        tracing::trace!(
            scopes = collector.scopes.len(),
            ctes = cte_columns.len(),
            "cataloged query scopes"
        );

        Self {
            scopes: collector.scopes,
            cte_columns,
        }
    }

    /// All scopes in discovery order (root first)
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// SELECT branches of the root query
    pub fn root(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter().filter(|s| s.kind == ScopeKind::Root)
    }

    /// Every scope other than the root
    pub fn nested(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter().filter(|s| s.kind != ScopeKind::Root)
    }

    /// Names of every CTE defined anywhere in the query
    pub fn cte_names(&self) -> impl Iterator<Item = &str> {
        self.cte_columns.keys().map(String::as_str)
    }

    pub fn is_cte(&self, name: &str) -> bool {
        self.cte_columns.contains_key(name)
    }

    /// Output columns of a CTE
    pub fn cte_columns(&self, cte: &str) -> Option<&CteColumns> {
        self.cte_columns.get(cte)
    }

    /// Whether a CTE names `column` in its select list; wildcards name nothing
    pub fn cte_has_column(&self, cte: &str, column: &str) -> bool {
        self.cte_columns
            .get(cte)
            .is_some_and(|c| c.columns.contains(column))
    }

    /// Whether a CTE selects `*`
    pub fn cte_has_wildcard(&self, cte: &str) -> bool {
        self.cte_columns.get(cte).is_some_and(|c| c.has_wildcard)
    }

    /// Output column names of the query itself
    pub fn output_columns(&self) -> Vec<String> {
        self.root()
            .next()
            .map(|scope| scope.output_columns().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Whether the query's own output contains a wildcard
    pub fn has_wildcard_output(&self) -> bool {
        self.root().next().is_some_and(Scope::has_wildcard)
    }
}

/// Builds scopes while the tree is borrowed
///
/// A parent registers the origin of each child query (CTE body, derived table)
/// before the visitor reaches it; queries nobody registered are expression subqueries.
#[derive(Default)]
struct ScopeCollector {
    origins: HashMap<*const Query, (ScopeKind, Option<String>)>,
    scopes: Vec<Scope>,
}

impl ScopeCollector {
    fn register(&mut self, query: &Query, kind: ScopeKind, name: Option<String>) {
        self.origins.insert(query as *const Query, (kind, name));
    }

    fn register_derived(&mut self, table: &TableWithJoins) {
        self.register_factor(&table.relation);
        for join in &table.joins {
            self.register_factor(&join.relation);
        }
    }

    fn register_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Derived { subquery, alias, .. } => {
                let name = alias.as_ref().map(|a| a.name.value.clone());
                self.register(subquery, ScopeKind::Derived, name);
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.register_derived(table_with_joins);
            }
            _ => {}
        }
    }
}

/// SELECT branches of a query body; parenthesized sub-bodies are returned separately
fn flatten_body<'a>(body: &'a SetExpr, selects: &mut Vec<&'a Select>, inner: &mut Vec<&'a Query>) {
    match body {
        SetExpr::Select(select) => selects.push(select),
        SetExpr::SetOperation { left, right, .. } => {
            flatten_body(left, selects, inner);
            flatten_body(right, selects, inner);
        }
        SetExpr::Query(query) => inner.push(query),
        _ => {}
    }
}

impl Visitor for ScopeCollector {
    type Break = std::convert::Infallible;

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        let (kind, name) = self
            .origins
            .remove(&(query as *const Query))
            .unwrap_or((ScopeKind::Expression, None));

        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.register(&cte.query, ScopeKind::Cte, Some(cte.alias.name.value.clone()));
            }
        }

        let mut selects = Vec::new();
        let mut inner = Vec::new();
        flatten_body(&query.body, &mut selects, &mut inner);

        // A parenthesized body is the same logical scope
        for nested in inner {
            self.register(nested, kind, name.clone());
        }

        for select in selects {
            for table in &select.from {
                self.register_derived(table);
            }

            let bindings = AliasMapBuilder::build(select);
            let items = select
                .projection
                .iter()
                .map(|item| SelectEntry::from_item(item, &bindings))
                .collect();

            tracing::trace!(?kind, name = name.as_deref(), tables = bindings.len(), "scope");
            self.scopes.push(Scope {
                kind,
                name: name.clone(),
                bindings,
                items,
            });
        }

        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sqlparser::ast::Statement;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn catalog(sql: &str) -> QueryCatalog {
        let statements = Parser::parse_sql(&GenericDialect {}, sql).unwrap();
        let Statement::Query(query) = &statements[0] else {
            panic!("not a query");
        };
        QueryCatalog::build(query)
    }

    fn kinds(catalog: &QueryCatalog) -> Vec<(ScopeKind, Option<&str>)> {
        catalog
            .scopes()
            .iter()
            .map(|s| (s.kind, s.name.as_deref()))
            .collect()
    }

    #[test]
    fn enumerates_every_scope() {
        let catalog = catalog(
            r#"
            WITH paid AS (SELECT order_id, amount FROM payments WHERE status = 'paid')
            SELECT o.id, p.amount, s.n
            FROM orders o
            JOIN paid p ON p.order_id = o.id
            JOIN (SELECT customer_id, COUNT(*) AS n FROM orders GROUP BY customer_id) AS s
              ON s.customer_id = o.customer_id
            WHERE o.id IN (SELECT order_id FROM refunds)
            "#,
        );

        assert_eq!(
            kinds(&catalog),
            vec![
                (ScopeKind::Root, None),
                (ScopeKind::Cte, Some("paid")),
                (ScopeKind::Derived, Some("s")),
                (ScopeKind::Expression, None),
            ]
        );
        assert_eq!(catalog.root().count(), 1);
        assert_eq!(catalog.nested().count(), 3);
    }

    #[test]
    fn cte_column_catalog() {
        let catalog = catalog(
            "WITH a AS (SELECT id, name AS full_name, UPPER(email) AS email FROM users) SELECT id FROM a",
        );

        let columns: Vec<&str> = catalog
            .cte_columns("a")
            .unwrap()
            .columns
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(columns, vec!["id", "full_name", "email"]);
        assert!(catalog.is_cte("a"));
        assert!(catalog.cte_has_column("a", "full_name"));
        assert!(!catalog.cte_has_column("a", "name"));
        assert!(!catalog.is_cte("users"));
    }

    #[test]
    fn wildcard_cte_names_no_columns() {
        let catalog = catalog("WITH a AS (SELECT * FROM users), b AS (SELECT id FROM a) SELECT anything FROM a");

        assert!(catalog.cte_columns("a").unwrap().columns.is_empty());
        assert!(!catalog.cte_has_column("a", "anything"));
        assert!(catalog.cte_has_wildcard("a"));
        assert!(!catalog.cte_has_wildcard("b"));
        assert!(!catalog.cte_has_wildcard("users"));
    }

    #[test]
    fn nested_ctes_are_cataloged() {
        let catalog = catalog(
            "SELECT x FROM (WITH inner_cte AS (SELECT x FROM t) SELECT x FROM inner_cte) AS d",
        );

        assert_eq!(catalog.cte_names().collect::<Vec<_>>(), vec!["inner_cte"]);
        assert_eq!(
            kinds(&catalog),
            vec![
                (ScopeKind::Root, None),
                (ScopeKind::Derived, Some("d")),
                (ScopeKind::Cte, Some("inner_cte")),
            ]
        );
    }

    #[test]
    fn set_operations_yield_one_scope_per_branch() {
        let catalog = catalog(
            "WITH u AS (SELECT id FROM a UNION ALL SELECT other_id FROM b) SELECT id FROM u",
        );

        let cte_scopes: Vec<&Scope> = catalog.nested().collect();
        assert_eq!(cte_scopes.len(), 2);
        assert!(cte_scopes.iter().all(|s| s.name.as_deref() == Some("u")));
        assert!(catalog.cte_has_column("u", "id"));
        assert!(!catalog.cte_has_column("u", "other_id"));
    }

    #[test]
    fn output_names() {
        let catalog = catalog(
            "SELECT o.id, CAST(o.total AS INT), amount AS paid, COUNT(*), o.* FROM orders o",
        );

        let root = catalog.root().next().unwrap();
        let names: Vec<&str> = root.items.iter().map(|i| i.output_name.as_str()).collect();
        assert_eq!(names, vec!["id", "total", "paid", "COUNT(*)", "o.*"]);
        assert_eq!(catalog.output_columns(), vec!["id", "total", "paid", "COUNT(*)"]);
        assert!(catalog.has_wildcard_output());
    }
}
