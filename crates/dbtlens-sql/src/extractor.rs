//! Column reference extraction for a single SELECT-list expression

use crate::alias::AliasBinding;
use indexmap::IndexMap;
use sqlparser::ast::{Expr, Query, Visit, Visitor};
use std::ops::ControlFlow;

/// column name -> canonical table (None when no unique table is inferable)
///
/// Keys keep first-seen order; a column read twice keeps the table of its last read.
pub type ExtractedColumns = IndexMap<String, Option<String>>;

/// Collects leaf column nodes, refusing to enter nested queries
#[derive(Default)]
struct LeafCollector {
    /// (qualifier, column)
    leaves: Vec<(Option<String>, String)>,
}

impl Visitor for LeafCollector {
    type Break = ();

    fn pre_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        // Columns of a nested query belong to that query's own scope
        ControlFlow::Break(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.leaves.push((None, ident.value.clone())),
            Expr::CompoundIdentifier(parts) => match parts.as_slice() {
                [.., qualifier, column] => {
                    self.leaves.push((Some(qualifier.value.clone()), column.value.clone()))
                }
                [column] => self.leaves.push((None, column.value.clone())),
                [] => {}
            },
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// Finds the leaf column references of one expression
pub struct ColumnReferenceExtractor;

impl ColumnReferenceExtractor {
    /// Map every leaf column of `expr` to the table it reads from
    ///
    /// - qualified: the qualifier's binding, or None if the qualifier is unbound
    /// - unqualified: the scope's only table, or None if it reads from several
    ///
    /// An expression containing a nested query contributes nothing.
    pub fn extract(expr: &Expr, binding: &AliasBinding) -> ExtractedColumns {
        let mut collector = LeafCollector::default();
        if expr.visit(&mut collector).is_break() {
            return ExtractedColumns::new();
        }

        let mut columns = ExtractedColumns::new();
        for (qualifier, column) in collector.leaves {
            let table = match qualifier {
                Some(qualifier) => binding.resolve(&qualifier),
                None => binding.sole_target(),
            };
            columns.insert(column, table.map(str::to_string));
        }
        columns
    }
}
