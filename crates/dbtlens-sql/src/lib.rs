//! SQL parsing and column lineage
//!
//! This crate handles:
//! - Parsing SQL using sqlparser-rs with the configured dialect
//! - Decoding (and rendering) dbt `ref`/`source` table references
//! - Building per-scope alias bindings and the CTE/subquery catalog
//! - Resolving column lineage through joins, CTEs and derived tables

pub mod parser;
pub mod refs;
pub mod alias;
pub mod extractor;
pub mod catalog;
pub mod lineage;

pub use parser::{SqlParser, ParsedSql, ParseError};
pub use refs::{canonical_table_name, DbtFunctionExtractor, DbtReference, TABLE_REF_SEP};
pub use alias::{AliasBinding, AliasMapBuilder};
pub use extractor::{ColumnReferenceExtractor, ExtractedColumns};
pub use catalog::{CteColumns, QueryCatalog, Scope, ScopeKind, SelectEntry};
pub use lineage::{
    resolve_column_lineage, resolve_statement_lineage, ColumnTrace, LineageResolver, TraceTarget, TracedReference,
};
