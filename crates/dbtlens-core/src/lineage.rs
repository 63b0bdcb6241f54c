//! Column lineage values
//!
//! A [`ColumnReference`] says where one selected column comes from and how far
//! that origin could be verified while looking at a single query.

use serde::{Deserialize, Serialize};

/// Kind of table a column reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceType {
    /// A model or source outside the current query
    External,

    /// A CTE defined in the current query
    Cte,

    /// An inline derived table
    Subquery,

    /// Ambiguous or unresolved within the current query
    Internal,
}

impl std::fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::External => write!(f, "external"),
            Self::Cte => write!(f, "cte"),
            Self::Subquery => write!(f, "subquery"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// A selected column and its origin
///
/// `resolved` is tri-state:
/// - `Some(true)`: the column exists in a CTE or derived table of this query
/// - `Some(false)`: the column is absent or could not be attributed
/// - `None`: existence depends on an external model/source and is left to a catalog check
///
/// A reference without a table is always [`ReferenceType::Internal`] and unresolved;
/// the constructors keep that invariant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnReference {
    /// Column name
    pub column_name: String,

    /// Table, CTE or derived-table name the column is attributed to
    pub table_reference: Option<String>,

    /// Kind of `table_reference`
    pub reference_type: ReferenceType,

    /// Verification status (see type docs)
    pub resolved: Option<bool>,
}

impl ColumnReference {
    /// Column read from an external model or source, existence deferred
    pub fn external(column: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            column_name: column.into(),
            table_reference: Some(table.into()),
            reference_type: ReferenceType::External,
            resolved: None,
        }
    }

    /// Column read from a CTE of the current query
    pub fn cte(column: impl Into<String>, cte: impl Into<String>, resolved: bool) -> Self {
        Self {
            column_name: column.into(),
            table_reference: Some(cte.into()),
            reference_type: ReferenceType::Cte,
            resolved: Some(resolved),
        }
    }

    /// Column computed inside a derived table of the current query
    pub fn subquery(column: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            column_name: column.into(),
            table_reference: Some(alias.into()),
            reference_type: ReferenceType::Subquery,
            resolved: Some(true),
        }
    }

    /// Column that could not be attributed to any table
    pub fn unattributed(column: impl Into<String>) -> Self {
        Self {
            column_name: column.into(),
            table_reference: None,
            reference_type: ReferenceType::Internal,
            resolved: Some(false),
        }
    }

    /// Whether the column's existence must be checked against an external catalog
    pub fn needs_external_check(&self) -> bool {
        self.reference_type == ReferenceType::External && self.resolved.is_none()
    }
}

impl std::fmt::Display for ColumnReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table_reference.as_deref().unwrap_or("?");
        let resolved = match self.resolved {
            Some(true) => "resolved",
            Some(false) => "unresolved",
            None => "deferred",
        };
        write!(f, "{}.{} ({}, {})", table, self.column_name, self.reference_type, resolved)
    }
}
