//! Alias bindings for one SELECT scope
//!
//! Maps every alias visible in a scope's FROM/JOIN clauses to the canonical name
//! of the table it stands for. Nested scopes get their own bindings.

use crate::refs::canonical_table_name;
use indexmap::IndexMap;
use sqlparser::ast::{Select, TableFactor, TableWithJoins};

/// alias -> canonical table name, in FROM/JOIN order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasBinding(IndexMap<String, String>);

impl AliasBinding {
    /// Table bound to a qualifier
    pub fn resolve(&self, qualifier: &str) -> Option<&str> {
        self.0.get(qualifier).map(String::as_str)
    }

    /// The only bound table, when the scope reads from exactly one
    pub fn sole_target(&self) -> Option<&str> {
        match self.0.len() {
            1 => self.0.values().next().map(String::as_str),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical names of every bound table
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    /// (alias, table) pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(alias, table)| (alias.as_str(), table.as_str()))
    }

    fn bind(&mut self, alias: String, table: String) {
        self.0.insert(alias, table);
    }
}

impl FromIterator<(String, String)> for AliasBinding {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Builds [`AliasBinding`]s from SELECT nodes
pub struct AliasMapBuilder;

impl AliasMapBuilder {
    /// Bindings for one SELECT (not recursive into nested scopes)
    pub fn build(select: &Select) -> AliasBinding {
        let mut binding = AliasBinding::default();
        for table in &select.from {
            Self::bind_table_with_joins(table, &mut binding);
        }
        binding
    }

    fn bind_table_with_joins(table: &TableWithJoins, binding: &mut AliasBinding) {
        Self::bind_factor(&table.relation, binding);
        for join in &table.joins {
            Self::bind_factor(&join.relation, binding);
        }
    }

    fn bind_factor(factor: &TableFactor, binding: &mut AliasBinding) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let Some(raw) = name.0.last().map(|ident| ident.value.clone()) else {
                    return;
                };
                let alias = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| raw.clone());
                binding.bind(alias, canonical_table_name(&raw));
            }
            // A derived table is its own canonical name; its columns are traced separately
            TableFactor::Derived { alias: Some(alias), .. } => {
                let name = alias.name.value.clone();
                binding.bind(name.clone(), name);
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                Self::bind_table_with_joins(table_with_joins, binding);
            }
            _ => {}
        }
    }
}
