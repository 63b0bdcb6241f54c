//! dbt `ref()` / `source()` reference encoding
//!
//! Rendered model SQL names its inputs with a delimiter-wrapped encoding so the
//! SQL stays parseable: `{{ ref('orders') }}` becomes `___ref___orders___` and
//! `{{ source('raw', 'orders') }}` becomes `___source___raw__orders___`.
//! Lineage works on the canonical names (`orders`, `raw__orders`).

use regex::Regex;
use std::sync::LazyLock;

/// Delimiter wrapping an encoded reference
pub const TABLE_REF_SEP: &str = "___";

/// `{{ ref(...) }}` or `{{ source(...) }}` call in model SQL
static DBT_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{-?\s*(ref|source)\s*\(([^)]*)\)\s*-?\}\}").expect("valid regex")
});

/// A reference to a dbt model or source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DbtReference {
    /// ref('model_name')
    Ref { model_name: String },

    /// source('source_name', 'table_name')
    Source { source_name: String, table_name: String },
}

impl DbtReference {
    /// Name used by the project catalog and the dependency graph
    pub fn canonical_name(&self) -> String {
        match self {
            Self::Ref { model_name } => model_name.clone(),
            Self::Source { source_name, table_name } => format!("{}__{}", source_name, table_name),
        }
    }

    /// Encoded table identifier
    pub fn encode(&self) -> String {
        let (kind, name) = match self {
            Self::Ref { .. } => ("ref", self.canonical_name()),
            Self::Source { .. } => ("source", self.canonical_name()),
        };
        format!("{sep}{kind}{sep}{name}{sep}", sep = TABLE_REF_SEP)
    }

    /// Decode an encoded table identifier
    pub fn decode(raw: &str) -> Option<Self> {
        let inner = raw.strip_prefix(TABLE_REF_SEP)?.strip_suffix(TABLE_REF_SEP)?;
        let (kind, name) = inner.split_once(TABLE_REF_SEP)?;
        if name.is_empty() {
            return None;
        }

        match kind {
            "ref" => Some(Self::Ref { model_name: name.to_string() }),
            "source" => {
                let (source_name, table_name) = name.split_once("__")?;
                Some(Self::Source {
                    source_name: source_name.to_string(),
                    table_name: table_name.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// Canonical name for a raw table identifier
///
/// Encoded references are decoded; a name that only starts with the delimiter
/// keeps its last segment; anything else is returned unchanged.
pub fn canonical_table_name(raw: &str) -> String {
    if let Some(reference) = DbtReference::decode(raw) {
        return reference.canonical_name();
    }

    if raw.starts_with(TABLE_REF_SEP) {
        if let Some(last) = raw
            .trim_matches('_')
            .split(TABLE_REF_SEP)
            .filter(|part| !part.is_empty())
            .last()
        {
            return last.to_string();
        }
    }

    raw.to_string()
}

/// Extracts and renders dbt functions in model SQL
pub struct DbtFunctionExtractor;

impl DbtFunctionExtractor {
    /// Extract all dbt references from SQL, in order of appearance
    pub fn extract(sql: &str) -> Vec<DbtReference> {
        DBT_CALL
            .captures_iter(sql)
            .filter_map(|caps| Self::parse_call(&caps[1], &caps[2]))
            .collect()
    }

    /// Rewrite every `{{ ref() }}` / `{{ source() }}` call into its encoded identifier
    ///
    /// Calls that cannot be parsed are left untouched.
    pub fn render(sql: &str) -> String {
        DBT_CALL
            .replace_all(sql, |caps: &regex::Captures<'_>| {
                match Self::parse_call(&caps[1], &caps[2]) {
                    Some(reference) => reference.encode(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn parse_call(function: &str, args: &str) -> Option<DbtReference> {
        let args: Vec<&str> = args
            .split(',')
            .map(str::trim)
            .filter(|arg| !arg.is_empty())
            .collect();

        match function {
            // ref('model') or ref('package', 'model')
            "ref" => {
                let model_name = match args.as_slice() {
                    [model] | [_, model] => Self::extract_string_literal(model)?,
                    _ => return None,
                };
                Some(DbtReference::Ref { model_name: model_name.to_string() })
            }
            "source" => match args.as_slice() {
                [source, table] => Some(DbtReference::Source {
                    source_name: Self::extract_string_literal(source)?.to_string(),
                    table_name: Self::extract_string_literal(table)?.to_string(),
                }),
                _ => None,
            },
            _ => None,
        }
    }

    /// Extract string literal from quoted string
    ///
    /// Handles both single and double quotes.
    fn extract_string_literal(s: &str) -> Option<&str> {
        let trimmed = s.trim();

        if let Some(content) = trimmed.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
            return Some(content);
        }

        if let Some(content) = trimmed.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            return Some(content);
        }

        None
    }
}
