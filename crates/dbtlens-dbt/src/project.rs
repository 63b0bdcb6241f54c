//! Project snapshot parsing
//!
//! The project loader writes a JSON snapshot of every model (with its rendered SQL),
//! macro and source, plus the cache metadata of each model's last build.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Project snapshot (project.json)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Models keyed by name
    #[serde(default)]
    pub models: BTreeMap<String, ModelNode>,

    /// Macros keyed by name
    #[serde(default)]
    pub macros: BTreeMap<String, MacroNode>,

    /// Sources keyed by canonical name (`<source_name>__<table>`)
    #[serde(default)]
    pub sources: BTreeMap<String, SourceNode>,
}

impl Project {
    /// Load project snapshot from file
    pub fn from_file(path: &Path) -> Result<Self, ProjectError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProjectError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_str(&contents)
    }

    /// Parse project snapshot from JSON string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(json: &str) -> Result<Self, ProjectError> {
        let project: Self = serde_json::from_str(json)
            .map_err(|e| ProjectError::ParseError(e.to_string()))?;

        project.validate()?;
        Ok(project)
    }

    /// Get a model by name
    pub fn model(&self, name: &str) -> Option<&ModelNode> {
        self.models.get(name)
    }

    /// Get a source by canonical name
    pub fn source(&self, name: &str) -> Option<&SourceNode> {
        self.sources.get(name)
    }

    /// Whether a macro changed since the last build
    pub fn macro_changed(&self, name: &str) -> bool {
        self.macros.get(name).is_some_and(|m| m.changed)
    }

    /// Every model must list only known models as dependencies
    fn validate(&self) -> Result<(), ProjectError> {
        for (name, model) in &self.models {
            for dep in &model.depends_on.models {
                if !self.models.contains_key(dep) {
                    return Err(ProjectError::UnknownDependency {
                        model: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A model (transformation unit)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelNode {
    /// Path to the SQL file, relative to the project root
    #[serde(default)]
    pub path: String,

    /// Rendered SQL (macros expanded, refs encoded)
    #[serde(default)]
    pub sql: String,

    /// Direct dependencies
    #[serde(default)]
    pub depends_on: DependsOn,

    /// Cache metadata; absent when the model has no valid cache entry
    #[serde(default)]
    pub cache: Option<CacheEntry>,
}

/// Direct dependencies of a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    /// Upstream model names
    #[serde(default)]
    pub models: Vec<String>,

    /// Macro names used by the model
    #[serde(default)]
    pub macros: Vec<String>,

    /// Canonical source names
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Outcome of the last build attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    NeverAttempted,
    Succeeded,
    Failed,
}

/// Cached build metadata for one model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Time of the last successful build
    #[serde(default)]
    pub last_built: Option<DateTime<Utc>>,

    /// Outcome of the last build attempt
    #[serde(default)]
    pub status: BuildStatus,
}

impl CacheEntry {
    /// Time elapsed since the last successful build
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_built.map(|built| now - built)
    }
}

/// A macro
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroNode {
    /// Whether the macro's content changed since it was last cached
    #[serde(default)]
    pub changed: bool,
}

/// A source table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceNode {
    /// Source name (e.g., "raw")
    pub source_name: String,

    /// Table name (e.g., "customers")
    pub name: String,

    /// Documented column names (may be empty)
    #[serde(default)]
    pub columns: Vec<String>,
}

impl SourceNode {
    /// Canonical name, as produced by decoding a source reference
    pub fn full_name(&self) -> String {
        format!("{}__{}", self.source_name, self.name)
    }
}

/// Project snapshot errors
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("Failed to read project snapshot {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse project snapshot JSON: {0}")]
    ParseError(String),

    #[error("Model '{model}' depends on unknown model '{dependency}'")]
    UnknownDependency { model: String, dependency: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SNAPSHOT: &str = r#"{
        "models": {
            "stg_customers": {
                "path": "models/stg_customers.sql",
                "sql": "select id, name from ___source___raw__customers___",
                "depends_on": { "sources": ["raw__customers"] },
                "cache": { "last_built": "2026-01-01T00:00:00Z", "status": "succeeded" }
            },
            "customers": {
                "path": "models/customers.sql",
                "sql": "select id from ___ref___stg_customers___",
                "depends_on": { "models": ["stg_customers"], "macros": ["cents_to_dollars"] }
            }
        },
        "macros": { "cents_to_dollars": { "changed": true } },
        "sources": {
            "raw__customers": { "source_name": "raw", "name": "customers", "columns": ["id", "name"] }
        }
    }"#;

    #[test]
    fn parse_snapshot() {
        let project = Project::from_str(SNAPSHOT).unwrap();

        assert_eq!(project.models.len(), 2);
        let staging = project.model("stg_customers").unwrap();
        assert_eq!(staging.depends_on.sources, vec!["raw__customers".to_string()]);

        let cache = staging.cache.as_ref().unwrap();
        assert_eq!(cache.status, BuildStatus::Succeeded);
        assert!(cache.last_built.is_some());

        assert!(project.model("customers").unwrap().cache.is_none());
        assert!(project.macro_changed("cents_to_dollars"));
        assert!(!project.macro_changed("missing"));
        assert_eq!(project.source("raw__customers").unwrap().full_name(), "raw__customers");
    }

    #[test]
    fn status_defaults_to_never_attempted() {
        let entry: CacheEntry = serde_json::from_str("{}").unwrap();
        assert_eq!(entry.status, BuildStatus::NeverAttempted);
        assert_eq!(entry.last_built, None);
    }

    #[test]
    fn cache_age() {
        let built: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let entry = CacheEntry { last_built: Some(built), status: BuildStatus::Succeeded };
        let now = built + chrono::Duration::minutes(90);

        assert_eq!(entry.age(now), Some(chrono::Duration::minutes(90)));
    }

    #[test]
    fn unknown_model_dependency_is_rejected() {
        let json = r#"{ "models": { "a": { "depends_on": { "models": ["ghost"] } } } }"#;
        let err = Project::from_str(json).unwrap_err();
        assert!(matches!(err, ProjectError::UnknownDependency { .. }));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        std::fs::write(&path, SNAPSHOT).unwrap();

        let project = Project::from_file(&path).unwrap();
        assert_eq!(project.sources.len(), 1);

        let missing = Project::from_file(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ProjectError::IoError(..))));
    }
}
