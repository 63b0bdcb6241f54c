//! dbt project snapshot and DAG construction
//!
//! This crate handles:
//! - Parsing the project snapshot (models, macros, sources, cache metadata)
//! - Building dependency graphs (DAG)
//! - Upstream/downstream traversal for selection and impact analysis

pub mod project;
pub mod dag;

pub use project::{BuildStatus, CacheEntry, DependsOn, MacroNode, ModelNode, Project, ProjectError, SourceNode};
pub use dag::{DependencyGraph, NodeId, NodeType};
