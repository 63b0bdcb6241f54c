//! dbtlens engine - Core business logic
//!
//! This crate implements the analyses dbtlens runs over a whole project:
//! - Build staleness (which models need re-execution, and why)
//! - Project-wide column lineage
//! - Column cross-check against model outputs and documented sources

pub mod staleness;
pub mod lineage_check;

pub use staleness::{BuildAnalyzer, ExecutionReason, ExecutionSummary, ModelExecutionAnalysis, ReasonCode, StalenessPolicy};
pub use lineage_check::{ColumnAnalysis, ModelLineage, ProjectLineage};
