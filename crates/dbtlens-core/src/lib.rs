//! dbtlens core
//!
//! Core domain model shared by every dbtlens crate: column lineage values,
//! diagnostics, reports, and typed settings.
//! Never rename diagnostic codes - they are part of the public API.

pub mod diagnostic;
pub mod lineage;
pub mod report;
pub mod config;

pub use diagnostic::{Diagnostic, DiagnosticCode, Severity, Location};
pub use lineage::{ColumnReference, ReferenceType};
pub use report::{Report, ReportSummary, ReportVersion};
pub use config::{ConfigError, Setting, SettingSource, Settings, SqlDialect};
