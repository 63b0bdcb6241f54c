//! Settings (dbtlens.toml, environment, project detection)
//!
//! Every setting is resolved once with the precedence
//! environment > file > auto-detected > default, and keeps a record of
//! where its value came from so it can be shown to the user.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// SQL dialect used to parse model SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    /// Permissive generic SQL
    Generic,

    /// Strict ANSI SQL
    Ansi,

    /// BigQuery SQL dialect
    BigQuery,

    /// Snowflake SQL dialect
    Snowflake,

    /// PostgreSQL SQL dialect
    Postgres,

    /// Redshift SQL dialect
    Redshift,

    /// DuckDB SQL dialect
    DuckDb,

    /// Databricks / Spark SQL dialect
    Databricks,

    /// MySQL dialect
    MySql,

    /// SQLite dialect
    Sqlite,
}

impl SqlDialect {
    /// Map a dbt adapter type (`profiles.yml` `type:` / manifest `adapter_type`) to a dialect
    pub fn from_adapter(adapter: &str) -> Option<Self> {
        match adapter.trim().to_ascii_lowercase().as_str() {
            "generic" => Some(Self::Generic),
            "ansi" => Some(Self::Ansi),
            "bigquery" => Some(Self::BigQuery),
            "snowflake" => Some(Self::Snowflake),
            "postgres" | "postgresql" => Some(Self::Postgres),
            "redshift" => Some(Self::Redshift),
            "duckdb" => Some(Self::DuckDb),
            "databricks" | "spark" => Some(Self::Databricks),
            "mysql" => Some(Self::MySql),
            "sqlite" => Some(Self::Sqlite),
            // ANSI-ish engines without a dedicated parser dialect
            "athena" | "trino" | "presto" => Some(Self::Generic),
            _ => None,
        }
    }

    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Ansi => "ansi",
            Self::BigQuery => "bigquery",
            Self::Snowflake => "snowflake",
            Self::Postgres => "postgres",
            Self::Redshift => "redshift",
            Self::DuckDb => "duckdb",
            Self::Databricks => "databricks",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }
}

impl FromStr for SqlDialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_adapter(s).ok_or_else(|| ConfigError::UnsupportedDialect(s.to_string()))
    }
}

impl std::fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a setting value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingSource {
    /// Environment variable
    Environment,

    /// dbtlens.toml
    File,

    /// Derived from the dbt project on disk
    Detected,

    /// Built-in default
    Default,
}

impl std::fmt::Display for SettingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Environment => write!(f, "environment variable"),
            Self::File => write!(f, "config file"),
            Self::Detected => write!(f, "auto-detected"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// A resolved setting value with its provenance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Setting<T> {
    /// Effective value
    pub value: T,

    /// Kind of source that supplied the value
    pub source: SettingSource,

    /// Variable name or file path that supplied the value
    pub location: Option<String>,
}

impl<T> Setting<T> {
    fn new(value: T, source: SettingSource, location: Option<String>) -> Self {
        Self { value, source, location }
    }

    fn default_value(value: T) -> Self {
        Self::new(value, SettingSource::Default, None)
    }
}

/// One row of the settings listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingSummary {
    pub name: &'static str,
    pub value: String,
    pub source: SettingSource,
    pub location: Option<String>,
}

/// Raw contents of dbtlens.toml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSettings {
    #[serde(default)]
    pub debug: Option<bool>,

    #[serde(default)]
    pub project_dir: Option<PathBuf>,

    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    #[serde(default)]
    pub sql_dialect: Option<String>,

    #[serde(default)]
    pub cache_validity_minutes: Option<u64>,

    #[serde(default)]
    pub enforce_lineage_validation: Option<bool>,
}

impl FileSettings {
    /// Load from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Self::from_toml(&contents)
    }

    /// Load from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Effective dbtlens settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    /// Verbose logging
    pub debug: Setting<bool>,

    /// dbt project root
    pub project_dir: Setting<PathBuf>,

    /// Directory holding the cache store and the project snapshot
    pub cache_path: Setting<PathBuf>,

    /// SQL dialect for parsing
    pub sql_dialect: Setting<SqlDialect>,

    /// How long a successful build stays valid
    pub cache_validity_minutes: Setting<u64>,

    /// Whether lineage errors fail the run
    pub enforce_lineage_validation: Setting<bool>,
}

impl Settings {
    /// Config file searched for from the working directory upwards
    pub const FILE_NAME: &'static str = "dbtlens.toml";

    /// Default cache validity: one day
    pub const DEFAULT_CACHE_VALIDITY_MINUTES: u64 = 1440;

    /// Resolve settings using the process environment
    pub fn load(start_dir: &Path) -> Result<Self, ConfigError> {
        Self::load_with(start_dir, |name| std::env::var(name).ok())
    }

    /// Resolve settings with an explicit environment lookup
    pub fn load_with<F>(start_dir: &Path, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (file, file_location) = match find_upwards(start_dir, Self::FILE_NAME) {
            Some(path) => (
                FileSettings::from_file(&path)?,
                Some(path.display().to_string()),
            ),
            None => (FileSettings::default(), None),
        };

        let resolver = Resolver { env, file_location };

        let debug = resolver
            .lookup(&["DBTLENS_DEBUG"], file.debug, parse_bool)?
            .unwrap_or_else(|| Setting::default_value(false));

        let project_dir = match resolver.lookup(
            &["DBT_PROJECT_DIR", "DBTLENS_PROJECT_DIR"],
            file.project_dir.clone(),
            |raw| Ok(PathBuf::from(raw)),
        )? {
            Some(mut setting) => {
                if setting.value.is_relative() {
                    setting.value = start_dir.join(&setting.value);
                }
                setting
            }
            None => match find_upwards(start_dir, "dbt_project.yml") {
                Some(marker) => Setting::new(
                    marker.parent().map(Path::to_path_buf).unwrap_or_default(),
                    SettingSource::Detected,
                    Some(marker.display().to_string()),
                ),
                None => Setting::default_value(PathBuf::from(".")),
            },
        };

        let cache_path = resolver
            .lookup(&["DBTLENS_CACHE_PATH"], file.cache_path.clone(), |raw| Ok(PathBuf::from(raw)))?
            .unwrap_or_else(|| Setting::default_value(project_dir.value.join(".dbtlens")));

        let sql_dialect = match resolver.lookup(
            &["DBTLENS_SQL_DIALECT"],
            file.sql_dialect.clone(),
            |raw| Ok(raw.to_string()),
        )? {
            Some(raw) => Setting::new(raw.value.parse()?, raw.source, raw.location),
            None => detect_dialect(&project_dir.value)?,
        };

        let cache_validity_minutes = resolver
            .lookup(
                &["DBTLENS_CACHE_VALIDITY_MINUTES"],
                file.cache_validity_minutes,
                |raw| {
                    raw.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                        name: "cache_validity_minutes",
                        value: raw.to_string(),
                    })
                },
            )?
            .unwrap_or_else(|| Setting::default_value(Self::DEFAULT_CACHE_VALIDITY_MINUTES));

        let enforce_lineage_validation = resolver
            .lookup(
                &["DBTLENS_ENFORCE_LINEAGE_VALIDATION"],
                file.enforce_lineage_validation,
                parse_bool,
            )?
            .unwrap_or_else(|| Setting::default_value(true));

        Ok(Self {
            debug,
            project_dir,
            cache_path,
            sql_dialect,
            cache_validity_minutes,
            enforce_lineage_validation,
        })
    }

    /// Cache validity window as a duration, saturating at the largest duration
    pub fn cache_validity(&self) -> chrono::Duration {
        i64::try_from(self.cache_validity_minutes.value)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Default location of the project snapshot written by the project loader
    pub fn snapshot_path(&self) -> PathBuf {
        self.cache_path.value.join("project.json")
    }

    /// Every setting with its value and provenance, in display order
    pub fn all(&self) -> Vec<SettingSummary> {
        fn row<T: ToString>(name: &'static str, setting: &Setting<T>) -> SettingSummary {
            SettingSummary {
                name,
                value: setting.value.to_string(),
                source: setting.source,
                location: setting.location.clone(),
            }
        }

        fn path_row(name: &'static str, setting: &Setting<PathBuf>) -> SettingSummary {
            SettingSummary {
                name,
                value: setting.value.display().to_string(),
                source: setting.source,
                location: setting.location.clone(),
            }
        }

        vec![
            row("debug", &self.debug),
            path_row("project_dir", &self.project_dir),
            path_row("cache_path", &self.cache_path),
            row("sql_dialect", &self.sql_dialect),
            row("cache_validity_minutes", &self.cache_validity_minutes),
            row("enforce_lineage_validation", &self.enforce_lineage_validation),
        ]
    }
}

/// Environment and file lookups for one resolution pass
struct Resolver<F> {
    env: F,
    file_location: Option<String>,
}

impl<F> Resolver<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// First non-empty environment variable wins, then the file value
    fn lookup<T>(
        &self,
        env_names: &[&str],
        file_value: Option<T>,
        parse: impl Fn(&str) -> Result<T, ConfigError>,
    ) -> Result<Option<Setting<T>>, ConfigError> {
        for name in env_names {
            if let Some(raw) = (self.env)(name).filter(|v| !v.trim().is_empty()) {
                let value = parse(&raw)?;
                return Ok(Some(Setting::new(
                    value,
                    SettingSource::Environment,
                    Some((*name).to_string()),
                )));
            }
        }

        Ok(file_value.map(|value| {
            Setting::new(value, SettingSource::File, self.file_location.clone())
        }))
    }
}

fn parse_bool(raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: "boolean",
            value: raw.to_string(),
        }),
    }
}

/// Walk from `start` to the filesystem root looking for `file_name`
fn find_upwards(start: &Path, file_name: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

/// Read the adapter type dbt recorded in target/manifest.json
fn detect_dialect(project_dir: &Path) -> Result<Setting<SqlDialect>, ConfigError> {
    let manifest_path = project_dir.join("target").join("manifest.json");
    if !manifest_path.is_file() {
        return Err(ConfigError::MissingDialect);
    }

    let contents = std::fs::read_to_string(&manifest_path)
        .map_err(|e| ConfigError::IoError(e.to_string()))?;
    let manifest: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("{}: {}", manifest_path.display(), e)))?;

    let adapter = manifest
        .pointer("/metadata/adapter_type")
        .and_then(serde_json::Value::as_str)
        .ok_or(ConfigError::MissingDialect)?;

    Ok(Setting::new(
        adapter.parse()?,
        SettingSource::Detected,
        Some(manifest_path.display().to_string()),
    ))
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },

    #[error("Unsupported SQL dialect: {0}")]
    UnsupportedDialect(String),

    #[error(
        "SQL dialect must be set: use DBTLENS_SQL_DIALECT, sql_dialect in dbtlens.toml, \
         or run dbt so target/manifest.json records the adapter type"
    )]
    MissingDialect,
}
