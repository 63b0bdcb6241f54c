//! SQL parsing using sqlparser-rs
//!
//! Parses SQL into AST and provides error handling with diagnostics.

use dbtlens_core::{Diagnostic, DiagnosticCode, Location, Severity, SqlDialect};
use regex::Regex;
use sqlparser::ast::{Query, Statement};
use sqlparser::dialect::{
    AnsiDialect, BigQueryDialect, DatabricksDialect, Dialect, DuckDbDialect, GenericDialect,
    MySqlDialect, PostgreSqlDialect, RedshiftSqlDialect, SQLiteDialect, SnowflakeDialect,
};
use sqlparser::parser::{Parser, ParserError};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Position suffix sqlparser appends to its error messages
static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Line: (\d+), Column: (\d+)").expect("valid regex"));

/// SQL parser with configurable dialect
pub struct SqlParser {
    dialect: Box<dyn Dialect>,
    name: SqlDialect,
}

impl SqlParser {
    /// Create a new SQL parser with the default (generic) dialect
    pub fn new() -> Self {
        Self::from_dialect(SqlDialect::Generic)
    }

    /// Create a parser for a configured dialect
    pub fn from_dialect(dialect: SqlDialect) -> Self {
        let boxed: Box<dyn Dialect> = match dialect {
            SqlDialect::Generic => Box::new(GenericDialect {}),
            SqlDialect::Ansi => Box::new(AnsiDialect {}),
            SqlDialect::BigQuery => Box::new(BigQueryDialect {}),
            SqlDialect::Snowflake => Box::new(SnowflakeDialect {}),
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
            SqlDialect::Redshift => Box::new(RedshiftSqlDialect {}),
            SqlDialect::DuckDb => Box::new(DuckDbDialect {}),
            SqlDialect::Databricks => Box::new(DatabricksDialect {}),
            SqlDialect::MySql => Box::new(MySqlDialect {}),
            SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
        };

        Self { dialect: boxed, name: dialect }
    }

    /// Dialect this parser was built for
    pub fn dialect(&self) -> SqlDialect {
        self.name
    }

    /// Parse SQL string into AST
    ///
    /// Returns ParsedSql on success, or ParseError with diagnostic on failure.
    pub fn parse(&self, sql: &str, file_path: Option<&Path>) -> Result<ParsedSql, ParseError> {
        match Parser::parse_sql(&*self.dialect, sql) {
            Ok(statements) => Ok(ParsedSql {
                sql: sql.to_string(),
                statements,
                file_path: file_path.map(Path::to_path_buf),
            }),
            Err(error) => Err(ParseError {
                sql: sql.to_string(),
                error,
                file_path: file_path.map(Path::to_path_buf),
            }),
        }
    }

    /// Parse SQL from a file
    pub fn parse_file(&self, path: &Path) -> Result<ParsedSql, ParseError> {
        let sql = std::fs::read_to_string(path).map_err(|e| ParseError {
            sql: String::new(),
            error: ParserError::ParserError(format!("Failed to read file: {}", e)),
            file_path: Some(path.to_path_buf()),
        })?;

        self.parse(&sql, Some(path))
    }

    /// Parse SQL and return diagnostic on error
    pub fn parse_with_diagnostic(
        &self,
        sql: &str,
        file_path: Option<&Path>,
    ) -> Result<ParsedSql, Diagnostic> {
        self.parse(sql, file_path).map_err(|e| e.to_diagnostic())
    }
}

impl Default for SqlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Successfully parsed SQL with AST
#[derive(Debug, Clone)]
pub struct ParsedSql {
    /// Original SQL string
    pub sql: String,

    /// Parsed statements
    pub statements: Vec<Statement>,

    /// Source file path (if parsed from file)
    pub file_path: Option<PathBuf>,
}

impl ParsedSql {
    /// Get the first statement (a dbt model has exactly one)
    pub fn first_statement(&self) -> Option<&Statement> {
        self.statements.first()
    }

    /// Check if this is a SELECT statement
    pub fn is_select(&self) -> bool {
        matches!(self.first_statement(), Some(Statement::Query(_)))
    }

    /// Get the query if this is a SELECT statement
    pub fn as_query(&self) -> Option<&Query> {
        match self.first_statement() {
            Some(Statement::Query(query)) => Some(query.as_ref()),
            _ => None,
        }
    }

    /// Count the number of statements
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }
}

/// SQL parsing error with diagnostic information
#[derive(Debug, thiserror::Error)]
#[error("SQL parse error: {error}")]
pub struct ParseError {
    /// Original SQL string
    pub sql: String,

    /// Parser error from sqlparser
    #[source]
    pub error: ParserError,

    /// Source file path
    pub file_path: Option<PathBuf>,
}

impl ParseError {
    /// Line reported by the parser, if any (1-indexed)
    pub fn line(&self) -> Option<usize> {
        ERROR_LINE
            .captures(&self.error.to_string())
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Convert to a dbtlens diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        let message = format!("Failed to parse SQL: {}", self.error);
        let mut diag = Diagnostic::new(DiagnosticCode::SqlParseError, Severity::Error, message);

        if let Some(path) = &self.file_path {
            let file = path.display().to_string();
            let location = match self.line() {
                Some(line) => Location::with_line(file, line),
                None => Location::new(file),
            };
            diag = diag.with_location(location);
        }

        diag
    }
}
