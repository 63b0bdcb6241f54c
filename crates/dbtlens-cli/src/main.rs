use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use dbtlens_core::{ColumnReference, Diagnostic, DiagnosticCode, Location, Report, Severity, Settings};
use dbtlens_dbt::{DependencyGraph, Project};
use dbtlens_engine::{BuildAnalyzer, ExecutionSummary, ModelExecutionAnalysis, ProjectLineage, StalenessPolicy};
use dbtlens_sql::{resolve_column_lineage, DbtFunctionExtractor, SqlParser};

/// dbtlens - Column lineage and build staleness for dbt projects
#[derive(Parser)]
#[command(name = "dbtlens")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the column lineage of SQL files
    Lineage {
        /// SQL files or directories (searched for *.sql)
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Resolve lineage for every model and cross-check referenced columns
    Analyze {
        /// Project snapshot (default: <cache_path>/project.json)
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Output file for report.json
        #[arg(short, long, default_value = "report.json")]
        output: PathBuf,
    },

    /// Show which models need execution and why
    Plan {
        /// Project snapshot (default: <cache_path>/project.json)
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Selection expression, e.g. "+orders customers+"
        #[arg(long)]
        select: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show every setting with its value and where it came from
    Settings,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cwd = std::env::current_dir().context("Failed to read the working directory")?;
    let settings = Settings::load(&cwd).context("Invalid dbtlens configuration")?;

    init_logging(&settings);

    if cli.verbose {
        eprintln!("{} dialect: {}", "Using".cyan(), settings.sql_dialect.value);
    }

    match cli.command {
        Commands::Lineage { paths, json } => lineage_command(&settings, &paths, json, cli.verbose),
        Commands::Analyze { snapshot, output } => {
            analyze_command(&settings, snapshot.as_deref(), &output, cli.verbose)
        }
        Commands::Plan { snapshot, select, json } => {
            plan_command(&settings, snapshot.as_deref(), select.as_deref(), json, cli.verbose)
        }
        Commands::Settings => {
            settings_command(&settings);
            Ok(())
        }
    }
}

/// RUST_LOG wins; otherwise debug when enabled in settings, else warn
fn init_logging(settings: &Settings) {
    let default_level = if settings.debug.value { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_project(settings: &Settings, snapshot: Option<&Path>, verbose: bool) -> Result<Project> {
    let path = snapshot.map(Path::to_path_buf).unwrap_or_else(|| settings.snapshot_path());

    if verbose {
        eprintln!("{} {}", "Loading project snapshot from:".cyan(), path.display());
    }

    Project::from_file(&path).with_context(|| {
        format!(
            "Failed to load project snapshot {}. Run the project loader first or pass --snapshot.",
            path.display()
        )
    })
}

/// Lineage command - column references of individual SQL files
fn lineage_command(settings: &Settings, paths: &[PathBuf], json: bool, verbose: bool) -> Result<()> {
    let parser = SqlParser::from_dialect(settings.sql_dialect.value);
    let files = collect_sql_files(paths);

    if verbose {
        eprintln!("{} {} SQL files", "Resolving lineage for".cyan(), files.len());
    }

    let mut results: BTreeMap<String, Vec<ColumnReference>> = BTreeMap::new();
    let mut failures = 0;

    for file in &files {
        match resolve_file(&parser, file) {
            Ok(references) => {
                results.insert(file.display().to_string(), references);
            }
            Err(diag) => {
                failures += 1;
                eprintln!("  [{}] {}: {}", "ERROR".red().bold(), diag.code, diag.message);
                if let Some(loc) = &diag.location {
                    eprintln!("    at {}", loc);
                }
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for (file, references) in &results {
            println!("{}", file.bold());
            if references.is_empty() {
                println!("  {}", "(no column references)".dimmed());
            }
            for reference in references {
                println!("  {}", format_reference(reference));
            }
            println!();
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }

    Ok(())
}

/// Column references of one SQL file; read and parse failures stay local to the file
fn resolve_file(parser: &SqlParser, file: &Path) -> std::result::Result<Vec<ColumnReference>, Diagnostic> {
    let sql = std::fs::read_to_string(file).map_err(|e| {
        Diagnostic::new(
            DiagnosticCode::SqlParseError,
            Severity::Error,
            format!("Failed to read SQL file {}: {}", file.display(), e),
        )
        .with_location(Location::new(file.display().to_string()))
    })?;

    let rendered = DbtFunctionExtractor::render(&sql);
    let parsed = parser.parse_with_diagnostic(&rendered, Some(file))?;
    Ok(resolve_column_lineage(parsed.as_query()))
}

fn collect_sql_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "sql"))
                .collect();
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }

    files
}

fn format_reference(reference: &ColumnReference) -> String {
    let table = reference.table_reference.as_deref().unwrap_or("?");
    let line = format!("{:<30} {:<30} {}", reference.column_name, table, reference.reference_type);

    match reference.resolved {
        Some(false) => line.yellow().to_string(),
        _ => line,
    }
}

/// Analyze command - project lineage and column cross-check
fn analyze_command(settings: &Settings, snapshot: Option<&Path>, output: &Path, verbose: bool) -> Result<()> {
    let project = load_project(settings, snapshot, verbose)?;

    if verbose {
        eprintln!("{}", "Building dependency graph...".cyan());
    }
    let graph = DependencyGraph::from_project(&project);

    if verbose {
        eprintln!("{} {} models...", "Resolving lineage for".cyan(), project.models.len());
    }
    let parser = SqlParser::from_dialect(settings.sql_dialect.value);
    let lineage = ProjectLineage::analyze(&project, &parser);

    let report = Report::from_diagnostics(lineage.diagnostics(&project, &graph))
        .with_coverage(lineage.models.len(), lineage.columns_traced());

    report.save_to_file(output)?;

    if verbose {
        eprintln!("{} {}", "Report saved to:".green(), output.display());
    }

    print_report_summary(&report);

    // Exit with error code if there are errors
    if report.has_errors() && settings.enforce_lineage_validation.value {
        std::process::exit(1);
    }

    Ok(())
}

fn print_report_summary(report: &Report) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Column Lineage Report".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    println!("Version: {}", report.version);
    println!("Timestamp: {}", report.timestamp);
    println!();

    println!("{}", "Summary:".bold());
    println!("  Models checked:    {}", report.summary.models_checked);
    println!("  Columns traced:    {}", report.summary.columns_traced);
    println!("  Total diagnostics: {}", report.summary.total);

    if report.summary.errors > 0 {
        println!("  Errors:   {}", report.summary.errors.to_string().red().bold());
    } else {
        println!("  Errors:   {}", report.summary.errors.to_string().green());
    }

    if report.summary.warnings > 0 {
        println!("  Warnings: {}", report.summary.warnings.to_string().yellow());
    } else {
        println!("  Warnings: {}", report.summary.warnings.to_string().green());
    }

    println!("  Info:     {}", report.summary.info);
    println!();

    if report.diagnostics.is_empty() {
        println!("{}", "✓ No issues found!".green().bold());
    } else {
        println!("{}", "Diagnostics:".bold());
        for diag in &report.diagnostics {
            let severity_str = match diag.severity {
                Severity::Error => "ERROR".red().bold(),
                Severity::Warn => "WARN".yellow().bold(),
                Severity::Info => "INFO".cyan(),
            };

            match &diag.model {
                Some(model) => println!("  [{}] {} ({}): {}", severity_str, diag.code, model, diag.message),
                None => println!("  [{}] {}: {}", severity_str, diag.code, diag.message),
            }

            if let Some(loc) = &diag.location {
                println!("    at {}", loc);
            }

            if !diag.impact.is_empty() {
                println!("    Impact: {} downstream models", diag.impact.len());
                for model in &diag.impact {
                    println!("      - {}", model);
                }
            }
        }
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
}

/// Plan command - build staleness analysis
fn plan_command(
    settings: &Settings,
    snapshot: Option<&Path>,
    select: Option<&str>,
    json: bool,
    verbose: bool,
) -> Result<()> {
    let project = load_project(settings, snapshot, verbose)?;
    let graph = DependencyGraph::from_project(&project);

    let now = Utc::now();
    let analyzer = BuildAnalyzer::new(&project, &graph, StalenessPolicy::from_settings(settings, now));
    let analyses = analyzer.analyze_build_execution(select);

    if json {
        println!("{}", serde_json::to_string_pretty(&analyses)?);
    } else {
        print_execution_analysis(&analyses, now, verbose);
    }

    Ok(())
}

fn print_execution_analysis(
    analyses: &BTreeMap<String, ModelExecutionAnalysis>,
    now: chrono::DateTime<Utc>,
    verbose: bool,
) {
    let summary = ExecutionSummary::from_analyses(analyses.values());

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Build Execution Plan".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    println!("{}", "Summary:".bold());
    println!("  Total models: {}", summary.total);
    println!("  To execute:   {}", summary.to_execute.to_string().yellow());
    println!("  To skip:      {}", summary.to_skip.to_string().green());
    println!();

    if summary.to_execute > 0 {
        println!("{}", "Models to execute:".bold());
        for (name, analysis) in analyses.iter().filter(|(_, a)| a.needs_execution()) {
            println!("  {} {}", "▶".yellow(), name);
            if verbose {
                for reason in analysis.reasons() {
                    println!("      {} {}", format!("[{}]", reason.code).dimmed(), reason.description);
                }
            }
        }
        println!();
    }

    if summary.to_skip > 0 {
        println!("{}", "Models to skip:".bold());
        for (name, analysis) in analyses.iter().filter(|(_, a)| !a.needs_execution()) {
            let age = match analysis.cache_age(now) {
                Some(age) => format!("(cached {:.1}m ago)", age.num_seconds() as f64 / 60.0),
                None => "(never built)".to_string(),
            };
            println!("  {} {} {}", "✓".green(), name, age.dimmed());
        }
        println!();
    }

    println!("{}", "=".repeat(60).bright_blue());
}

/// Settings command - effective configuration with provenance
fn settings_command(settings: &Settings) {
    println!("{}", "dbtlens settings".bold());
    println!();

    for row in settings.all() {
        let location = row.location.map(|l| format!(" ({l})")).unwrap_or_default();
        println!(
            "  {:<28} {:<40} {}{}",
            row.name.bold(),
            row.value,
            row.source.to_string().cyan(),
            location.dimmed()
        );
    }
}
