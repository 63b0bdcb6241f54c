//! Build staleness analysis
//!
//! Decides which models must be rebuilt. A model needs execution when its own
//! cache entry is missing, failed, or expired, when a direct upstream model needs
//! execution, or when a macro it uses changed. Upstream verdicts are memoized, so
//! staleness propagates through the whole graph in one pass.

use chrono::{DateTime, Utc};
use dbtlens_core::Settings;
use dbtlens_dbt::{BuildStatus, DependencyGraph, ModelNode, NodeType, Project};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

static SELECTION_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[,\s]+").expect("valid selection separator regex"));

/// Class of a reason to rebuild a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// The model's own cache entry is missing, failed, or expired
    ModelStale,

    /// A direct upstream model needs execution
    UpstreamModelsChanged,

    /// A macro the model uses changed
    UpstreamMacrosChanged,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelStale => "MODEL_STALE",
            Self::UpstreamModelsChanged => "UPSTREAM_MODELS_CHANGED",
            Self::UpstreamMacrosChanged => "UPSTREAM_MACROS_CHANGED",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One reason to rebuild a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReason {
    pub code: ReasonCode,
    pub description: String,
}

impl ExecutionReason {
    fn new(code: ReasonCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Staleness verdict for one model
///
/// `needs_execution` is fixed at construction from the collected reasons.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelExecutionAnalysis {
    model: String,
    needs_execution: bool,
    reasons: Vec<ExecutionReason>,
    last_built: Option<DateTime<Utc>>,
}

impl ModelExecutionAnalysis {
    fn new(model: impl Into<String>, reasons: Vec<ExecutionReason>, last_built: Option<DateTime<Utc>>) -> Self {
        Self {
            model: model.into(),
            needs_execution: !reasons.is_empty(),
            reasons,
            last_built,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn needs_execution(&self) -> bool {
        self.needs_execution
    }

    /// Every reason found, in check order
    pub fn reasons(&self) -> &[ExecutionReason] {
        &self.reasons
    }

    /// Whether any reason has the given code
    pub fn has_reason(&self, code: ReasonCode) -> bool {
        self.reasons.iter().any(|r| r.code == code)
    }

    /// Time of the last successful build, if any
    pub fn last_built(&self) -> Option<DateTime<Utc>> {
        self.last_built
    }

    /// Age of the cached build at `now`
    pub fn cache_age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_built.map(|built| now - built)
    }
}

/// Cache validity window and the instant the analysis runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub validity: chrono::Duration,
    pub now: DateTime<Utc>,
}

impl StalenessPolicy {
    pub fn new(validity: chrono::Duration, now: DateTime<Utc>) -> Self {
        Self { validity, now }
    }

    /// Policy from the configured validity window
    pub fn from_settings(settings: &Settings, now: DateTime<Utc>) -> Self {
        Self::new(settings.cache_validity(), now)
    }

    /// Whether a build made at `built` is older than the validity window
    pub fn is_expired(&self, built: DateTime<Utc>) -> bool {
        self.now - built > self.validity
    }

    fn validity_minutes(&self) -> i64 {
        self.validity.num_minutes()
    }
}

/// Memo state of one model during an analysis run
#[derive(Debug, Clone, Copy)]
enum Verdict {
    InProgress,
    Done(bool),
}

/// Decides which models need execution
pub struct BuildAnalyzer<'a> {
    project: &'a Project,
    graph: &'a DependencyGraph,
    policy: StalenessPolicy,
}

impl<'a> BuildAnalyzer<'a> {
    pub fn new(project: &'a Project, graph: &'a DependencyGraph, policy: StalenessPolicy) -> Self {
        Self { project, graph, policy }
    }

    pub fn policy(&self) -> &StalenessPolicy {
        &self.policy
    }

    /// Models named by a selection expression
    ///
    /// Tokens are separated by commas or whitespace. Each token is `name`,
    /// `name+` (plus downstream), `+name` (plus upstream), or `+name+` (both).
    /// Tokens naming no model contribute nothing. No selection means every model.
    pub fn resolve_selection(&self, selection: Option<&str>) -> BTreeSet<String> {
        let Some(selection) = selection.filter(|s| !s.trim().is_empty()) else {
            return self.project.models.keys().cloned().collect();
        };

        let mut selected = BTreeSet::new();
        for token in SELECTION_SEPARATOR.split(selection.trim()) {
            let (upstream, rest) = match token.strip_prefix('+') {
                Some(rest) => (true, rest),
                None => (false, token),
            };
            let (downstream, name) = match rest.strip_suffix('+') {
                Some(name) => (true, name),
                None => (false, rest),
            };

            if self.graph.node_type(name) != Some(NodeType::Model) {
                tracing::debug!(token, "selection token matches no model");
                continue;
            }

            selected.insert(name.to_string());
            if upstream {
                selected.extend(self.graph.only_models(&self.graph.upstream(name)));
            }
            if downstream {
                selected.extend(self.graph.only_models(&self.graph.downstream(name)));
            }
        }

        selected
    }

    /// Verdict for every selected model
    pub fn analyze_build_execution(&self, selection: Option<&str>) -> BTreeMap<String, ModelExecutionAnalysis> {
        let mut memo = HashMap::new();
        let selected = self.resolve_selection(selection);

        let analyses: BTreeMap<_, _> = selected
            .into_iter()
            .filter_map(|name| {
                let analysis = self.analyze_with(&name, &mut memo)?;
                Some((name, analysis))
            })
            .collect();

        tracing::debug!(
            models = analyses.len(),
            stale = analyses.values().filter(|a| a.needs_execution()).count(),
            "analyzed build execution"
        );

        analyses
    }

    /// Verdict for one model; None when the project has no such model
    pub fn analyze_model(&self, name: &str) -> Option<ModelExecutionAnalysis> {
        self.analyze_with(name, &mut HashMap::new())
    }

    /// Reasons rooted in the model's own cache entry
    pub fn own_state_reasons(&self, name: &str, model: &ModelNode) -> Vec<ExecutionReason> {
        let mut reasons = Vec::new();

        let Some(cache) = &model.cache else {
            reasons.push(ExecutionReason::new(
                ReasonCode::ModelStale,
                format!("Model '{name}' has no cache entry (changed since last cache or never cached)"),
            ));
            return reasons;
        };

        if cache.status == BuildStatus::NeverAttempted || cache.last_built.is_none() {
            reasons.push(ExecutionReason::new(
                ReasonCode::ModelStale,
                format!("Model '{name}' has never been built"),
            ));
        }

        if cache.status == BuildStatus::Failed {
            reasons.push(ExecutionReason::new(
                ReasonCode::ModelStale,
                format!("Model '{name}' failed on its last build"),
            ));
        }

        if let Some(built) = cache.last_built {
            if self.policy.is_expired(built) {
                reasons.push(ExecutionReason::new(
                    ReasonCode::ModelStale,
                    format!(
                        "Model '{name}' cache timed out ({}min limit)",
                        self.policy.validity_minutes()
                    ),
                ));
            }
        }

        reasons
    }

    fn analyze_with(&self, name: &str, memo: &mut HashMap<String, Verdict>) -> Option<ModelExecutionAnalysis> {
        let model = self.project.model(name)?;
        memo.insert(name.to_string(), Verdict::InProgress);

        let mut reasons = self.own_state_reasons(name, model);

        let changed_models: Vec<&str> = model
            .depends_on
            .models
            .iter()
            .filter(|upstream| self.needs_execution(upstream, memo))
            .map(String::as_str)
            .collect();
        if !changed_models.is_empty() {
            reasons.push(ExecutionReason::new(
                ReasonCode::UpstreamModelsChanged,
                format!("Upstream models changed: {}", changed_models.join(", ")),
            ));
        }

        let changed_macros: Vec<&str> = model
            .depends_on
            .macros
            .iter()
            .filter(|m| self.project.macro_changed(m))
            .map(String::as_str)
            .collect();
        if !changed_macros.is_empty() {
            reasons.push(ExecutionReason::new(
                ReasonCode::UpstreamMacrosChanged,
                format!("Upstream macros changed: {}", changed_macros.join(", ")),
            ));
        }

        let last_built = model.cache.as_ref().and_then(|c| c.last_built);
        let analysis = ModelExecutionAnalysis::new(name, reasons, last_built);
        memo.insert(name.to_string(), Verdict::Done(analysis.needs_execution()));

        tracing::debug!(
            model = name,
            needs_execution = analysis.needs_execution(),
            reasons = analysis.reasons().len(),
            "model staleness decided"
        );

        Some(analysis)
    }

    /// Memoized verdict of an upstream model
    fn needs_execution(&self, name: &str, memo: &mut HashMap<String, Verdict>) -> bool {
        match memo.get(name) {
            Some(Verdict::Done(verdict)) => return *verdict,
            Some(Verdict::InProgress) => {
                tracing::warn!(model = name, "dependency cycle detected; treating model as fresh");
                return false;
            }
            None => {}
        }

        self.analyze_with(name, memo)
            .is_some_and(|analysis| analysis.needs_execution())
    }
}

/// Counts over a set of verdicts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub to_execute: usize,
    pub to_skip: usize,
}

impl ExecutionSummary {
    pub fn from_analyses<'a>(analyses: impl IntoIterator<Item = &'a ModelExecutionAnalysis>) -> Self {
        let mut summary = Self::default();
        for analysis in analyses {
            summary.total += 1;
            if analysis.needs_execution() {
                summary.to_execute += 1;
            } else {
                summary.to_skip += 1;
            }
        }
        summary
    }
}
