//! Configuration types for an evolutionary program search run.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Directory holding durable program records.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Source files used to seed an empty archive.
    #[serde(default)]
    pub initial_programs: Vec<PathBuf>,
    /// Population archive settings.
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Evaluation pipeline settings.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Search loop and stopping criteria.
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Mutation operator settings.
    #[serde(default)]
    pub generator: GeneratorConfig,
    /// Prompt templates and problem context.
    #[serde(default)]
    pub prompt: PromptConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            initial_programs: Vec::new(),
            archive: ArchiveConfig::default(),
            evaluation: EvaluationConfig::default(),
            controller: ControllerConfig::default(),
            generator: GeneratorConfig::default(),
            prompt: PromptConfig::default(),
        }
    }
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

/// Retention policy applied when the archive exceeds its capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionKind {
    /// Keep the highest primary-metric records.
    Best,
    /// Keep the non-dominated front, filled by primary metric.
    #[default]
    Pareto,
    /// Keep the best half plus the newest records.
    Diverse,
}

impl fmt::Display for RetentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetentionKind::Best => "best",
            RetentionKind::Pareto => "pareto",
            RetentionKind::Diverse => "diverse",
        };
        f.write_str(name)
    }
}

impl FromStr for RetentionKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best" => Ok(RetentionKind::Best),
            "pareto" => Ok(RetentionKind::Pareto),
            "diverse" => Ok(RetentionKind::Diverse),
            other => Err(ConfigError::UnknownRetention(other.to_string())),
        }
    }
}

/// Population archive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Maximum number of live records.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Retention policy.
    #[serde(default)]
    pub retention: RetentionKind,
    /// Ordered metric names; index 0 is the primary metric.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,
    /// Extension used for the standalone source copy of each record.
    #[serde(default = "default_extension")]
    pub source_extension: String,
    /// Random seed for parent sampling.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            retention: RetentionKind::default(),
            metrics: default_metrics(),
            source_extension: default_extension(),
            random_seed: None,
        }
    }
}

impl ArchiveConfig {
    /// Primary metric name.
    pub fn primary_metric(&self) -> &str {
        self.metrics.first().map(String::as_str).unwrap_or("fitness")
    }
}

fn default_capacity() -> usize {
    100
}
fn default_metrics() -> Vec<String> {
    vec!["fitness".to_string()]
}
fn default_extension() -> String {
    "py".to_string()
}

/// A single cascade rule: results whose `metric` is below `threshold`
/// are reduced to that metric alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeRule {
    pub metric: String,
    pub threshold: f64,
}

impl CascadeRule {
    pub fn new(metric: impl Into<String>, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            threshold,
        }
    }
}

/// External scoring program. Invoked as `program args... <candidate-path>`
/// and expected to print a JSON object of metric values on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Evaluation pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Scoring program used by the command-line runner.
    #[serde(default)]
    pub scoring_command: Option<ScoringCommand>,
    /// Working directory for scoring.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Maximum number of evaluations running at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-evaluation wall-clock limit in seconds.
    #[serde(default = "default_eval_timeout")]
    pub timeout_secs: f64,
    /// Ordered cascade rules.
    #[serde(default)]
    pub cascade: Vec<CascadeRule>,
    /// Extension of the temporary candidate file.
    #[serde(default = "default_extension")]
    pub file_extension: String,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            scoring_command: None,
            working_dir: default_working_dir(),
            max_workers: default_max_workers(),
            timeout_secs: default_eval_timeout(),
            cascade: Vec::new(),
            file_extension: default_extension(),
        }
    }
}

impl EvaluationConfig {
    /// Per-evaluation time limit.
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        positive_duration(self.timeout_secs)
    }

    /// Validate evaluation parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidWorkers);
        }
        self.timeout()?;
        for rule in &self.cascade {
            if !rule.threshold.is_finite() {
                return Err(ConfigError::InvalidThreshold(rule.metric.clone()));
            }
        }
        Ok(())
    }
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_max_workers() -> usize {
    4
}
fn default_eval_timeout() -> f64 {
    60.0
}

/// Resources that can be capped by a run budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetResource {
    /// Number of generator calls.
    #[serde(alias = "llm_calls")]
    GeneratorCalls,
    /// Tokens reported by the model backend.
    Tokens,
    /// Generator calls whose primary model exhausted its retries.
    FailedCalls,
}

impl fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BudgetResource::GeneratorCalls => "generator_calls",
            BudgetResource::Tokens => "tokens",
            BudgetResource::FailedCalls => "failed_calls",
        };
        f.write_str(name)
    }
}

/// Search loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Maximum number of iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Resource limits; reaching any of them stops the run.
    #[serde(default)]
    pub budget: BTreeMap<BudgetResource, f64>,
    /// Target scores; the run stops once the best record meets all of them.
    #[serde(default)]
    pub target_scores: BTreeMap<String, f64>,
    /// Run template evolution every N iterations.
    #[serde(default = "default_meta_interval")]
    pub meta_interval: usize,
    /// Number of top records handed to template evolution.
    #[serde(default = "default_top_k")]
    pub meta_top_k: usize,
    /// Number of best records returned when the run ends.
    #[serde(default = "default_top_k")]
    pub best_count: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            budget: BTreeMap::new(),
            target_scores: BTreeMap::new(),
            meta_interval: default_meta_interval(),
            meta_top_k: default_top_k(),
            best_count: default_top_k(),
        }
    }
}

fn default_max_iterations() -> usize {
    100
}
fn default_meta_interval() -> usize {
    10
}
fn default_top_k() -> usize {
    5
}

/// Command used to reach a model. `{model}` in `args` is replaced by the
/// model identifier; the prompt is written to stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Mutation operator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Primary model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Models tried in order once the primary is exhausted.
    #[serde(default)]
    pub fallback_models: Vec<String>,
    /// Attempts on the primary model.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Fixed delay between primary attempts, in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: f64,
    /// Per-call time limit, in seconds.
    #[serde(default = "default_generator_timeout")]
    pub timeout_secs: f64,
    /// Backend command for the command-line runner.
    #[serde(default)]
    pub command: Option<BackendCommand>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            fallback_models: Vec::new(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay(),
            timeout_secs: default_generator_timeout(),
            command: None,
        }
    }
}

fn default_model() -> String {
    "default".to_string()
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    5.0
}
fn default_generator_timeout() -> f64 {
    60.0
}

/// Prompt construction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Directory of `*.txt` / `*.md` templates.
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
    /// Template used when no directory is configured.
    #[serde(default)]
    pub default_template: Option<String>,
    /// Directory of problem context files.
    #[serde(default)]
    pub context_dir: Option<PathBuf>,
    /// Maximum context length in characters.
    #[serde(default = "default_max_context")]
    pub max_context_length: usize,
    /// Enable periodic template evolution.
    #[serde(default)]
    pub evolve_templates: bool,
    /// Template evolution settings.
    #[serde(default)]
    pub meta: MetaConfig,
    /// Random seed for template selection.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            templates_dir: None,
            default_template: None,
            context_dir: None,
            max_context_length: default_max_context(),
            evolve_templates: false,
            meta: MetaConfig::default(),
            random_seed: None,
        }
    }
}

fn default_max_context() -> usize {
    8000
}

/// Template evolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    #[serde(default = "default_max_prompts_per_round")]
    pub max_prompts_per_round: usize,
    #[serde(default = "default_min_programs_required")]
    pub min_programs_required: usize,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            max_prompts_per_round: default_max_prompts_per_round(),
            min_programs_required: default_min_programs_required(),
        }
    }
}

fn default_max_prompts_per_round() -> usize {
    2
}
fn default_min_programs_required() -> usize {
    5
}

// ============================================================================
// Loading and Validation
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Archive capacity must be at least 1")]
    InvalidCapacity,
    #[error("At least one metric must be configured")]
    NoMetrics,
    #[error("Metric {0} is listed more than once")]
    DuplicateMetric(String),
    #[error("Unknown retention policy: {0}")]
    UnknownRetention(String),
    #[error("Evaluation worker count must be at least 1")]
    InvalidWorkers,
    #[error("Timeout must be positive: {0}")]
    InvalidTimeout(f64),
    #[error("Cascade threshold for {0} must be finite")]
    InvalidThreshold(String),
    #[error("Generator retry attempts must be at least 1")]
    InvalidRetryAttempts,
    #[error("Retry delay must be non-negative: {0}")]
    InvalidRetryDelay(f64),
    #[error("Budget limit for {0} must be a non-negative number")]
    InvalidBudget(BudgetResource),
    #[error("Target score for {0} must be finite")]
    InvalidTarget(String),
    #[error("Meta evolution interval must be at least 1")]
    InvalidMetaInterval,
    #[error("{0} is required")]
    MissingCommand(&'static str),
}

impl SearchConfig {
    /// Load a configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: SearchConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.archive.validate()?;
        self.evaluation.validate()?;
        self.generator.validate()?;

        for (resource, limit) in &self.controller.budget {
            if !limit.is_finite() || *limit < 0.0 {
                return Err(ConfigError::InvalidBudget(*resource));
            }
        }
        for (metric, target) in &self.controller.target_scores {
            if !target.is_finite() {
                return Err(ConfigError::InvalidTarget(metric.clone()));
            }
        }
        if self.controller.meta_interval == 0 {
            return Err(ConfigError::InvalidMetaInterval);
        }

        Ok(())
    }
}

impl ArchiveConfig {
    /// Validate archive parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        if self.metrics.is_empty() {
            return Err(ConfigError::NoMetrics);
        }
        for (i, metric) in self.metrics.iter().enumerate() {
            if self.metrics[..i].contains(metric) {
                return Err(ConfigError::DuplicateMetric(metric.clone()));
            }
        }
        Ok(())
    }
}

impl GeneratorConfig {
    /// Per-call time limit.
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        positive_duration(self.timeout_secs)
    }

    /// Delay between attempts on the primary model.
    pub fn retry_delay(&self) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.retry_delay_secs)
            .map_err(|_| ConfigError::InvalidRetryDelay(self.retry_delay_secs))
    }

    /// Validate generator parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_attempts == 0 {
            return Err(ConfigError::InvalidRetryAttempts);
        }
        self.retry_delay()?;
        self.timeout()?;
        Ok(())
    }
}

fn positive_duration(secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or(ConfigError::InvalidTimeout(secs))
}
