//! Evolutionary search over program variants.
//!
//! # Overview
//!
//! One iteration of the search loop samples a parent from the archive,
//! renders a prompt, asks a generator for change text, patches the parent,
//! scores the child and adds it back:
//!
//! - **Archive** (`archive`): live population, capacity bound, biased sampling
//!   and durable JSON records
//! - **Retention** (`retention`): `best`, `pareto` and `diverse` policies
//! - **Evaluation** (`evaluation`): bounded-concurrency scoring with timeouts,
//!   subprocess isolation and cascade filtering
//! - **Generation** (`generator`): retry/fallback around a model backend with
//!   usage accounting
//! - **Patching** (`patch`): SEARCH/REPLACE blocks, evolve blocks and fenced
//!   replacements
//! - **Prompts** (`prompt`, `meta`): template rendering and template evolution
//! - **Controller** (`search`): the loop and its stop conditions
//!
//! # Example
//!
//! ```rust,no_run
//! use evolve_search::evolution::{
//!     CommandBackend, EvaluationPipeline, ProgramArchive, PromptBuilder, RetryingGenerator,
//!     ScoringEntryPoint, SearchController, SeedProgram, UsageMeter,
//! };
//! use evolve_search::schema::{BackendCommand, ScoringCommand, SearchConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = SearchConfig::default();
//! config.evaluation.scoring_command = Some(ScoringCommand {
//!     program: "python3".into(),
//!     args: vec!["score.py".into()],
//! });
//! config.generator.command = Some(BackendCommand {
//!     program: "llm".into(),
//!     args: vec!["-m".into(), "{model}".into()],
//! });
//!
//! let archive = ProgramArchive::open(&config.results_dir, &config.archive)?;
//! let entry = ScoringEntryPoint::from_config(&config.evaluation)?;
//! let pipeline = EvaluationPipeline::new(&config.evaluation, entry)?;
//! let backend = CommandBackend::from_config(&config.generator)?;
//! let usage = UsageMeter::new();
//! let generator = RetryingGenerator::new(backend, &config.generator)?.with_usage_meter(usage.clone());
//! let prompts = PromptBuilder::from_config(&config.prompt);
//!
//! let mut search = SearchController::new(
//!     config.controller.clone(),
//!     archive,
//!     pipeline,
//!     prompts,
//!     Box::new(generator),
//!     usage,
//! );
//! search.seed(vec![SeedProgram::from_file("initial.py")?]).await?;
//!
//! let outcome = search
//!     .run_with_callback(|progress| {
//!         println!("Iteration {}: best = {:.3}", progress.iteration, progress.best_score);
//!     })
//!     .await?;
//! println!("Stopped: {:?}", outcome.state);
//! # Ok(())
//! # }
//! ```

mod archive;
mod evaluation;
mod generator;
mod meta;
mod patch;
mod prompt;
mod retention;
mod search;

pub use archive::{
    ArchiveError, MAX_INSPIRATIONS, ProgramArchive, RecordStore, StoreError, TOP_THIRD_PROBABILITY,
};
pub use evaluation::{
    EvaluationPipeline, PARSE_ERROR_METRIC, RETURN_CODE_METRIC, Scorer, ScorerError,
    ScoringEntryPoint, apply_cascade, parse_scores,
};
pub use generator::{
    BackendError, CallState, CommandBackend, Completion, GenerationError, Generator,
    ModelBackend, RetryingGenerator, UsageMeter,
};
pub use meta::{MetaError, MetaEvolver, TemplateVersioner};
pub use patch::{
    CodePatcher, DEFAULT_EXTENSIONS, EvolveBlock, EvolveBlockParser, Patcher, find_evolve_blocks,
};
pub use prompt::{DEFAULT_TEMPLATE, DEFAULT_TEMPLATE_NAME, PromptBuilder, RenderedPrompt};
pub use retention::{
    BestAndNewest, KeepBest, ParetoFront, RetentionPolicy, dominates, non_dominated, rank_by,
};
pub use search::{DESCRIPTION_KEY, SearchController, SearchError, SeedProgram};
