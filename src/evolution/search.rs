//! Search controller: the sample, generate, patch, evaluate and add loop.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::schema::{
    ConfigError, ControllerConfig, ProgramRecord, RunState, Scores, SearchOutcome, SearchProgress,
    SearchStats,
};

use super::archive::{ArchiveError, ProgramArchive};
use super::evaluation::EvaluationPipeline;
use super::generator::{Generator, UsageMeter};
use super::meta::MetaEvolver;
use super::patch::{CodePatcher, Patcher};
use super::prompt::PromptBuilder;

/// Metadata key holding a seed program's description.
pub const DESCRIPTION_KEY: &str = "description";

/// Fatal search errors. Failures inside an iteration are logged and never
/// surface here.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("population is empty; seed the archive before running")]
    EmptyPopulation,

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// An initial program to seed an empty archive.
#[derive(Debug, Clone)]
pub struct SeedProgram {
    pub code: String,
    pub description: String,
}

impl SeedProgram {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }

    /// Read a seed program from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let code = fs::read_to_string(path)?;
        Ok(Self::new(
            code,
            format!("Initial program from {}", path.display()),
        ))
    }
}

/// Runs the search loop over an archive.
pub struct SearchController {
    config: ControllerConfig,
    archive: ProgramArchive,
    pipeline: EvaluationPipeline,
    prompts: PromptBuilder,
    generator: Box<dyn Generator>,
    patcher: Box<dyn Patcher>,
    meta: Option<Box<dyn MetaEvolver>>,
    usage: UsageMeter,
    iteration: usize,
    failed_iterations: usize,
    evaluations: usize,
    last_scores: Option<Scores>,
    state: RunState,
    stopped: Arc<AtomicBool>,
}

impl SearchController {
    /// Create a controller. `usage` must be the meter the generator records
    /// into for budgets to take effect.
    pub fn new(
        config: ControllerConfig,
        archive: ProgramArchive,
        pipeline: EvaluationPipeline,
        prompts: PromptBuilder,
        generator: Box<dyn Generator>,
        usage: UsageMeter,
    ) -> Self {
        Self {
            config,
            archive,
            pipeline,
            prompts,
            generator,
            patcher: Box::new(CodePatcher::default()),
            meta: None,
            usage,
            iteration: 0,
            failed_iterations: 0,
            evaluations: 0,
            last_scores: None,
            state: RunState::Idle,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_patcher(mut self, patcher: Box<dyn Patcher>) -> Self {
        self.patcher = patcher;
        self
    }

    pub fn with_meta_evolver(mut self, meta: Box<dyn MetaEvolver>) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Handle that stops the run at the next iteration boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn archive(&self) -> &ProgramArchive {
        &self.archive
    }

    pub fn pipeline(&self) -> &EvaluationPipeline {
        &self.pipeline
    }

    pub fn prompts(&self) -> &PromptBuilder {
        &self.prompts
    }

    pub fn usage(&self) -> &UsageMeter {
        &self.usage
    }

    /// Evaluate initial programs and add them to the archive.
    ///
    /// Returns the ids of the added records; records that could not be
    /// persisted are still returned.
    pub async fn seed(&mut self, programs: Vec<SeedProgram>) -> Result<Vec<String>, SearchError> {
        let codes: Vec<String> = programs.iter().map(|p| p.code.clone()).collect();
        let results = self.pipeline.batch_evaluate(&codes, None).await;
        self.evaluations += results.len();

        let mut ids = Vec::with_capacity(programs.len());
        for (program, scores) in programs.into_iter().zip(results) {
            let mut metadata = Map::new();
            metadata.insert(
                DESCRIPTION_KEY.to_string(),
                Value::String(program.description.clone()),
            );

            log::info!("Seed '{}' scored {}", program.description, scores);
            match self.archive.add(program.code, scores, None, Some(metadata)) {
                Ok(id) => ids.push(id),
                Err(ArchiveError::Persistence { id, source }) => {
                    log::warn!("Seed program {} not persisted: {}", id, source);
                    ids.push(id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(ids)
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> SearchProgress {
        let best = self.archive.best(None);
        SearchProgress {
            iteration: self.iteration,
            max_iterations: self.config.max_iterations,
            failed_iterations: self.failed_iterations,
            evaluations: self.evaluations,
            population: self.archive.len(),
            best_id: best.map(|r| r.id.clone()),
            best_score: best
                .map(|r| r.score(self.archive.primary_metric()))
                .unwrap_or(f64::NEG_INFINITY),
            last_scores: self.last_scores.clone(),
            usage: self.usage.snapshot(),
            state: self.state,
        }
    }

    fn should_stop(&self) -> Option<RunState> {
        if self.stopped.load(Ordering::Relaxed) {
            log::info!("Stop requested");
            return Some(RunState::StoppedManually);
        }

        if self.iteration >= self.config.max_iterations {
            log::info!("Reached maximum iterations: {}", self.config.max_iterations);
            return Some(RunState::StoppedByLimit);
        }

        for (resource, limit) in &self.config.budget {
            let used = self.usage.usage(*resource);
            if used >= *limit {
                log::info!("Budget exhausted for {}: {}/{}", resource, used, limit);
                return Some(RunState::StoppedByBudget);
            }
        }

        if !self.config.target_scores.is_empty()
            && let Some(best) = self.archive.best(None)
            && self
                .config
                .target_scores
                .iter()
                .all(|(metric, target)| best.scores.get(metric).is_some_and(|v| v >= *target))
        {
            log::info!("Target scores reached by program {}", best.id);
            return Some(RunState::StoppedByTarget);
        }

        None
    }

    /// One iteration. Every failure is contained here.
    async fn step(&mut self) {
        let iteration = self.iteration;

        let (parent, inspirations) = match self.archive.sample() {
            Ok(sample) => sample,
            Err(e) => {
                log::error!("Iteration {}: sampling failed: {}", iteration, e);
                self.failed_iterations += 1;
                return;
            }
        };

        let prompt = self.prompts.render(&parent, &inspirations, None);
        let changes = match self.generator.generate(&prompt.text).await {
            Ok(changes) => changes,
            Err(e) => {
                log::warn!("Iteration {}: generation failed: {}", iteration, e);
                self.failed_iterations += 1;
                return;
            }
        };

        let child = self.patcher.apply(&parent.code, &changes);
        if child == parent.code {
            log::info!("Iteration {}: child is identical to parent {}", iteration, parent.id);
        }

        let scores = self.pipeline.evaluate(&child, true).await;
        self.evaluations += 1;
        self.prompts
            .record_performance(&prompt.template, scores.get_or_worst(self.archive.primary_metric()));

        let mut metadata = Map::new();
        metadata.insert("template".to_string(), Value::String(prompt.template));
        metadata.insert("iteration".to_string(), Value::from(iteration));

        match self
            .archive
            .add(child, scores.clone(), Some(&parent.id), Some(metadata))
        {
            Ok(id) => log::info!("Iteration {}: program {} scored {}", iteration, id, scores),
            Err(ArchiveError::Persistence { id, source }) => {
                log::warn!("Iteration {}: program {} not persisted: {}", iteration, id, source)
            }
            Err(e) => {
                log::error!("Iteration {}: failed to add program: {}", iteration, e);
                self.failed_iterations += 1;
            }
        }

        self.last_scores = Some(scores);
    }

    async fn evolve_templates(&mut self) {
        let Some(meta) = &self.meta else {
            return;
        };

        let top: Vec<ProgramRecord> = self
            .archive
            .top(None, self.config.meta_top_k)
            .into_iter()
            .cloned()
            .collect();

        match meta.evolve(self.prompts.templates(), &top).await {
            Ok(templates) if templates.is_empty() => {
                log::debug!("Template evolution produced no templates")
            }
            Ok(templates) => {
                log::info!("Adding {} evolved templates", templates.len());
                self.prompts.update_templates(templates);
            }
            Err(e) => log::warn!("Template evolution failed: {}", e),
        }
    }

    /// Run until a stop condition holds, reporting progress after every
    /// iteration.
    pub async fn run_with_callback<F>(&mut self, mut callback: F) -> Result<SearchOutcome, SearchError>
    where
        F: FnMut(&SearchProgress),
    {
        if self.archive.is_empty() {
            return Err(SearchError::EmptyPopulation);
        }

        let start_time = Instant::now();
        self.state = RunState::Running;
        log::info!(
            "Starting search: {} programs, max {} iterations",
            self.archive.len(),
            self.config.max_iterations
        );

        let state = loop {
            if let Some(state) = self.should_stop() {
                break state;
            }

            self.iteration += 1;
            self.step().await;

            if self.iteration % self.config.meta_interval.max(1) == 0 {
                self.evolve_templates().await;
            }

            callback(&self.progress());
        };

        self.state = state;
        let elapsed = start_time.elapsed().as_secs_f64();
        log::info!(
            "Search finished after {} iterations ({:?}) in {:.1}s",
            self.iteration,
            state,
            elapsed
        );

        Ok(SearchOutcome {
            state,
            best: self
                .archive
                .top(None, self.config.best_count)
                .into_iter()
                .cloned()
                .collect(),
            stats: SearchStats {
                iterations: self.iteration,
                failed_iterations: self.failed_iterations,
                evaluations: self.evaluations,
                elapsed_seconds: elapsed,
                usage: self.usage.snapshot(),
            },
        })
    }

    /// Run until a stop condition holds.
    pub async fn run(&mut self) -> Result<SearchOutcome, SearchError> {
        self.run_with_callback(|_| {}).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::evaluation::{ScorerError, ScoringEntryPoint};
    use crate::evolution::generator::GenerationError;
    use crate::evolution::meta::MetaError;
    use crate::schema::{ArchiveConfig, BudgetResource, EvaluationConfig, PromptConfig, RetentionKind};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Proposes `value = <parent + 1>` as a fenced replacement.
    struct Incrementer {
        usage: UsageMeter,
    }

    #[async_trait]
    impl Generator for Incrementer {
        async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            self.usage.record_call();
            let value: f64 = prompt
                .lines()
                .find_map(|l| l.strip_prefix("value = "))
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0.0);
            Ok(format!("```\nvalue = {}\n```", value + 1.0))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Generator for AlwaysFails {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            Err(GenerationError::Exhausted {
                attempts: 1,
                fallbacks: 0,
                last: "offline".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct CountingMeta {
        rounds: Mutex<usize>,
    }

    #[async_trait]
    impl MetaEvolver for Arc<CountingMeta> {
        async fn evolve(
            &self,
            templates: &BTreeMap<String, String>,
            top_programs: &[ProgramRecord],
        ) -> Result<BTreeMap<String, String>, MetaError> {
            assert!(top_programs.len() <= 2);
            let mut rounds = self.rounds.lock().unwrap();
            *rounds += 1;
            if *rounds == 2 {
                return Err(MetaError::Failed("flaky".to_string()));
            }
            Ok(templates
                .iter()
                .map(|(k, v)| (format!("{k}_r{rounds}"), v.clone()))
                .collect())
        }
    }

    fn value_scorer(path: &Path) -> Result<Scores, ScorerError> {
        let code = fs::read_to_string(path)?;
        let value: f64 = code
            .lines()
            .find_map(|l| l.strip_prefix("value = "))
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| ScorerError::new("no value"))?;
        Ok(Scores::new().with("fitness", value))
    }

    fn controller(config: ControllerConfig, generator: Box<dyn Generator>, usage: UsageMeter) -> SearchController {
        let archive = ProgramArchive::in_memory(&ArchiveConfig {
            capacity: 10,
            retention: RetentionKind::Best,
            random_seed: Some(1),
            ..ArchiveConfig::default()
        })
        .unwrap();
        let pipeline = EvaluationPipeline::new(
            &EvaluationConfig {
                working_dir: std::env::temp_dir(),
                ..EvaluationConfig::default()
            },
            ScoringEntryPoint::in_process(value_scorer),
        )
        .unwrap();
        let prompts = PromptBuilder::from_config(&PromptConfig {
            default_template: Some("{parent_program}".to_string()),
            random_seed: Some(1),
            ..PromptConfig::default()
        });
        SearchController::new(config, archive, pipeline, prompts, generator, usage)
    }

    fn limited(max_iterations: usize) -> ControllerConfig {
        ControllerConfig {
            max_iterations,
            ..ControllerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_run_requires_population() {
        let usage = UsageMeter::new();
        let mut search = controller(limited(5), Box::new(AlwaysFails), usage);
        assert!(matches!(search.run().await, Err(SearchError::EmptyPopulation)));
        assert_eq!(search.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_stops_at_iteration_limit() {
        let usage = UsageMeter::new();
        let generator = Box::new(Incrementer { usage: usage.clone() });
        let mut search = controller(limited(4), generator, usage);
        let ids = search
            .seed(vec![SeedProgram::new("value = 0", "zero")])
            .await
            .unwrap();
        assert_eq!(
            search.archive().get(&ids[0]).unwrap().metadata[DESCRIPTION_KEY],
            "zero"
        );

        let mut reports = 0;
        let outcome = search.run_with_callback(|_| reports += 1).await.unwrap();

        assert_eq!(outcome.state, RunState::StoppedByLimit);
        assert_eq!(reports, 4);
        assert_eq!(outcome.stats.iterations, 4);
        assert_eq!(outcome.stats.evaluations, 5);
        assert_eq!(outcome.stats.usage.calls, 4);
        assert_eq!(search.archive().len(), 5);
        assert!(outcome.best[0].score("fitness") >= 1.0);
        assert!(outcome.best[0].parent_id.is_some());
    }

    #[tokio::test]
    async fn test_stops_on_budget() {
        let usage = UsageMeter::new();
        let generator = Box::new(Incrementer { usage: usage.clone() });
        let mut config = limited(100);
        config.budget.insert(BudgetResource::GeneratorCalls, 3.0);
        let mut search = controller(config, generator, usage);
        search.seed(vec![SeedProgram::new("value = 0", "zero")]).await.unwrap();

        let outcome = search.run().await.unwrap();
        assert_eq!(outcome.state, RunState::StoppedByBudget);
        assert_eq!(outcome.stats.iterations, 3);
    }

    #[tokio::test]
    async fn test_stops_on_target() {
        let usage = UsageMeter::new();
        let generator = Box::new(Incrementer { usage: usage.clone() });
        let mut config = limited(100);
        config.target_scores.insert("fitness".to_string(), 10.0);
        let mut search = controller(config, generator, usage);
        search.seed(vec![SeedProgram::new("value = 8", "eight")]).await.unwrap();

        let outcome = search.run().await.unwrap();
        assert_eq!(outcome.state, RunState::StoppedByTarget);
        assert!(outcome.best[0].score("fitness") >= 10.0);
        assert!(outcome.stats.iterations >= 2);
    }

    #[tokio::test]
    async fn test_missing_target_metric_is_not_met() {
        let usage = UsageMeter::new();
        let generator = Box::new(Incrementer { usage: usage.clone() });
        let mut config = limited(3);
        config.target_scores.insert("fitness".to_string(), 0.0);
        config.target_scores.insert("speed".to_string(), 0.0);
        let mut search = controller(config, generator, usage);
        search.seed(vec![SeedProgram::new("value = 1", "one")]).await.unwrap();

        let outcome = search.run().await.unwrap();
        assert_eq!(outcome.state, RunState::StoppedByLimit);
    }

    #[tokio::test]
    async fn test_manual_stop() {
        let usage = UsageMeter::new();
        let generator = Box::new(Incrementer { usage: usage.clone() });
        let mut search = controller(limited(100), generator, usage);
        search.seed(vec![SeedProgram::new("value = 0", "zero")]).await.unwrap();

        let handle = search.stop_handle();
        let outcome = search
            .run_with_callback(|progress| {
                if progress.iteration == 2 {
                    handle.store(true, Ordering::Relaxed);
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.state, RunState::StoppedManually);
        assert_eq!(outcome.stats.iterations, 2);
        assert_eq!(search.state(), RunState::StoppedManually);
    }

    #[tokio::test]
    async fn test_generation_failures_are_contained() {
        let usage = UsageMeter::new();
        let mut search = controller(limited(3), Box::new(AlwaysFails), usage);
        search.seed(vec![SeedProgram::new("value = 0", "zero")]).await.unwrap();

        let outcome = search.run().await.unwrap();
        assert_eq!(outcome.state, RunState::StoppedByLimit);
        assert_eq!(outcome.stats.failed_iterations, 3);
        assert_eq!(search.archive().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_evaluations_are_stored() {
        struct Garbage;

        #[async_trait]
        impl Generator for Garbage {
            async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
                Ok("```\nnot a program\n```".to_string())
            }
        }

        let usage = UsageMeter::new();
        let mut search = controller(limited(2), Box::new(Garbage), usage);
        search.seed(vec![SeedProgram::new("value = 0", "zero")]).await.unwrap();

        let outcome = search.run().await.unwrap();
        assert_eq!(outcome.stats.failed_iterations, 0);
        let failures = search
            .archive()
            .all()
            .iter()
            .filter(|r| r.scores.is_failure())
            .count();
        assert_eq!(failures, 2);
        assert_eq!(outcome.best[0].score("fitness"), 0.0);
    }

    #[tokio::test]
    async fn test_meta_evolution_interval() {
        let usage = UsageMeter::new();
        let generator = Box::new(Incrementer { usage: usage.clone() });
        let mut config = limited(6);
        config.meta_interval = 2;
        config.meta_top_k = 2;

        let meta = Arc::new(CountingMeta::default());
        let mut search = controller(config, generator, usage).with_meta_evolver(Box::new(meta.clone()));
        search.seed(vec![SeedProgram::new("value = 0", "zero")]).await.unwrap();

        search.run().await.unwrap();
        assert_eq!(*meta.rounds.lock().unwrap(), 3);
        // Round 1 adds default_r1; round 2 fails; round 3 versions both.
        let names: Vec<&String> = search.prompts().templates().keys().collect();
        assert_eq!(names, vec!["default", "default_r1", "default_r1_r3", "default_r3"]);
    }
}
