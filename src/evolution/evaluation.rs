//! Evaluation pipeline: turns candidate source text into scores.
//!
//! Every evaluation writes the candidate to a private temp file and hands its
//! path to a scoring entry point, either an in-process [`Scorer`] or an
//! external command. Concurrency is bounded by a pipeline-wide semaphore.
//! Failures never propagate as errors; they come back as sentinel scores.

use std::env;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::{task, time};

use crate::schema::{CascadeRule, ConfigError, EvaluationConfig, Scores, ScoringCommand};

/// Metric added to the error sentinel when a scoring command exits non-zero.
pub const RETURN_CODE_METRIC: &str = "returncode";
/// Metric added to the error sentinel when scoring output is not a JSON object.
pub const PARSE_ERROR_METRIC: &str = "parse_error";

/// In-process scorer failure.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ScorerError(pub String);

impl ScorerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<io::Error> for ScorerError {
    fn from(e: io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Scores the program stored at a path.
///
/// Runs on tokio's blocking pool with the process working directory set to
/// the pipeline's working directory.
pub trait Scorer: Send + Sync {
    fn score(&self, path: &Path) -> Result<Scores, ScorerError>;
}

impl<F> Scorer for F
where
    F: Fn(&Path) -> Result<Scores, ScorerError> + Send + Sync,
{
    fn score(&self, path: &Path) -> Result<Scores, ScorerError> {
        self(path)
    }
}

/// Where candidate programs are scored.
#[derive(Clone)]
pub enum ScoringEntryPoint {
    /// Call a scorer inside this process.
    ///
    /// A scorer that exceeds the timeout cannot be preempted: the caller
    /// receives the timeout sentinel while the blocking thread runs to
    /// completion on its own.
    InProcess(Arc<dyn Scorer>),
    /// Run `program args... <candidate-path>` and read scores from stdout.
    Subprocess(ScoringCommand),
}

impl ScoringEntryPoint {
    /// Subprocess entry point named by the configuration.
    pub fn from_config(config: &EvaluationConfig) -> Result<Self, ConfigError> {
        config
            .scoring_command
            .clone()
            .map(Self::Subprocess)
            .ok_or(ConfigError::MissingCommand("evaluation.scoring_command"))
    }

    pub fn in_process<S: Scorer + 'static>(scorer: S) -> Self {
        Self::InProcess(Arc::new(scorer))
    }
}

impl fmt::Debug for ScoringEntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess(_) => f.write_str("InProcess(..)"),
            Self::Subprocess(command) => f.debug_tuple("Subprocess").field(command).finish(),
        }
    }
}

/// Bounded-concurrency scoring of candidate programs.
#[derive(Debug)]
pub struct EvaluationPipeline {
    entry: ScoringEntryPoint,
    working_dir: PathBuf,
    max_workers: usize,
    timeout: Duration,
    cascade: Vec<CascadeRule>,
    extension: String,
    workers: Arc<Semaphore>,
}

impl EvaluationPipeline {
    pub fn new(config: &EvaluationConfig, entry: ScoringEntryPoint) -> Result<Self, ConfigError> {
        config.validate()?;
        let timeout = config.timeout()?;
        let working_dir =
            std::path::absolute(&config.working_dir).unwrap_or_else(|_| config.working_dir.clone());
        let max_workers = config.max_workers;

        log::info!(
            "Evaluation pipeline: {:?}, {} workers, timeout {:.1}s, cwd {}",
            entry,
            max_workers,
            config.timeout_secs,
            working_dir.display()
        );

        Ok(Self {
            entry,
            working_dir,
            max_workers,
            timeout,
            cascade: config.cascade.clone(),
            extension: config.file_extension.trim_start_matches('.').to_string(),
            workers: Arc::new(Semaphore::new(max_workers)),
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Score one program. Never fails: errors become sentinel scores.
    ///
    /// With `cascade` set, a successful result is passed through the
    /// configured cascade rules.
    pub async fn evaluate(&self, code: &str, cascade: bool) -> Scores {
        let Ok(permit) = self.workers.clone().acquire_owned().await else {
            log::warn!("Evaluation requested after pipeline shutdown");
            return Scores::error();
        };

        let file = match write_candidate(code, &self.extension) {
            Ok(file) => file,
            Err(e) => {
                log::error!("Failed to write candidate program: {}", e);
                return Scores::error();
            }
        };

        let scores = match &self.entry {
            ScoringEntryPoint::InProcess(scorer) => {
                self.score_in_process(scorer.clone(), file, permit).await
            }
            ScoringEntryPoint::Subprocess(command) => {
                let scores = self.score_subprocess(command, file.path()).await;
                drop(file);
                drop(permit);
                scores
            }
        };

        if cascade && !scores.is_failure() {
            apply_cascade(&self.cascade, scores)
        } else {
            scores
        }
    }

    /// Score several programs concurrently, preserving input order.
    ///
    /// `max_concurrent` (default: worker count) bounds this batch on top of
    /// the pipeline-wide limit. Cascade rules apply.
    pub async fn batch_evaluate(&self, codes: &[String], max_concurrent: Option<usize>) -> Vec<Scores> {
        let limit = Arc::new(Semaphore::new(
            max_concurrent.unwrap_or(self.max_workers).max(1),
        ));

        let tasks = codes.iter().map(|code| {
            let limit = limit.clone();
            async move {
                let _permit = limit.acquire().await.ok();
                self.evaluate(code, true).await
            }
        });

        join_all(tasks).await
    }

    /// Stop accepting evaluations. Idempotent.
    pub fn shutdown(&self) {
        if !self.workers.is_closed() {
            log::info!("Shutting down evaluation pipeline");
            self.workers.close();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.workers.is_closed()
    }

    async fn score_in_process(
        &self,
        scorer: Arc<dyn Scorer>,
        file: NamedTempFile,
        permit: OwnedSemaphorePermit,
    ) -> Scores {
        let dir = self.working_dir.clone();
        // The temp file and worker permit move into the task, so a timed-out
        // scorer keeps both until it actually returns.
        let handle = task::spawn_blocking(move || {
            let _permit = permit;
            let _lease = WorkingDirLease::acquire(&dir)?;
            scorer.score(file.path())
        });

        match time::timeout(self.timeout, handle).await {
            Err(_) => {
                log::warn!("In-process scorer timed out after {:?}", self.timeout);
                Scores::timeout()
            }
            Ok(Err(e)) => {
                log::error!("In-process scorer panicked: {}", e);
                Scores::error()
            }
            Ok(Ok(Err(e))) => {
                log::warn!("In-process scorer failed: {}", e);
                Scores::error()
            }
            Ok(Ok(Ok(scores))) => finite_or_error(scores),
        }
    }

    async fn score_subprocess(&self, command: &ScoringCommand, path: &Path) -> Scores {
        let child = Command::new(&command.program)
            .args(&command.args)
            .arg(path)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                log::error!("Failed to spawn scoring command '{}': {}", command.program, e);
                return Scores::error();
            }
        };

        // Dropping the timed-out future drops the child, which kills it.
        let output = match time::timeout(self.timeout, child.wait_with_output()).await {
            Err(_) => {
                log::warn!("Scoring command timed out after {:?}", self.timeout);
                return Scores::timeout();
            }
            Ok(Err(e)) => {
                log::error!("Failed to collect scoring output: {}", e);
                return Scores::error();
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let code = output.status.code().map(f64::from).unwrap_or(-1.0);
            log::warn!(
                "Scoring command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Scores::error().with(RETURN_CODE_METRIC, code);
        }

        match parse_scores(&String::from_utf8_lossy(&output.stdout)) {
            Some(scores) => finite_or_error(scores),
            None => {
                log::warn!("Scoring command output is not a JSON object of metrics");
                Scores::error().with(PARSE_ERROR_METRIC, 1.0)
            }
        }
    }
}

fn write_candidate(code: &str, extension: &str) -> io::Result<NamedTempFile> {
    use std::io::Write;

    let suffix = format!(".{extension}");
    let mut file = tempfile::Builder::new()
        .prefix("candidate_")
        .suffix(&suffix)
        .tempfile()?;
    file.write_all(code.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Parse the last non-empty stdout line as a JSON object of metrics.
/// Non-numeric values are skipped.
pub fn parse_scores(stdout: &str) -> Option<Scores> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let object = value.as_object()?;

    Some(
        object
            .iter()
            .filter_map(|(name, v)| v.as_f64().map(|v| (name.clone(), v)))
            .collect(),
    )
}

fn finite_or_error(scores: Scores) -> Scores {
    let finite: Scores = scores
        .iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    if finite.len() < scores.len() {
        log::warn!("Dropped non-finite metrics from {}", scores);
    }
    if finite.is_empty() {
        log::warn!("Scorer returned no usable metrics");
        return Scores::error();
    }
    finite
}

/// Apply cascade rules in order; the first rule whose metric is present and
/// below its threshold reduces the result to that single metric.
pub fn apply_cascade(rules: &[CascadeRule], scores: Scores) -> Scores {
    for rule in rules {
        if let Some(value) = scores.get(&rule.metric)
            && value < rule.threshold
        {
            log::debug!(
                "Cascade stop: {} = {} below {}",
                rule.metric,
                value,
                rule.threshold
            );
            return Scores::new().with(rule.metric.clone(), value);
        }
    }
    scores
}

struct CwdState {
    original: Option<PathBuf>,
    active: Option<PathBuf>,
    holders: usize,
}

static CWD_STATE: Mutex<CwdState> = Mutex::new(CwdState {
    original: None,
    active: None,
    holders: 0,
});
static CWD_RELEASED: Condvar = Condvar::new();

/// Holds the process working directory at a given path.
///
/// Leases on the same directory share one switch; a lease on another
/// directory blocks until every holder has released. The original directory
/// is restored when the last holder drops.
struct WorkingDirLease;

impl WorkingDirLease {
    fn acquire(dir: &Path) -> io::Result<Self> {
        let mut state = CWD_STATE.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match state.active.as_deref().map(|active| active == dir) {
                Some(true) => {
                    state.holders += 1;
                    return Ok(Self);
                }
                Some(false) => {
                    state = CWD_RELEASED
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => {
                    let original = env::current_dir()?;
                    env::set_current_dir(dir)?;
                    state.original = Some(original);
                    state.active = Some(dir.to_path_buf());
                    state.holders = 1;
                    return Ok(Self);
                }
            }
        }
    }
}

impl Drop for WorkingDirLease {
    fn drop(&mut self) {
        let mut state = CWD_STATE.lock().unwrap_or_else(PoisonError::into_inner);
        state.holders = state.holders.saturating_sub(1);
        if state.holders > 0 {
            return;
        }
        if let Some(original) = state.original.take()
            && let Err(e) = env::set_current_dir(&original)
        {
            log::error!("Failed to restore working directory {}: {}", original.display(), e);
        }
        state.active = None;
        CWD_RELEASED.notify_all();
    }
}
