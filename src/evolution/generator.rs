//! Candidate generation: the text-in, text-out mutation operator.
//!
//! [`RetryingGenerator`] drives a [`ModelBackend`] through a fixed
//! retry/fallback state machine and records usage in a shared
//! [`UsageMeter`]. [`CommandBackend`] reaches a model through an external
//! command that reads the prompt on stdin.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time;

use crate::schema::{BackendCommand, BudgetResource, ConfigError, GeneratorConfig, UsageStats};

/// Placeholder in backend command arguments replaced by the model name.
pub const MODEL_PLACEHOLDER: &str = "{model}";

/// Errors from a single backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend exited with status {status:?}: {stderr}")]
    Failed { status: Option<i32>, stderr: String },

    #[error("{0}")]
    Other(String),
}

/// Generation errors.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(
        "all generator calls failed after {attempts} attempts and {fallbacks} fallback models: {last}"
    )]
    Exhausted {
        attempts: u32,
        fallbacks: usize,
        last: String,
    },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Text returned by a backend, with token usage when the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens: Option<u64>,
}

impl Completion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens: None,
        }
    }
}

/// A single model call.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(&self, model: &str, prompt: &str) -> Result<Completion, BackendError>;
}

#[async_trait]
impl<B: ModelBackend + ?Sized> ModelBackend for Arc<B> {
    async fn complete(&self, model: &str, prompt: &str) -> Result<Completion, BackendError> {
        (**self).complete(model, prompt).await
    }
}

/// Produces change text for a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Default)]
struct UsageCounters {
    calls: AtomicU64,
    tokens: AtomicU64,
    failed_calls: AtomicU64,
}

/// Shared generator usage counters. Clones observe the same counts.
#[derive(Debug, Clone, Default)]
pub struct UsageMeter {
    counters: Arc<UsageCounters>,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self) {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, tokens: u64) {
        self.counters.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.counters.failed_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageStats {
        let calls = self.counters.calls.load(Ordering::Relaxed);
        let failed_calls = self.counters.failed_calls.load(Ordering::Relaxed);
        UsageStats {
            calls,
            tokens: self.counters.tokens.load(Ordering::Relaxed),
            failed_calls,
            success_rate: calls.saturating_sub(failed_calls) as f64 / calls.max(1) as f64,
        }
    }

    /// Current usage of a budgeted resource.
    pub fn usage(&self, resource: BudgetResource) -> f64 {
        let counter = match resource {
            BudgetResource::GeneratorCalls => &self.counters.calls,
            BudgetResource::Tokens => &self.counters.tokens,
            BudgetResource::FailedCalls => &self.counters.failed_calls,
        };
        counter.load(Ordering::Relaxed) as f64
    }
}

/// Position in the retry/fallback sequence of one `generate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Calling the primary model; `attempt` is 1-based.
    Attempting { attempt: u32 },
    /// Primary exhausted; calling `fallbacks[index]` once.
    TryingFallback { index: usize },
    AllFailed,
}

/// Generator that retries the primary model with a fixed delay, then tries
/// each fallback model once.
pub struct RetryingGenerator<B> {
    backend: B,
    model: String,
    fallbacks: Vec<String>,
    retry_attempts: u32,
    retry_delay: Duration,
    usage: UsageMeter,
}

impl<B: ModelBackend> RetryingGenerator<B> {
    pub fn new(backend: B, config: &GeneratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            backend,
            model: config.model.clone(),
            fallbacks: config.fallback_models.clone(),
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay()?,
            usage: UsageMeter::new(),
        })
    }

    /// Record usage into an existing meter.
    pub fn with_usage_meter(mut self, usage: UsageMeter) -> Self {
        self.usage = usage;
        self
    }

    pub fn usage(&self) -> &UsageMeter {
        &self.usage
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, model: &str, prompt: &str) -> Result<String, BackendError> {
        let completion = self.backend.complete(model, prompt).await?;
        if let Some(tokens) = completion.tokens {
            self.usage.record_tokens(tokens);
        }
        Ok(completion.text)
    }

    /// Generate for several prompts with at most `max_concurrent` in flight.
    /// Results keep prompt order.
    pub async fn batch_generate(
        &self,
        prompts: &[String],
        max_concurrent: usize,
    ) -> Vec<Result<String, GenerationError>> {
        let limit = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let tasks = prompts.iter().map(|prompt| {
            let limit = limit.clone();
            async move {
                let _permit = limit.acquire().await.ok();
                self.generate(prompt).await
            }
        });
        join_all(tasks).await
    }
}

#[async_trait]
impl<B: ModelBackend> Generator for RetryingGenerator<B> {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.usage.record_call();

        let mut state = CallState::Attempting { attempt: 1 };
        let mut last_error = String::new();

        loop {
            state = match state {
                CallState::Attempting { attempt } => match self.call(&self.model, prompt).await {
                    Ok(text) => return Ok(text),
                    Err(e) => {
                        log::warn!(
                            "Generator call failed (attempt {}/{}): {}",
                            attempt,
                            self.retry_attempts,
                            e
                        );
                        last_error = e.to_string();
                        if attempt < self.retry_attempts {
                            time::sleep(self.retry_delay).await;
                            CallState::Attempting {
                                attempt: attempt + 1,
                            }
                        } else {
                            self.usage.record_failure();
                            CallState::TryingFallback { index: 0 }
                        }
                    }
                },
                CallState::TryingFallback { index } => match self.fallbacks.get(index) {
                    None => CallState::AllFailed,
                    Some(model) => {
                        log::info!("Trying fallback model: {}", model);
                        match self.call(model, prompt).await {
                            Ok(text) => return Ok(text),
                            Err(e) => {
                                log::warn!("Fallback model {} failed: {}", model, e);
                                last_error = e.to_string();
                                CallState::TryingFallback { index: index + 1 }
                            }
                        }
                    }
                },
                CallState::AllFailed => {
                    return Err(GenerationError::Exhausted {
                        attempts: self.retry_attempts,
                        fallbacks: self.fallbacks.len(),
                        last: last_error,
                    });
                }
            };
        }
    }
}

/// Backend that runs an external command per call.
///
/// The prompt is written to the command's stdin and the completion is read
/// from stdout. `{model}` in the arguments is replaced by the model name.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    command: BackendCommand,
    timeout: Duration,
}

impl CommandBackend {
    pub fn new(command: BackendCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn from_config(config: &GeneratorConfig) -> Result<Self, ConfigError> {
        let command = config
            .command
            .clone()
            .ok_or(ConfigError::MissingCommand("generator.command"))?;
        Ok(Self::new(command, config.timeout()?))
    }
}

#[async_trait]
impl ModelBackend for CommandBackend {
    async fn complete(&self, model: &str, prompt: &str) -> Result<Completion, BackendError> {
        let mut child = Command::new(&self.command.program)
            .args(self.command.args.iter().map(|a| a.replace(MODEL_PLACEHOLDER, model)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Other("backend stdin unavailable".to_string()))?;
        let input = prompt.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let output = time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))??;

        // A backend may exit without reading all of its input.
        if let Ok(Err(e)) = writer.await {
            log::debug!("Backend closed stdin early: {}", e);
        }

        if !output.status.success() {
            return Err(BackendError::Failed {
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(Completion::new(String::from_utf8_lossy(&output.stdout)))
    }
}
