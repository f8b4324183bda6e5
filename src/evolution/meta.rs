//! Template evolution side loop.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::schema::{MetaConfig, ProgramRecord};

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("template evolution failed: {0}")]
    Failed(String),
}

/// Proposes new prompt templates from the current ones and the best
/// programs found so far.
#[async_trait]
pub trait MetaEvolver: Send + Sync {
    async fn evolve(
        &self,
        templates: &BTreeMap<String, String>,
        top_programs: &[ProgramRecord],
    ) -> Result<BTreeMap<String, String>, MetaError>;
}

/// Re-issues existing templates under timestamped names
/// (`<name>_v<MMDD_HHMM>`) once enough programs are available.
#[derive(Debug, Clone)]
pub struct TemplateVersioner {
    max_prompts_per_round: usize,
    min_programs_required: usize,
}

impl TemplateVersioner {
    pub fn new(config: &MetaConfig) -> Self {
        Self {
            max_prompts_per_round: config.max_prompts_per_round,
            min_programs_required: config.min_programs_required,
        }
    }

    fn version_suffix() -> String {
        Utc::now().format("%m%d_%H%M").to_string()
    }
}

#[async_trait]
impl MetaEvolver for TemplateVersioner {
    async fn evolve(
        &self,
        templates: &BTreeMap<String, String>,
        top_programs: &[ProgramRecord],
    ) -> Result<BTreeMap<String, String>, MetaError> {
        if top_programs.len() < self.min_programs_required {
            log::info!(
                "Not enough programs for template evolution ({} < {})",
                top_programs.len(),
                self.min_programs_required
            );
            return Ok(BTreeMap::new());
        }

        let version = Self::version_suffix();
        Ok(templates
            .iter()
            .take(self.max_prompts_per_round)
            .map(|(name, text)| (format!("{name}_v{version}"), text.clone()))
            .collect())
    }
}
