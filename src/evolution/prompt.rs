//! Prompt construction from templates, problem context and sampled programs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::schema::{ProgramRecord, PromptConfig};

/// Name of the template used when no template directory supplies one.
pub const DEFAULT_TEMPLATE_NAME: &str = "default";

/// Marker appended to context that exceeded the configured length.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Built-in template.
pub const DEFAULT_TEMPLATE: &str = "\
You are an expert software engineer improving the program below.

CONTEXT:
{context}

PROGRAM TO IMPROVE:
```
{parent_program}
```

EVALUATION CRITERIA:
{evaluation_criteria}

INSPIRATION FROM OTHER SOLUTIONS:
{inspirations}

YOUR TASK:
Analyze the program, find what limits its scores, and produce an improved
version.

To change part of the program, use one or more blocks of this form:
<<<<<<< SEARCH
... exact code to replace ...
=======
... replacement code ...
>>>>>>> REPLACE

To replace the whole program, reply with the complete code in a fenced block.

YOUR IMPROVED CODE:
";

/// A prompt and the template it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub template: String,
    pub text: String,
}

/// Template store and prompt renderer.
#[derive(Debug)]
pub struct PromptBuilder {
    templates: BTreeMap<String, String>,
    /// Scores achieved by children of each template.
    performance: BTreeMap<String, Vec<f64>>,
    default_template: String,
    context: String,
    templates_dir: Option<PathBuf>,
    rng: StdRng,
}

impl PromptBuilder {
    /// Load templates and context. Unreadable files are logged and skipped.
    pub fn from_config(config: &PromptConfig) -> Self {
        let default_template = config
            .default_template
            .clone()
            .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());

        let mut templates = BTreeMap::new();
        if let Some(dir) = config.templates_dir.as_deref()
            && dir.is_dir()
        {
            templates = load_templates(dir);
        }
        if templates.is_empty() {
            templates.insert(DEFAULT_TEMPLATE_NAME.to_string(), default_template.clone());
        }

        let context = match config.context_dir.as_deref() {
            Some(dir) if dir.is_dir() => load_context(dir, config.max_context_length),
            _ => String::new(),
        };

        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            performance: templates.keys().map(|k| (k.clone(), Vec::new())).collect(),
            templates,
            default_template,
            context,
            templates_dir: config
                .templates_dir
                .as_deref()
                .map(|dir| std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf())),
            rng,
        }
    }

    pub fn templates(&self) -> &BTreeMap<String, String> {
        &self.templates
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Pick a template name uniformly at random.
    pub fn choose_template(&mut self) -> String {
        let index = self.rng.gen_range(0..self.templates.len().max(1));
        self.templates
            .keys()
            .nth(index)
            .cloned()
            .unwrap_or_else(|| DEFAULT_TEMPLATE_NAME.to_string())
    }

    /// Render a prompt for `parent`. Without a template name one is chosen at
    /// random; an unknown name renders the default template.
    pub fn render(
        &mut self,
        parent: &ProgramRecord,
        inspirations: &[ProgramRecord],
        template: Option<&str>,
    ) -> RenderedPrompt {
        let name = match template {
            Some(name) => name.to_string(),
            None => self.choose_template(),
        };
        let body = self.templates.get(&name).unwrap_or(&self.default_template);

        let text = body
            .replace("{parent_program}", &parent.code)
            .replace("{context}", &self.context)
            .replace("{evaluation_criteria}", &evaluation_criteria(parent))
            .replace("{inspirations}", &format_inspirations(inspirations))
            .replace("{timestamp}", &parent.created_at.to_rfc3339())
            .replace("{program_id}", &parent.id);

        RenderedPrompt {
            template: name,
            text,
        }
    }

    /// Record the score achieved by a child of `template`. Unknown templates
    /// and non-finite scores are ignored.
    pub fn record_performance(&mut self, template: &str, score: f64) {
        if !score.is_finite() {
            return;
        }
        if let Some(history) = self.performance.get_mut(template) {
            history.push(score);
        }
    }

    /// Template with the highest mean recorded score.
    pub fn best_performing_template(&self) -> Option<&str> {
        self.performance
            .iter()
            .filter(|(_, scores)| !scores.is_empty())
            .map(|(name, scores)| (name, scores.iter().sum::<f64>() / scores.len() as f64))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name.as_str())
    }

    /// Add or replace templates, saving them to the templates directory when
    /// one is configured.
    pub fn update_templates(&mut self, new_templates: BTreeMap<String, String>) {
        for (name, template) in new_templates {
            if let Some(dir) = &self.templates_dir {
                let path = dir.join(format!("{name}.txt"));
                match fs::create_dir_all(dir).and_then(|_| fs::write(&path, &template)) {
                    Ok(()) => log::info!("Saved template {}", name),
                    Err(e) => log::error!("Failed to save template {}: {}", name, e),
                }
            }
            self.performance.entry(name.clone()).or_default();
            self.templates.insert(name, template);
        }
    }
}

fn load_templates(dir: &Path) -> BTreeMap<String, String> {
    let mut templates = BTreeMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("Failed to read templates directory {}: {}", dir.display(), e);
            return templates;
        }
    };

    for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
        let is_template = path
            .extension()
            .is_some_and(|ext| ext == "txt" || ext == "md");
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !is_template || !path.is_file() {
            continue;
        }
        match fs::read_to_string(&path) {
            Ok(text) => {
                log::info!("Loaded prompt template: {}", name);
                templates.insert(name.to_string(), text);
            }
            Err(e) => log::error!("Failed to load template {}: {}", path.display(), e),
        }
    }

    templates
}

/// Concatenate context files in name order, each under a `--- <name> ---`
/// header, truncated to `max_len` characters.
fn load_context(dir: &Path, max_len: usize) -> String {
    let mut paths: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect(),
        Err(e) => {
            log::error!("Failed to read context directory {}: {}", dir.display(), e);
            return String::new();
        }
    };
    paths.sort();

    let mut parts = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match fs::read_to_string(&path) {
            Ok(content) => parts.push(format!("--- {name} ---\n{content}\n")),
            Err(e) => log::error!("Failed to load context file {}: {}", path.display(), e),
        }
    }

    truncate_context(parts.join("\n"), max_len)
}

fn truncate_context(context: String, max_len: usize) -> String {
    match context.char_indices().nth(max_len) {
        Some((cut, _)) => format!("{}{}", &context[..cut], TRUNCATION_MARKER),
        None => context,
    }
}

fn evaluation_criteria(parent: &ProgramRecord) -> String {
    if parent.scores.is_empty() {
        return "Your code will be evaluated for correctness and efficiency.".to_string();
    }
    let metrics: Vec<&str> = parent.scores.metrics().collect();
    format!(
        "Your code will be evaluated on the following metrics: {}.\n\
         Current scores: {}\n\
         Higher values are better for all metrics.",
        metrics.join(", "),
        parent.scores
    )
}

fn format_inspirations(inspirations: &[ProgramRecord]) -> String {
    inspirations
        .iter()
        .enumerate()
        .map(|(i, record)| {
            format!(
                "INSPIRATION {} (Scores: {}):\n```\n{}\n```\n",
                i + 1,
                record.scores,
                record.code
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
