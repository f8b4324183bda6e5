//! Applying generator output to parent code.
//!
//! Change text comes in three shapes, tried in order: SEARCH/REPLACE diff
//! blocks, a fenced code block targeting one EVOLVE-BLOCK of the parent, and
//! a fenced code block replacing the whole program.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

pub const SEARCH_MARKER: &str = "<<<<<<< SEARCH";
pub const REPLACE_MARKER: &str = ">>>>>>> REPLACE";
pub const BLOCK_START_MARKER: &str = "# EVOLVE-BLOCK-START";
pub const BLOCK_END_MARKER: &str = "# EVOLVE-BLOCK-END";

/// Extensions scanned by [`find_evolve_blocks`] when none are given.
pub const DEFAULT_EXTENSIONS: &[&str] = &["py", "js", "java", "cpp", "c"];

static DIFF_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<<<<<<< SEARCH\n(.*?)\n=======\n(.*?)\n>>>>>>> REPLACE")
        .expect("diff pattern is valid")
});

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:[A-Za-z0-9_+#.-]+)?[ \t]*\n(.*?)\n```")
        .expect("fence pattern is valid")
});

/// Turns a parent program and change text into a child program.
///
/// Implementations never fail: unusable change text yields the original.
pub trait Patcher: Send + Sync {
    fn apply(&self, original: &str, changes: &str) -> String;
}

/// A marked region of a program open to evolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvolveBlock {
    pub name: String,
    /// Line index of the start marker.
    pub start_line: usize,
    /// Line index of the end marker.
    pub end_line: usize,
    /// Lines between the markers.
    pub content: String,
}

/// Finds and rewrites `# EVOLVE-BLOCK-START [name]` / `# EVOLVE-BLOCK-END`
/// regions.
#[derive(Debug, Clone)]
pub struct EvolveBlockParser {
    start_marker: String,
    end_marker: String,
}

impl Default for EvolveBlockParser {
    fn default() -> Self {
        Self::new(BLOCK_START_MARKER, BLOCK_END_MARKER)
    }
}

impl EvolveBlockParser {
    pub fn new(start_marker: impl Into<String>, end_marker: impl Into<String>) -> Self {
        Self {
            start_marker: start_marker.into(),
            end_marker: end_marker.into(),
        }
    }

    /// Blocks in source order. Unnamed blocks are called `block_<n>`, where
    /// `n` counts the blocks before them. An unterminated block ends the scan.
    pub fn extract_blocks(&self, code: &str) -> Vec<EvolveBlock> {
        let lines: Vec<&str> = code.lines().collect();
        let mut blocks = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let Some(pos) = lines[i].find(&self.start_marker) else {
                i += 1;
                continue;
            };

            let label = lines[i][pos + self.start_marker.len()..].trim();
            let name = if label.is_empty() {
                format!("block_{}", blocks.len())
            } else {
                label.to_string()
            };

            let Some(end) = (i + 1..lines.len()).find(|&j| lines[j].contains(&self.end_marker))
            else {
                log::warn!("End marker not found for block starting at line {}", i + 1);
                break;
            };

            blocks.push(EvolveBlock {
                name,
                start_line: i,
                end_line: end,
                content: lines[i + 1..end].join("\n"),
            });
            i = end + 1;
        }

        blocks
    }

    /// Replace the body of the named block, keeping both marker lines.
    /// Unknown names return the code unchanged.
    pub fn replace_block(&self, code: &str, name: &str, new_content: &str) -> String {
        let Some(block) = self.extract_blocks(code).into_iter().find(|b| b.name == name) else {
            log::warn!("Block '{}' not found in code", name);
            return code.to_string();
        };

        let lines: Vec<&str> = code.lines().collect();
        let mut out: Vec<&str> = Vec::with_capacity(lines.len());
        out.extend_from_slice(&lines[..=block.start_line]);
        out.extend(new_content.lines());
        out.extend_from_slice(&lines[block.end_line..]);

        let mut result = out.join("\n");
        if code.ends_with('\n') {
            result.push('\n');
        }
        result
    }

    pub fn has_blocks(&self, code: &str) -> bool {
        code.contains(&self.start_marker)
    }
}

/// Default patcher for diff blocks, evolve blocks and fenced replacements.
#[derive(Debug, Clone, Default)]
pub struct CodePatcher {
    blocks: EvolveBlockParser,
}

impl CodePatcher {
    pub fn new(blocks: EvolveBlockParser) -> Self {
        Self { blocks }
    }

    fn apply_diff(&self, original: &str, diff: &str) -> String {
        let mut result = original.to_string();
        for caps in DIFF_BLOCK.captures_iter(diff) {
            let (search, replace) = (&caps[1], &caps[2]);
            if !result.contains(search) {
                log::debug!("Search text not found in program: {:?}", search);
            }
            result = result.replace(search, replace);
        }
        result
    }
}

fn fenced_code(changes: &str) -> Option<&str> {
    FENCED_BLOCK
        .captures(changes)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

impl Patcher for CodePatcher {
    fn apply(&self, original: &str, changes: &str) -> String {
        if changes.contains(SEARCH_MARKER) && changes.contains(REPLACE_MARKER) {
            return self.apply_diff(original, changes);
        }

        if self.blocks.has_blocks(original) {
            if let Some(code) = fenced_code(changes) {
                let quoted = self
                    .blocks
                    .extract_blocks(original)
                    .into_iter()
                    .find(|b| !b.content.trim().is_empty() && changes.contains(&b.content));
                if let Some(block) = quoted {
                    return self.blocks.replace_block(original, &block.name, code);
                }
                return code.to_string();
            }
        } else if let Some(code) = fenced_code(changes) {
            return code.trim().to_string();
        }

        log::warn!("Could not parse change format, keeping original code");
        original.to_string()
    }
}

/// Files under `dir` (recursively) that contain evolve blocks, mapped to the
/// block names. Unreadable files are logged and skipped.
pub fn find_evolve_blocks<P: AsRef<Path>>(
    dir: P,
    extensions: &[&str],
) -> io::Result<BTreeMap<PathBuf, Vec<String>>> {
    let parser = EvolveBlockParser::default();
    let mut found = BTreeMap::new();
    let mut pending = vec![dir.as_ref().to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }

            let matches = path.extension().and_then(|e| e.to_str()).is_some_and(|ext| {
                extensions
                    .iter()
                    .any(|wanted| wanted.trim_start_matches('.') == ext)
            });
            if !matches {
                continue;
            }

            match fs::read_to_string(&path) {
                Ok(content) => {
                    let names: Vec<String> = parser
                        .extract_blocks(&content)
                        .into_iter()
                        .map(|b| b.name)
                        .collect();
                    if !names.is_empty() {
                        found.insert(path, names);
                    }
                }
                Err(e) => log::error!("Error reading {}: {}", path.display(), e),
            }
        }
    }

    Ok(found)
}
