//! Pre-commit structural checks for edited source files.
//!
//! These are fast regex heuristics, not parsers: they catch truncated or
//! obviously malformed content before it reaches a live build, and accept
//! some content a real compiler would reject.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trimmed length below which compiled source is assumed truncated.
pub const MIN_SOURCE_LEN: usize = 50;

/// Line-count delta, as a fraction of the old line count, below which an
/// edit counts as surgical.
const SURGICAL_DELTA_RATIO: f64 = 0.8;

static XMLNS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"xmlns(?::[a-zA-Z0-9]+)?="[^"]+""#).expect("valid regex"));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static NAMESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)namespace\s+[\w.]+").expect("valid regex"));
static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)class\s+\w+").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("Missing XML namespaces (xmlns)")]
    MissingNamespaces,
    #[error("XAML tags appear to be unbalanced or malformed")]
    UnbalancedTags,
    #[error("File content too short or truncated")]
    Truncated,
    #[error("Missing namespace or using directives")]
    MissingNamespaceOrUsing,
    #[error("Missing class definition")]
    MissingClassDefinition,
}

/// Validator selected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// XAML / AXAML.
    Markup,
    /// C#.
    CompiledSource,
    Unchecked,
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("xaml" | "axaml") => Self::Markup,
            Some("cs") => Self::CompiledSource,
            _ => Self::Unchecked,
        }
    }
}

/// Run the validator appropriate for `path`.
pub fn validate_for_path(path: &Path, content: &str) -> Result<(), ValidationFailure> {
    match SourceKind::from_path(path) {
        SourceKind::Markup => validate_markup(content),
        SourceKind::CompiledSource => validate_compiled_source(content),
        SourceKind::Unchecked => Ok(()),
    }
}

pub fn validate_markup(content: &str) -> Result<(), ValidationFailure> {
    if !XMLNS_RE.is_match(content) {
        return Err(ValidationFailure::MissingNamespaces);
    }
    if !tags_balanced(content) {
        return Err(ValidationFailure::UnbalancedTags);
    }
    Ok(())
}

pub fn validate_compiled_source(content: &str) -> Result<(), ValidationFailure> {
    if content.trim().len() < MIN_SOURCE_LEN {
        return Err(ValidationFailure::Truncated);
    }
    if !NAMESPACE_RE.is_match(content) && !content.contains("using ") {
        return Err(ValidationFailure::MissingNamespaceOrUsing);
    }
    if !CLASS_RE.is_match(content) {
        return Err(ValidationFailure::MissingClassDefinition);
    }
    Ok(())
}

/// Push/pop balance over every `<...>` tag, skipping comments,
/// declarations, processing instructions and self-closing tags.
fn tags_balanced(content: &str) -> bool {
    let mut stack: Vec<&str> = Vec::new();
    for tag in TAG_RE.find_iter(content).map(|m| m.as_str()) {
        if tag.starts_with("<!") || tag.starts_with("<?") || tag.ends_with("/>") {
            continue;
        }
        if let Some(closing) = tag.strip_prefix("</") {
            let name = closing.trim_end_matches('>').trim();
            if stack.pop() != Some(name) {
                return false;
            }
        } else {
            let name = tag[1..]
                .split(|c: char| c.is_whitespace() || c == '>')
                .next()
                .unwrap_or_default();
            if name.is_empty() {
                return false;
            }
            stack.push(name);
        }
    }
    stack.is_empty()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditMagnitude {
    Surgical,
    Rewrite,
}

/// Informational only; never blocks an edit.
pub fn classify_edit(old_content: &str, new_content: &str) -> EditMagnitude {
    let old_lines = old_content.split('\n').count();
    let new_lines = new_content.split('\n').count();
    let delta = old_lines.abs_diff(new_lines) as f64;
    if delta < old_lines as f64 * SURGICAL_DELTA_RATIO {
        EditMagnitude::Surgical
    } else {
        EditMagnitude::Rewrite
    }
}
