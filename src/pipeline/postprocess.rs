//! Post-processing: deterministic cleanup of extracted text.
//!
//! Two layers:
//!
//! * [`normalise_text`] runs on every successful extraction before it is
//!   written. It only fixes formatting quirks of model output and never
//!   changes words.
//! * [`CleanupRules`] are user-supplied regex replacements applied to the
//!   whole text corpus afterwards (recurring OCR misreads such as `Aiso` for
//!   `Also`). Rules run in file order; each one sees the output of the
//!   previous one.
//!
//! ## Rule order in `normalise_text`
//!
//! Fences are stripped before line endings are normalised because the fence
//! regex expects `\n`; trailing whitespace is trimmed before blank lines are
//! collapsed so whitespace-only lines count as blank.

use crate::error::PipelineError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

/// Normalise raw model output into the stored text form.
///
/// Rules (applied in order):
/// 1. Strip an outer code fence (```` ``` ```` or ```` ```text ````)
/// 2. Normalise line endings (CRLF / CR → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 4+ consecutive newlines down to 3
/// 5. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
/// 6. Ensure the text ends with exactly one newline
pub fn normalise_text(input: &str) -> String {
    let s = strip_outer_fence(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Strip outer fence ────────────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```(?:text|plaintext|markdown)?\r?\n(.*)\r?\n```\s*$").unwrap()
});

fn strip_outer_fence(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCE.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 5: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 6: Ensure text ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Corpus cleanup rules ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RuleSpec {
    pattern: String,
    #[serde(default)]
    replacement: String,
}

/// One compiled replacement rule.
#[derive(Debug, Clone)]
pub struct CleanupRule {
    pub pattern: String,
    pub replacement: String,
    regex: Regex,
}

impl CleanupRule {
    /// Compile `pattern`; `replacement` may use `$1`-style group references.
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, PipelineError> {
        let regex = Regex::new(pattern).map_err(|e| PipelineError::CleanupRule {
            pattern: pattern.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            regex,
        })
    }
}

/// An ordered list of [`CleanupRule`]s.
#[derive(Debug, Clone, Default)]
pub struct CleanupRules {
    rules: Vec<CleanupRule>,
}

impl CleanupRules {
    pub fn new(rules: Vec<CleanupRule>) -> Self {
        Self { rules }
    }

    /// Parse a JSON array of `{"pattern": ..., "replacement": ...}` objects.
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let specs: Vec<RuleSpec> =
            serde_json::from_str(json).map_err(|e| PipelineError::CleanupRule {
                pattern: "<rules file>".into(),
                detail: e.to_string(),
            })?;
        let rules = specs
            .iter()
            .map(|s| CleanupRule::new(&s.pattern, &s.replacement))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Read and parse a rules file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path).map_err(|e| PipelineError::CleanupRule {
            pattern: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CleanupRule> {
        self.rules.iter()
    }

    /// Apply every rule in order, returning the new text and the number of
    /// matches of each rule (same order as the rules).
    pub fn apply(&self, input: &str) -> (String, Vec<usize>) {
        let mut text = input.to_string();
        let mut counts = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let n = rule.regex.find_iter(&text).count();
            if n > 0 {
                text = rule
                    .regex
                    .replace_all(&text, rule.replacement.as_str())
                    .into_owned();
            }
            counts.push(n);
        }
        (text, counts)
    }
}
