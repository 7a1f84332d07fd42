//! Response normalization: coerce unreliable model text into the payload a
//! stage expects.
//!
//! Normalization is a two-step decision procedure. [`classify`] inspects the
//! raw text for the requested [`OutputKind`] and picks a [`Candidate`];
//! [`resolve`] turns the candidate into a [`Normalized`] value or an error.
//! Structured candidates go through the repair passes in `repair` before
//! parsing. Everything here is pure: no I/O and no logging.

mod repair;

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use coursesmith_shared::{CourseError, Result};

/// Opening delimiter the prompts ask the model to wrap Markdown content in.
pub const CONTENT_OPEN: &str = "<content>";

/// Closing delimiter paired with [`CONTENT_OPEN`].
pub const CONTENT_CLOSE: &str = "</content>";

/// Literal reply meaning "the reference material has no table of contents".
pub const NO_STRUCTURE_SENTINEL: &str = "NO_STRUCTURE_FOUND";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Shape a stage expects back from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// A JSON object or array.
    Structured,
    /// Markdown wrapped in the content delimiters.
    Delimited,
    /// Free text that may be the no-structure sentinel (ToC extraction only).
    RawSentinel,
}

/// Where a structured block was found in the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// The whole response already parsed as JSON.
    Whole,
    /// A fenced code block (```json or unlabeled).
    Fenced,
    /// The first balanced-looking object literal.
    Object,
    /// The first balanced-looking array literal.
    Array,
    /// Nothing recognisable; the trimmed response itself.
    Fallback,
}

/// Outcome of [`classify`].
#[derive(Debug, Clone, PartialEq)]
pub enum Candidate<'a> {
    /// A JSON-looking block to repair and parse.
    StructuredBlock { text: &'a str, source: BlockSource },
    /// Markdown content, either from inside the delimiters or recognised by shape.
    DelimitedContent(&'a str),
    /// The no-structure sentinel.
    RawSentinel,
    /// Plain text passed through unchanged.
    RawText(&'a str),
}

/// A normalized model response.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Structured(Value),
    Content(String),
    Text(String),
    /// Explicit absence marker (the model reported no structure).
    Absent,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Normalize `raw` for the given output kind.
pub fn normalize(raw: &str, kind: OutputKind) -> Result<Normalized> {
    let candidate = classify(raw, kind).ok_or_else(|| {
        CourseError::normalization("no content delimiters or Markdown structure found", raw)
    })?;
    resolve(candidate, raw)
}

/// Extract and parse a structured payload.
pub fn normalize_structured(raw: &str) -> Result<Value> {
    match normalize(raw, OutputKind::Structured)? {
        Normalized::Structured(value) => Ok(value),
        _ => Err(CourseError::normalization("expected a structured payload", raw)),
    }
}

/// Extract delimited Markdown content.
pub fn normalize_delimited(raw: &str) -> Result<String> {
    match normalize(raw, OutputKind::Delimited)? {
        Normalized::Content(text) => Ok(text),
        _ => Err(CourseError::normalization("expected delimited content", raw)),
    }
}

/// Pick the candidate payload for `kind`. Returns `None` only for delimited
/// content when neither delimiters nor Markdown structure are present.
pub fn classify(raw: &str, kind: OutputKind) -> Option<Candidate<'_>> {
    match kind {
        OutputKind::Structured => {
            let (text, source) = locate_structured_block(raw);
            Some(Candidate::StructuredBlock { text, source })
        }
        OutputKind::Delimited => locate_delimited(raw),
        OutputKind::RawSentinel => Some(classify_sentinel(raw)),
    }
}

/// Turn a candidate into a normalized value. `raw` is carried into errors.
pub fn resolve(candidate: Candidate<'_>, raw: &str) -> Result<Normalized> {
    match candidate {
        Candidate::StructuredBlock { text, source } => {
            parse_block(text, source, raw).map(Normalized::Structured)
        }
        Candidate::DelimitedContent(text) => Ok(Normalized::Content(text.to_string())),
        Candidate::RawSentinel => Ok(Normalized::Absent),
        Candidate::RawText(text) => Ok(Normalized::Text(text.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Structured mode
// ---------------------------------------------------------------------------

/// Locate the structured block, in order of preference: whole response,
/// fenced block, first object literal, first array literal.
pub fn locate_structured_block(raw: &str) -> (&str, BlockSource) {
    let trimmed = raw.trim();
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<Value>(trimmed).is_ok()
    {
        return (trimmed, BlockSource::Whole);
    }

    if let Some(body) = fenced_json_body(raw) {
        return (body, BlockSource::Fenced);
    }

    if let Some(block) = balanced_span(raw, '{', '}') {
        return (block, BlockSource::Object);
    }

    if let Some(block) = balanced_span(raw, '[', ']') {
        return (block, BlockSource::Array);
    }

    (trimmed, BlockSource::Fallback)
}

/// Body of the first `json`-labeled fenced block, else of the first unlabeled
/// one. Fences pair up from line starts; blocks in other languages are skipped.
fn fenced_json_body(raw: &str) -> Option<&str> {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?ms)^[ \t]*```[ \t]*([\w+-]*)[ \t]*\r?\n(.*?)^[ \t]*```")
            .expect("valid regex")
    });

    let mut unlabeled = None;
    for caps in FENCE_RE.captures_iter(raw) {
        let label = caps.get(1).map_or("", |m| m.as_str());
        let Some(body) = caps.get(2).map(|m| m.as_str().trim()) else {
            continue;
        };
        if body.is_empty() {
            continue;
        }
        if label.eq_ignore_ascii_case("json") {
            return Some(body);
        }
        if label.is_empty() && unlabeled.is_none() {
            unlabeled = Some(body);
        }
    }
    unlabeled
}

/// Find the first `open` and its matching `close`, skipping string literals.
/// When the brackets never balance, fall back to the span ending at the last `close`.
fn balanced_span(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)?;
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;

    for (offset, c) in s[start..].char_indices() {
        if in_str {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }

        if c == '"' {
            in_str = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(&s[start..start + offset + close.len_utf8()]);
            }
        }
    }

    let end = s.rfind(close)?;
    (end > start).then(|| &s[start..end + close.len_utf8()])
}

/// Parse a block: repaired text first, then the untouched block.
fn parse_block(block: &str, source: BlockSource, raw: &str) -> Result<Value> {
    if source == BlockSource::Whole {
        if let Ok(value) = serde_json::from_str(block) {
            return Ok(value);
        }
    }

    let repaired = repair::run_pipeline(block);
    if let Ok(value) = serde_json::from_str(&repaired) {
        return Ok(value);
    }

    serde_json::from_str(block).map_err(|e| CourseError::Normalization {
        message: format!("no valid JSON found: {e}"),
        raw: raw.to_string(),
        excerpt: render_excerpt(block, e.line(), e.column()),
    })
}

/// Render the lines around a parse failure with a caret under the column.
///
/// `line` and `column` are 1-based, as reported by `serde_json`; a zero line
/// means no location is available.
pub fn render_excerpt(text: &str, line: usize, column: usize) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    if line == 0 || line > lines.len() {
        return None;
    }

    let target = line - 1;
    let from = target.saturating_sub(1);
    let to = (target + 1).min(lines.len() - 1);

    let mut out = String::new();
    for (i, text_line) in lines.iter().enumerate().take(to + 1).skip(from) {
        let prefix = if i == target { ">>> " } else { "    " };
        out.push_str(prefix);
        out.push_str(text_line);
        out.push('\n');
        if i == target {
            out.push_str("    ");
            out.push_str(&" ".repeat(column.saturating_sub(1)));
            out.push_str("^\n");
        }
    }

    Some(out)
}

// ---------------------------------------------------------------------------
// Delimited mode
// ---------------------------------------------------------------------------

fn locate_delimited(raw: &str) -> Option<Candidate<'_>> {
    static DELIMITED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?is)<content>(.*?)</content>").expect("valid regex")
    });

    if let Some(inner) = DELIMITED_RE.captures(raw).and_then(|caps| caps.get(1)) {
        return Some(Candidate::DelimitedContent(inner.as_str().trim()));
    }

    let trimmed = raw.trim();
    looks_like_markdown(trimmed).then_some(Candidate::DelimitedContent(trimmed))
}

/// Whether the text starts with, or contains lines starting with, a heading
/// or list marker.
pub fn looks_like_markdown(text: &str) -> bool {
    static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^[ \t]*(?:#{1,6}[ \t]+\S|[-*+][ \t]+\S|\d+[.)][ \t]+\S)")
            .expect("valid regex")
    });

    MARKER_RE.is_match(text)
}

// ---------------------------------------------------------------------------
// Raw passthrough mode
// ---------------------------------------------------------------------------

fn classify_sentinel(raw: &str) -> Candidate<'_> {
    let trimmed = raw.trim();
    if starts_with_sentinel(trimmed) {
        return Candidate::RawSentinel;
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        let (text, source) = locate_structured_block(trimmed);
        return Candidate::StructuredBlock { text, source };
    }

    Candidate::RawText(trimmed)
}

/// Whether the reply opens with the sentinel as a whole token, optionally
/// quoted and followed by an explanation.
fn starts_with_sentinel(text: &str) -> bool {
    let first_line = text.lines().next().unwrap_or_default();
    let bare = first_line.trim_start_matches(|c: char| c == '`' || c == '"' || c == '\'' || c == '*');
    let Some(head) = bare.get(..NO_STRUCTURE_SENTINEL.len()) else {
        return false;
    };
    head.eq_ignore_ascii_case(NO_STRUCTURE_SENTINEL)
        && bare[NO_STRUCTURE_SENTINEL.len()..]
            .chars()
            .next()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '_'))
}
