//! Reference material ingestion.
//!
//! Turns user-supplied documents into a single [`ReferenceMaterial`]: the
//! concatenated text, a preview slice, and a located table-of-contents
//! excerpt. Ingestion is best effort; unreadable files are reported in
//! [`IngestOutcome::errors`] and the remaining files still contribute.

mod toc;

use std::path::{Path, PathBuf};

use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use coursesmith_shared::{CourseError, IngestConfig, ReferenceMaterial, Result};

pub use toc::{TOC_HEADINGS, locate_toc};

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

/// Limits applied while ingesting.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Cap on concatenated reference text.
    pub max_chars: usize,
    /// Lines captured for a located table of contents.
    pub toc_excerpt_lines: usize,
    /// Leading lines kept as the preview.
    pub preview_lines: usize,
    /// Character cap on the preview.
    pub preview_max_chars: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for IngestOptions {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_chars: config.max_chars,
            toc_excerpt_lines: config.toc_excerpt_lines,
            preview_lines: config.preview_lines,
            preview_max_chars: config.preview_max_chars,
        }
    }
}

/// Result of ingesting a set of files.
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    /// Usable material, or `None` when no file yielded text.
    pub material: Option<ReferenceMaterial>,
    /// One message per file that could not be used.
    pub errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Ingest `files` into reference material.
#[instrument(skip_all, fields(files = files.len()))]
pub async fn ingest(files: &[PathBuf], opts: &IngestOptions) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();
    let mut sources = Vec::new();
    let mut parts = Vec::new();

    for path in files {
        let name = display_name(path);
        match extract_file(path).await {
            Ok(text) if !text.trim().is_empty() => {
                debug!(file = %name, chars = text.len(), "extracted reference text");
                parts.push(format!("# Source: {name}\n\n{}", text.trim()));
                sources.push(name);
            }
            Ok(_) => {
                warn!(file = %name, "reference file contained no text");
                outcome.errors.push(format!("{name}: no text found"));
            }
            Err(e) => {
                warn!(file = %name, error = %e, "reference file could not be read");
                outcome.errors.push(format!("{name}: {e}"));
            }
        }
    }

    if parts.is_empty() {
        info!("no usable reference material");
        return outcome;
    }

    let raw_content = truncate_chars(&parts.join("\n\n"), opts.max_chars);
    let toc_excerpt = locate_toc(&raw_content, opts.toc_excerpt_lines);
    let content_preview =
        content_preview(&raw_content, opts.preview_lines, opts.preview_max_chars);

    info!(
        sources = sources.len(),
        chars = raw_content.len(),
        toc_found = toc_excerpt.is_some(),
        "reference material ingested"
    );

    outcome.material = Some(ReferenceMaterial {
        sources,
        content_hash: content_hash(&raw_content),
        raw_content,
        toc_excerpt,
        content_preview,
    });
    outcome
}

// ---------------------------------------------------------------------------
// Per-file extraction
// ---------------------------------------------------------------------------

/// Read one file and return its text, converting HTML to Markdown.
pub async fn extract_file(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "md" | "markdown" | "" => {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| CourseError::io(path, e))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        "html" | "htm" => {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| CourseError::io(path, e))?;
            html_to_markdown(&String::from_utf8_lossy(&bytes))
        }
        other => Err(CourseError::Ingestion(format!(
            "unsupported file type '.{other}'"
        ))),
    }
}

/// Convert an HTML document's main content to Markdown.
pub fn html_to_markdown(html: &str) -> Result<String> {
    let content_html = extract_content_html(html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec![
            "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg",
        ])
        .build();

    converter
        .convert(&content_html)
        .map_err(|e| CourseError::Ingestion(format!("HTML conversion failed: {e}")))
}

/// Pick `<main>`, then `<article>`, then `<body>`; fall back to the whole document.
fn extract_content_html(html: &str) -> String {
    let doc = Html::parse_document(html);

    for selector in ["main", "article", "body"] {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            return el.inner_html();
        }
    }

    html.to_string()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The leading `max_lines` lines of `text`, capped at `max_chars` characters.
pub fn content_preview(text: &str, max_lines: usize, max_chars: usize) -> String {
    let head = text.lines().take(max_lines).collect::<Vec<_>>().join("\n");
    truncate_chars(&head, max_chars)
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(ext: &str, content: &str) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("cs_ingest_{}.{ext}", uuid::Uuid::now_v7()));
        std::fs::write(&path, content).expect("write temp file");
        path
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn preview_limits_lines_then_chars() {
        let text = (0..300).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
        let preview = content_preview(&text, 250, 100_000);
        assert_eq!(preview.lines().count(), 250);
        assert_eq!(content_preview(&text, 250, 10).chars().count(), 10);
    }

    #[test]
    fn html_main_content_converted() {
        let html = "<html><body><nav>Menu</nav><main><h1>Hives</h1><p>Bees build combs.</p></main></body></html>";
        let md = html_to_markdown(html).unwrap();
        assert!(md.contains("# Hives"));
        assert!(md.contains("Bees build combs."));
        assert!(!md.contains("Menu"));
    }

    #[tokio::test]
    async fn ingest_concatenates_and_finds_toc() {
        let a = temp_file("md", "# Beekeeping\n\n## Contents\n1. Hives\n2. Honey\n");
        let b = temp_file("txt", "Notes on swarming.");
        let outcome = ingest(&[a.clone(), b.clone()], &IngestOptions::default()).await;

        let material = outcome.material.expect("material");
        assert!(outcome.errors.is_empty());
        assert_eq!(material.sources.len(), 2);
        assert!(material.raw_content.contains("Notes on swarming."));
        assert!(material.toc_excerpt.as_deref().unwrap().contains("2. Honey"));
        assert_eq!(material.content_hash.len(), 64);

        let _ = std::fs::remove_file(a);
        let _ = std::fs::remove_file(b);
    }

    #[tokio::test]
    async fn unusable_files_are_reported_not_fatal() {
        let good = temp_file("txt", "Plain reference text.");
        let pdf = temp_file("pdf", "%PDF-1.4");
        let missing = std::env::temp_dir().join("cs_ingest_does_not_exist.txt");

        let outcome = ingest(
            &[pdf.clone(), missing, good.clone()],
            &IngestOptions::default(),
        )
        .await;

        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors[0].contains("unsupported file type"));
        let material = outcome.material.expect("good file still used");
        assert_eq!(material.sources.len(), 1);
        assert!(material.toc_excerpt.is_none());

        let _ = std::fs::remove_file(good);
        let _ = std::fs::remove_file(pdf);
    }

    #[tokio::test]
    async fn nothing_usable_yields_absent_material() {
        let empty = temp_file("md", "   \n");
        let outcome = ingest(&[empty.clone()], &IngestOptions::default()).await;
        assert!(outcome.material.is_none());
        assert_eq!(outcome.errors.len(), 1);
        let _ = std::fs::remove_file(empty);
    }
}
