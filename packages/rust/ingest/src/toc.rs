//! Table-of-contents location in extracted reference text.

use std::sync::LazyLock;

use regex::Regex;

/// Heading labels recognised as a table of contents, compared lowercase.
pub const TOC_HEADINGS: &[&str] = &[
    "table of contents",
    "contents",
    "content",
    "index",
    "índice",
    "indice",
    "índice general",
    "indice generale",
    "sommaire",
    "table des matières",
    "inhaltsverzeichnis",
    "inhalt",
    "contenido",
    "contenidos",
    "sumário",
    "sumario",
    "inhoud",
    "inhoudsopgave",
    "spis treści",
    "содержание",
    "目次",
    "目录",
];

/// Find a heading naming a table of contents and return it with the lines that
/// follow, `excerpt_lines` lines in total.
pub fn locate_toc(text: &str, excerpt_lines: usize) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.iter().position(|line| is_toc_heading(line))?;
    let end = (start + excerpt_lines.max(1)).min(lines.len());
    Some(lines[start..end].join("\n"))
}

/// Whether a single line reads as a table-of-contents heading.
fn is_toc_heading(line: &str) -> bool {
    static DECORATION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^[\s#*_=>\-]*(?:\d+[.)]\s*)?(.*?)[\s*_:=.\-]*$").expect("valid regex")
    });

    let Some(label) = DECORATION_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
    else {
        return false;
    };

    TOC_HEADINGS.contains(&label.as_str())
}
