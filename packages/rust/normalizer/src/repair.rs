//! Textual repair passes for structured blocks extracted from model output.
//!
//! Each pass is a function `&str -> String` applied in sequence. Passes only
//! touch the defect they target and respect string-literal boundaries, so a
//! block that is already valid JSON comes out byte-identical.

use std::sync::LazyLock;

use regex::Regex;

/// Run all repair passes, in order, on an extracted block.
pub(crate) fn run_pipeline(block: &str) -> String {
    let mut result = block.to_string();

    result = strip_trailing_commas(&result);
    result = escape_string_literals(&result);
    result = quote_property_names(&result);

    result
}

// ---------------------------------------------------------------------------
// Segmentation
// ---------------------------------------------------------------------------

/// A slice of the block, either inside a string literal (quotes included) or outside.
#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Code(&'a str),
    Str(&'a str),
}

/// Split text into string-literal and non-string segments.
///
/// An unterminated literal runs to the end of the text.
fn segments(s: &str) -> Vec<Segment<'_>> {
    let bytes = s.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_str = false;
    let mut i = 0;

    while i < bytes.len() {
        match (in_str, bytes[i]) {
            (true, b'\\') => {
                i += 2;
                continue;
            }
            (true, b'"') => {
                out.push(Segment::Str(&s[start..=i]));
                start = i + 1;
                in_str = false;
            }
            (false, b'"') => {
                if start < i {
                    out.push(Segment::Code(&s[start..i]));
                }
                start = i;
                in_str = true;
            }
            _ => {}
        }
        i += 1;
    }

    if start < s.len() {
        let rest = &s[start..];
        out.push(if in_str {
            Segment::Str(rest)
        } else {
            Segment::Code(rest)
        });
    }

    out
}

/// Rebuild the text, transforming code and string segments separately.
fn map_segments(
    s: &str,
    code: impl Fn(&str) -> String,
    string: impl Fn(&str) -> String,
) -> String {
    let mut out = String::with_capacity(s.len());
    for segment in segments(s) {
        match segment {
            Segment::Code(text) => out.push_str(&code(text)),
            Segment::Str(text) => out.push_str(&string(text)),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Pass 1: Trailing commas
// ---------------------------------------------------------------------------

/// Remove commas that directly precede a closing brace or bracket.
fn strip_trailing_commas(s: &str) -> String {
    static TRAILING_COMMA_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));

    map_segments(
        s,
        |code| TRAILING_COMMA_RE.replace_all(code, "$1").into_owned(),
        str::to_string,
    )
}

// ---------------------------------------------------------------------------
// Pass 2: Backslashes and raw control characters inside strings
// ---------------------------------------------------------------------------

/// Double backslashes that do not start a valid JSON escape, and escape raw
/// newlines, carriage returns and tabs inside string literals.
fn escape_string_literals(s: &str) -> String {
    map_segments(s, str::to_string, escape_literal)
}

fn escape_literal(literal: &str) -> String {
    let chars: Vec<char> = literal.chars().collect();
    let mut out = String::with_capacity(literal.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => match chars.get(i + 1) {
                Some('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't') => {
                    out.push(c);
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                Some('u') if is_unicode_escape(&chars[i + 2..]) => {
                    out.push_str("\\u");
                    i += 2;
                    continue;
                }
                _ => out.push_str("\\\\"),
            },
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
        i += 1;
    }

    out
}

fn is_unicode_escape(rest: &[char]) -> bool {
    rest.len() >= 4 && rest[..4].iter().all(char::is_ascii_hexdigit)
}

// ---------------------------------------------------------------------------
// Pass 3: Unquoted property names
// ---------------------------------------------------------------------------

/// Quote bare identifiers used as object keys (`{name: 1}` → `{"name": 1}`).
fn quote_property_names(s: &str) -> String {
    static BARE_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)").expect("valid regex")
    });

    map_segments(
        s,
        |code| BARE_KEY_RE.replace_all(code, r#"$1"$2"$3"#).into_owned(),
        str::to_string,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_split_on_string_literals() {
        let segs = segments(r#"{"a": "x\"y", b: 1}"#);
        assert_eq!(
            segs,
            vec![
                Segment::Code("{"),
                Segment::Str(r#""a""#),
                Segment::Code(": "),
                Segment::Str(r#""x\"y""#),
                Segment::Code(", b: 1}"),
            ]
        );
    }

    #[test]
    fn unterminated_string_runs_to_end() {
        let segs = segments(r#"{"a": "open"#);
        assert_eq!(segs.last(), Some(&Segment::Str(r#""open"#)));
    }

    #[test]
    fn trailing_commas_removed() {
        assert_eq!(strip_trailing_commas(r#"{"a": 1, "b": 2,}"#), r#"{"a": 1, "b": 2}"#);
        assert_eq!(strip_trailing_commas("[1, 2,\n  ]"), "[1, 2\n  ]");
    }

    #[test]
    fn trailing_comma_inside_string_untouched() {
        let s = r#"{"note": "a, }"}"#;
        assert_eq!(strip_trailing_commas(s), s);
    }

    #[test]
    fn lone_backslashes_doubled() {
        assert_eq!(
            escape_string_literals(r#"{"path": "C:\Users\x"}"#),
            r#"{"path": "C:\\Users\\x"}"#
        );
    }

    #[test]
    fn valid_escapes_preserved() {
        let s = r#"{"a": "line\nnext \"q\" \u00e9 \\ \/"}"#;
        assert_eq!(escape_string_literals(s), s);
    }

    #[test]
    fn short_unicode_escape_is_doubled() {
        assert_eq!(escape_string_literals(r#""\u12""#), r#""\\u12""#);
    }

    #[test]
    fn raw_newlines_in_strings_escaped() {
        assert_eq!(escape_string_literals("{\"a\": \"one\ntwo\"}"), r#"{"a": "one\ntwo"}"#);
        // Newlines between tokens are left alone.
        assert_eq!(escape_string_literals("{\n\"a\": 1\n}"), "{\n\"a\": 1\n}");
    }

    #[test]
    fn bare_keys_quoted() {
        assert_eq!(
            quote_property_names(r#"{title: "Intro", duration: 30}"#),
            r#"{"title": "Intro", "duration": 30}"#
        );
    }

    #[test]
    fn bare_key_pattern_inside_string_untouched() {
        let s = r#"{"text": "{note: this}"}"#;
        assert_eq!(quote_property_names(s), s);
    }

    #[test]
    fn pipeline_leaves_valid_json_identical() {
        let s = r#"{"sections": [{"title": "A, B", "estimated_time": 90}], "ok": true}"#;
        assert_eq!(run_pipeline(s), s);
    }

    #[test]
    fn pipeline_fixes_combined_defects() {
        let repaired = run_pipeline("{title: \"Intro\\d\", items: [1, 2,],}");
        let value: serde_json::Value = serde_json::from_str(&repaired).expect("parses");
        assert_eq!(value["title"], "Intro\\d");
        assert_eq!(value["items"], serde_json::json!([1, 2]));
    }
}
