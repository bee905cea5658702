//! JSON repair utilities
//!
//! LLM output is JSON-shaped but routinely broken in three ways: literal
//! newlines inside string values (the `content` field carrying source code),
//! trailing commas, and truncation mid-object. Each fix here is attempted in
//! order by [`repair_json`], cheapest first, re-checking validity after every
//! stage.

use std::ops::ControlFlow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?[ \t]*\n?([\s\S]*?)```").expect("fence regex"));

static TRAILING_COMMA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("comma regex"));

/// Try strict JSON decoding, None on failure
pub(crate) fn try_parse(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

/// Remove up to three nested layers of markdown code fences
///
/// A fenced block is only unwrapped when the content directly inside it
/// looks like JSON (starts with `{`/`[`, or has a quote within the first 20
/// characters).
pub fn strip_markdown_fences(text: &str) -> String {
    let mut result = text.to_string();
    for _ in 0..3 {
        let Some(caps) = FENCE_RE.captures(&result) else {
            break;
        };
        let inner = caps[1].trim();
        let looks_like_json =
            inner.starts_with('{') || inner.starts_with('[') || inner.chars().take(20).any(|c| c == '"');
        if inner.is_empty() || !looks_like_json {
            break;
        }
        result = inner.to_string();
    }
    result
}

/// Attempt to repair common JSON issues from LLM output
///
/// Stages: fast-path validity check, literal-newline escaping inside
/// strings, trailing-comma removal, truncation closing. Returns the first
/// stage output that decodes; if nothing decodes, returns the
/// newline-escaped text as the best attempt. Idempotent: repairing already
/// repaired text is a no-op.
pub fn repair_json(text: &str) -> String {
    if try_parse(text).is_some() {
        return text.to_string();
    }

    let escaped = escape_literal_newlines(text);
    if try_parse(&escaped).is_some() {
        return escaped;
    }

    let without_commas = TRAILING_COMMA_RE.replace_all(&escaped, "$1").into_owned();
    if try_parse(&without_commas).is_some() {
        return without_commas;
    }

    if let Some(closed) = close_truncated(&without_commas)
        && try_parse(&closed).is_some()
    {
        return closed;
    }

    escaped
}

/// Replace literal newlines/tabs inside JSON string values with escapes
///
/// Walks the text with a two-state machine (outside/inside string). Escape
/// pairs are copied through untouched so already-escaped sequences survive.
pub(crate) fn escape_literal_newlines(text: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut in_string = false;
    let mut chars = text.chars();

    while let Some(ch) = chars.next() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            output.push(ch);
            continue;
        }

        match ch {
            '\\' => {
                output.push(ch);
                if let Some(next) = chars.next() {
                    output.push(next);
                }
            }
            '"' => {
                in_string = false;
                output.push(ch);
            }
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            _ => output.push(ch),
        }
    }

    output
}

/// Close a truncated JSON document by appending missing delimiters
///
/// Counts unbalanced opens with the string-aware scan; appends a closing
/// quote (if truncation happened mid-string), then `]`s, then `}`s. Returns
/// None when the document is already balanced.
pub(crate) fn close_truncated(text: &str) -> Option<String> {
    let mut open_braces: i32 = 0;
    let mut open_brackets: i32 = 0;

    let in_string = scan_structural(text, |_, ch| {
        match ch {
            '{' => open_braces += 1,
            '}' => open_braces -= 1,
            '[' => open_brackets += 1,
            ']' => open_brackets -= 1,
            _ => {}
        }
        ControlFlow::Continue(())
    });

    if open_braces <= 0 && open_brackets <= 0 {
        return None;
    }

    let mut result = text.trim_end().to_string();
    if in_string {
        result.push('"');
    }
    for _ in 0..open_brackets.max(0) {
        result.push(']');
    }
    for _ in 0..open_braces.max(0) {
        result.push('}');
    }
    Some(result)
}

/// Scan a JSON-ish text, invoking `f` only for characters outside string
/// literals
///
/// This is the shared string-aware walk used by truncation repair and both
/// salvage paths. Escape pairs inside strings are skipped. Returns whether
/// the scan ended inside an unterminated string. `f` may break early.
pub(crate) fn scan_structural(text: &str, mut f: impl FnMut(usize, char) -> ControlFlow<()>) -> bool {
    let mut in_string = false;
    let mut chars = text.char_indices();

    while let Some((i, ch)) = chars.next() {
        if in_string {
            if ch == '\\' {
                chars.next();
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
            continue;
        }
        if let ControlFlow::Break(()) = f(i, ch) {
            return in_string;
        }
    }

    in_string
}
