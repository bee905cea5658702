//! Salvage of partially valid LLM responses
//!
//! When the repair cascade cannot make a whole response decode, these walks
//! pull out every complete top-level object inside the `tasks` /
//! `file_operations` arrays and run the repair cascade per object. Targeted
//! regexes recover the scratchpad/status/summary strings. Salvage always
//! produces a result, possibly empty.

use std::ops::ControlFlow;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::domain::{FileOperation, Handoff, HandoffStatus, WorkerResult};

use super::repair::{repair_json, scan_structural, try_parse};
use super::{PlannerResponse, RawTask, raw_task_from_value};

pub(crate) const MALFORMED_CONCERN: &str = "Worker response was malformed — salvaged what was possible";

static SCRATCHPAD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""scratchpad"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("scratchpad regex"));

static TASKS_KEY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""tasks"\s*:\s*\["#).expect("tasks regex"));

static FILE_OPS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""file_operations"\s*:\s*\["#).expect("file_operations regex"));

static PATH_CONTENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{\s*"path"\s*:\s*"([^"]+)"\s*,\s*"content"\s*:\s*""#).expect("path regex"));

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""status"\s*:\s*"([^"]+)""#).expect("status regex"));

static SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""summary"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("summary regex"));

/// Decode the raw inner text of a JSON string literal
fn decode_json_string(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", raw)).unwrap_or_else(|_| raw.to_string())
}

/// Extract every complete top-level `{...}` object from array contents
///
/// `text` starts just past the opening `[`. Nesting depth is tracked with
/// the string-aware scan; the walk stops at the array's own closing `]`.
pub(crate) fn extract_top_level_objects(text: &str) -> Vec<&str> {
    let mut objects = Vec::new();
    let mut depth: i32 = 0;
    let mut start: Option<usize> = None;

    scan_structural(text, |i, ch| {
        match ch {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 && let Some(s) = start.take() {
                    objects.push(&text[s..i + 1]);
                }
            }
            ']' if depth == 0 => return ControlFlow::Break(()),
            _ => {}
        }
        ControlFlow::Continue(())
    });

    objects
}

/// Parse one salvaged object, repairing it if the direct decode fails
fn parse_object(obj_str: &str) -> Option<serde_json::Value> {
    try_parse(obj_str).or_else(|| try_parse(&repair_json(obj_str)))
}

/// Recover a planner response from truncated or malformed output
pub(crate) fn salvage_planner(content: &str) -> PlannerResponse {
    debug!(content_len = content.len(), "salvage_planner: called");
    let scratchpad = SCRATCHPAD_RE
        .captures(content)
        .map(|caps| decode_json_string(&caps[1]))
        .unwrap_or_default();

    let mut tasks: Vec<RawTask> = Vec::new();

    if let Some(m) = TASKS_KEY_RE.find(content) {
        let remainder = &content[m.end()..];
        for obj_str in extract_top_level_objects(remainder) {
            if let Some(value) = parse_object(obj_str)
                && value.is_object()
            {
                let raw = raw_task_from_value(&value);
                if !raw.description.trim().is_empty() {
                    tasks.push(raw);
                }
            }
        }
    }

    debug!(task_count = tasks.len(), "salvage_planner: complete");
    PlannerResponse { scratchpad, tasks }
}

/// Recover a worker result from truncated or malformed output
///
/// Strategy 1 brace-matches objects inside `file_operations`; strategy 2
/// falls back to regex extraction of `path`/`content` pairs. The handoff
/// status defaults to partial when anything was recovered, failed otherwise,
/// and always carries a malformed-response concern.
pub(crate) fn salvage_worker(content: &str, task_id: &str) -> WorkerResult {
    debug!(%task_id, content_len = content.len(), "salvage_worker: called");
    let mut file_operations: Vec<FileOperation> = Vec::new();

    if let Some(m) = FILE_OPS_KEY_RE.find(content) {
        let remainder = &content[m.end()..];
        for obj_str in extract_top_level_objects(remainder) {
            if let Some(value) = parse_object(obj_str)
                && let (Some(path), Some(file_content)) = (
                    value.get("path").and_then(|v| v.as_str()),
                    value.get("content").and_then(|v| v.as_str()),
                )
            {
                file_operations.push(FileOperation {
                    path: path.to_string(),
                    content: file_content.to_string(),
                });
            }
        }
    }

    if file_operations.is_empty() {
        for caps in PATH_CONTENT_RE.captures_iter(content) {
            let path = caps[1].to_string();
            let start = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let end = find_string_end(content, start);
            if end > start {
                let raw_content = &content[start..end];
                let decoded = serde_json::from_str::<String>(&format!("\"{}\"", raw_content))
                    .unwrap_or_else(|_| raw_content.replace("\\n", "\n").replace("\\t", "\t"));
                file_operations.push(FileOperation {
                    path,
                    content: decoded,
                });
            }
        }
    }

    let mut status = if file_operations.is_empty() {
        HandoffStatus::Failed
    } else {
        HandoffStatus::Partial
    };
    let mut summary = format!("Salvaged {} file operations from malformed response", file_operations.len());

    if let Some(caps) = STATUS_RE.captures(content)
        && let Some(parsed) = HandoffStatus::parse(&caps[1])
    {
        status = parsed;
    }
    if let Some(caps) = SUMMARY_RE.captures(content) {
        summary = decode_json_string(&caps[1]);
    }

    info!(
        %task_id,
        recovered = file_operations.len(),
        "Salvaged file operations from malformed worker response"
    );

    let mut handoff = Handoff::new(task_id, status, summary);
    handoff.files_changed = file_operations.iter().map(|op| op.path.clone()).collect();
    handoff.concerns = vec![MALFORMED_CONCERN.to_string()];

    WorkerResult {
        handoff,
        file_operations,
    }
}

/// Find the closing quote of a JSON string value starting at `start`
///
/// `start` sits just after the opening quote. Walks bytes, skipping escape
/// pairs; returns the text length when the string never closes.
fn find_string_end(text: &str, start: usize) -> usize {
    let bytes = text.as_bytes();
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i,
            _ => i += 1,
        }
    }
    text.len()
}
