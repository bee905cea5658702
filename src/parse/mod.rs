//! LLM response parsing
//!
//! Converts raw model text into planner and worker records. The pipeline is
//! a cascade: strip markdown fences, direct decode of the outermost
//! container, repair (literal newlines, trailing commas, truncation), and
//! finally object-by-object salvage. Parsing never fails hard: the worst
//! case is an empty task list or a salvaged partial worker result.

mod repair;
mod salvage;

use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{FileOperation, Handoff, HandoffStatus, WorkerResult};

pub use repair::{repair_json, strip_markdown_fences};

use repair::try_parse;
use salvage::{salvage_planner, salvage_worker};

/// A task as the LLM emitted it, before normalization
///
/// This is the one deliberately lenient record in the system; the planners
/// immediately normalize it into a [`crate::domain::Task`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTask {
    pub id: Option<String>,
    pub description: String,
    pub scope: Vec<String>,
    pub acceptance: Option<String>,
    pub priority: Option<i64>,
    pub team: Option<String>,
}

/// Parsed planner output: scratchpad plus the next batch of raw tasks
#[derive(Debug, Clone, Default)]
pub struct PlannerResponse {
    pub scratchpad: String,
    pub tasks: Vec<RawTask>,
}

/// Coerce any JSON value to a string
///
/// List fields (`scope`, `files_changed`, `concerns`, `suggestions`)
/// sometimes arrive with numbers or objects mixed in; coercing at parse time
/// keeps downstream joins from blowing up.
fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().map(coerce_string).collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn raw_task_from_value(value: &Value) -> RawTask {
    RawTask {
        id: value.get("id").and_then(Value::as_str).map(str::to_string),
        description: value
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        scope: string_list(value.get("scope")),
        acceptance: value.get("acceptance").and_then(Value::as_str).map(str::to_string),
        priority: value.get("priority").and_then(Value::as_i64),
        team: value.get("team").and_then(Value::as_str).map(str::to_string),
    }
}

/// Parse the planner JSON object `{ scratchpad, tasks[] }`
///
/// Handles clean JSON, fenced JSON, literal newlines in strings, truncated
/// responses (salvaging individual task objects), and bare task arrays with
/// no scratchpad key. Never fails: the worst case is an empty response.
pub fn parse_planner_response(content: &str) -> PlannerResponse {
    debug!(content_len = content.len(), "parse_planner_response: called");
    let cleaned = strip_markdown_fences(content.trim());

    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}'))
        && end > start
    {
        let candidate = &cleaned[start..=end];
        let parsed = try_parse(candidate).or_else(|| try_parse(&repair_json(candidate)));

        if let Some(value) = parsed
            && let Some(tasks) = value.get("tasks").and_then(Value::as_array)
        {
            debug!(task_count = tasks.len(), "parse_planner_response: direct parse succeeded");
            return PlannerResponse {
                scratchpad: value
                    .get("scratchpad")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                tasks: tasks
                    .iter()
                    .filter(|t| t.is_object())
                    .map(raw_task_from_value)
                    .collect(),
            };
        }
    }

    let salvaged = salvage_planner(content);
    if !salvaged.tasks.is_empty() {
        warn!(
            task_count = salvaged.tasks.len(),
            content_len = content.len(),
            "Salvaged tasks from malformed LLM response"
        );
        return salvaged;
    }

    match parse_task_array(content) {
        Ok(tasks) => PlannerResponse {
            scratchpad: String::new(),
            tasks,
        },
        Err(_) => {
            warn!(
                head = %content.chars().take(300).collect::<String>(),
                "Failed to parse planner response"
            );
            PlannerResponse::default()
        }
    }
}

/// Parse a bare JSON array of task objects
///
/// Used by the reconciler, whose prompt asks for an array with no wrapper
/// object. Unlike the planner/worker parsers this one can fail; callers
/// treat a failure as "no fix tasks this sweep".
pub fn parse_task_array(content: &str) -> eyre::Result<Vec<RawTask>> {
    let mut cleaned = content.trim().to_string();

    if cleaned.starts_with("```")
        && let Some(first_nl) = cleaned.find('\n')
    {
        let last_fence = cleaned.rfind("```").unwrap_or(0);
        if last_fence > first_nl {
            cleaned = cleaned[first_nl + 1..last_fence].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (cleaned.find('['), cleaned.rfind(']'))
        && end > start
    {
        cleaned = cleaned[start..=end].to_string();
    }

    let parsed = try_parse(&cleaned)
        .or_else(|| try_parse(&repair_json(&cleaned)))
        .ok_or_else(|| eyre::eyre!("Response is not parseable JSON"))?;

    let Value::Array(items) = parsed else {
        eyre::bail!("Response is not an array");
    };

    Ok(items
        .iter()
        .filter(|t| t.is_object())
        .map(raw_task_from_value)
        .collect())
}

/// Parse the structured worker JSON response `{ handoff, file_operations }`
///
/// Falls through to salvage on anything that will not decode; the returned
/// handoff then carries a malformed-response concern. A failed handoff is
/// guaranteed at least one concern.
pub fn parse_worker_response(content: &str, task_id: &str) -> WorkerResult {
    debug!(%task_id, content_len = content.len(), "parse_worker_response: called");
    let cleaned = strip_markdown_fences(content.trim());

    let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) else {
        warn!(%task_id, "Worker response has no JSON object");
        return failure_result(task_id, "No JSON object in worker response");
    };
    if end <= start {
        warn!(%task_id, "Worker response has no JSON object");
        return failure_result(task_id, "No JSON object in worker response");
    }

    let candidate = &cleaned[start..=end];

    let parsed = try_parse(candidate).or_else(|| {
        debug!(%task_id, "parse_worker_response: direct parse failed, attempting repair");
        try_parse(&repair_json(candidate))
    });

    let Some(value) = parsed else {
        warn!(%task_id, "Worker JSON repair failed, attempting salvage");
        return salvage_worker(content, task_id);
    };
    if !value.is_object() {
        warn!(%task_id, "Worker response is not an object, attempting salvage");
        return salvage_worker(content, task_id);
    }

    let empty = Value::Object(serde_json::Map::new());
    let handoff_raw = value.get("handoff").unwrap_or(&empty);

    let status = handoff_raw
        .get("status")
        .and_then(Value::as_str)
        .and_then(HandoffStatus::parse)
        .unwrap_or(HandoffStatus::Complete);

    let mut handoff = Handoff::new(
        task_id,
        status,
        handoff_raw.get("summary").and_then(Value::as_str).unwrap_or(""),
    );
    handoff.files_changed = string_list(handoff_raw.get("files_changed"));
    handoff.concerns = string_list(handoff_raw.get("concerns"));
    handoff.suggestions = string_list(handoff_raw.get("suggestions"));

    if handoff.status == HandoffStatus::Failed && handoff.concerns.is_empty() {
        handoff.concerns.push(if handoff.summary.is_empty() {
            "Task failed with no stated reason".to_string()
        } else {
            handoff.summary.clone()
        });
    }

    let file_operations: Vec<FileOperation> = value
        .get("file_operations")
        .and_then(Value::as_array)
        .map(|ops| {
            ops.iter()
                .filter_map(|op| {
                    let path = op.get("path").and_then(Value::as_str)?;
                    let content = op.get("content").and_then(Value::as_str)?;
                    Some(FileOperation {
                        path: path.to_string(),
                        content: content.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    debug!(%task_id, op_count = file_operations.len(), status = %handoff.status, "parse_worker_response: complete");
    WorkerResult {
        handoff,
        file_operations,
    }
}

fn failure_result(task_id: &str, reason: &str) -> WorkerResult {
    let mut handoff = Handoff::new(task_id, HandoffStatus::Failed, reason);
    handoff.concerns = vec![reason.to_string()];
    WorkerResult {
        handoff,
        file_operations: Vec::new(),
    }
}
