//! Handoff - the structured result a task produces on completion

use serde::{Deserialize, Serialize};

/// Outcome status of a handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Complete,
    Partial,
    Blocked,
    Failed,
}

impl HandoffStatus {
    /// Parse a status tag from LLM output (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "complete" => Some(HandoffStatus::Complete),
            "partial" => Some(HandoffStatus::Partial),
            "blocked" => Some(HandoffStatus::Blocked),
            "failed" => Some(HandoffStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffStatus::Complete => "complete",
            HandoffStatus::Partial => "partial",
            HandoffStatus::Blocked => "blocked",
            HandoffStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cost and output accounting for a handoff
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HandoffMetrics {
    pub files_created: u64,
    pub files_modified: u64,
    pub tokens_used: u64,
    pub duration_ms: u64,
}

/// The structured result record a task produces
///
/// `files_changed` reflects only files actually written. A failed handoff
/// always carries at least one concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub task_id: String,
    pub status: HandoffStatus,
    pub summary: String,
    pub files_changed: Vec<String>,
    pub concerns: Vec<String>,
    pub suggestions: Vec<String>,
    pub metrics: HandoffMetrics,
}

impl Handoff {
    pub fn new(task_id: impl Into<String>, status: HandoffStatus, summary: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            summary: summary.into(),
            files_changed: Vec::new(),
            concerns: Vec::new(),
            suggestions: Vec::new(),
            metrics: HandoffMetrics::default(),
        }
    }

    /// Build a failure handoff with the error recorded as a concern
    pub fn failure(task_id: impl Into<String>, summary: impl Into<String>, duration_ms: u64) -> Self {
        let summary = summary.into();
        Self {
            task_id: task_id.into(),
            status: HandoffStatus::Failed,
            summary: summary.clone(),
            files_changed: Vec::new(),
            concerns: vec![summary],
            suggestions: Vec::new(),
            metrics: HandoffMetrics {
                duration_ms,
                ..HandoffMetrics::default()
            },
        }
    }
}

/// A single full-file write emitted by a worker
///
/// The path is project-root-relative and the content is the complete
/// intended file, never a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileOperation {
    pub path: String,
    pub content: String,
}

/// Parsed worker response: the handoff plus the file operations to apply
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub handoff: Handoff,
    pub file_operations: Vec<FileOperation>,
}
