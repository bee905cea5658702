//! Task - the unit of work dispatched to workers and subplanners

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Complete,
    Failed,
}

/// Which team agent executes a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Team {
    Product,
    Engineering,
    Quality,
}

impl Team {
    /// Parse a team tag from LLM output (case-insensitive)
    ///
    /// Returns None for unknown tags; callers fall back to Engineering.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "product" => Some(Team::Product),
            "engineering" => Some(Team::Engineering),
            "quality" => Some(Team::Quality),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Team::Product => "product",
            Team::Engineering => "engineering",
            Team::Quality => "quality",
        }
    }
}

impl std::fmt::Display for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The unit of work
///
/// Produced by the planners from raw LLM output, dispatched to either the
/// subplanner (large scope) or a worker. Identifiers are unique across a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Set for subtasks created by the subplanner
    pub parent_id: Option<String>,
    pub description: String,
    /// File paths this task should focus on, relative to the project root
    pub scope: Vec<String>,
    pub acceptance: String,
    pub team: Team,
    /// Lower is more urgent
    pub priority: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            description: description.into(),
            scope: Vec::new(),
            acceptance: String::new(),
            team: Team::Engineering,
            priority: 5,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_team(mut self, team: Team) -> Self {
        self.team = team;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_acceptance(mut self, acceptance: impl Into<String>) -> Self {
        self.acceptance = acceptance.into();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}
