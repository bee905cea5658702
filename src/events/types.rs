//! Engine event types
//!
//! Events describe everything observable about a run: lifecycle, planning
//! iterations, task dispatch and completion, reconciler findings, and the
//! post-build validation. Consumers subscribe via the [`super::EventBus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of event type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EngineStarted,
    SpecCreated,
    PlanningIteration,
    TaskDispatched,
    TaskStarted,
    TaskCompleted,
    SubplannerStarted,
    SubtaskDispatched,
    ReconcilerIssue,
    BuildComplete,
    ValidationStarted,
    ValidationResult,
    EngineDone,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::EngineStarted => "engine_started",
            EventType::SpecCreated => "spec_created",
            EventType::PlanningIteration => "planning_iteration",
            EventType::TaskDispatched => "task_dispatched",
            EventType::TaskStarted => "task_started",
            EventType::TaskCompleted => "task_completed",
            EventType::SubplannerStarted => "subplanner_started",
            EventType::SubtaskDispatched => "subtask_dispatched",
            EventType::ReconcilerIssue => "reconciler_issue",
            EventType::BuildComplete => "build_complete",
            EventType::ValidationStarted => "validation_started",
            EventType::ValidationResult => "validation_result",
            EventType::EngineDone => "engine_done",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single engine progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            task_id: None,
            parent_id: None,
            team: None,
            description: None,
            status: None,
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}
