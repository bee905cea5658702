//! CodeSwarm - multi-agent code synthesis orchestrator
//!
//! Given a natural-language project request, CodeSwarm drives an LLM API
//! through an iterative plan/dispatch/observe/replan loop until a runnable
//! source tree exists on disk. The interesting machinery is the scheduling:
//! concurrent LLM workers behind a shared semaphore, recursive decomposition
//! of oversized tasks, structured-output parsing that survives adversarial
//! LLM failure modes, bounded conversation growth, and a background
//! reconciler that feeds fix tasks back into the planner.
//!
//! # Core Concepts
//!
//! - **Tasks and handoffs**: the planner emits tasks; every task produces
//!   exactly one handoff, which feeds the next planning iteration.
//! - **Full-file writes**: workers emit complete files, never diffs; the
//!   filesystem is the shared state.
//! - **Parse never fails**: malformed LLM output is repaired or salvaged,
//!   worst case into an empty plan or a partial handoff.
//! - **Everything terminates**: iteration caps, nudge budgets, and error
//!   backoff ceilings bound every loop.
//!
//! # Modules
//!
//! - [`domain`] - Task, Handoff, FileOperation and their enums
//! - [`llm`] - client trait, OpenAI-compatible HTTP implementation
//! - [`parse`] - response parsing with repair and salvage
//! - [`project`] - output directory snapshots
//! - [`events`] - progress event bus and JSONL logger
//! - [`worker`] - bounded-concurrency task executor
//! - [`planner`] - root planner and recursive subplanner
//! - [`reconciler`] - periodic structural sweep
//! - [`validation`] - post-build install/check/test/fix recipe
//! - [`engine`] - the driver wiring it all together

pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod events;
pub mod llm;
pub mod parse;
pub mod planner;
pub mod project;
pub mod prompts;
pub mod reconciler;
pub mod validation;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, EngineConfig, LlmConfig, ReconcilerConfig};
pub use domain::{FileOperation, Handoff, HandoffMetrics, HandoffStatus, Task, TaskStatus, Team, WorkerResult};
pub use engine::{Engine, RunReport};
pub use events::{EngineEvent, EventBus, EventStream, EventType, spawn_event_logger};
pub use llm::{ChatMessage, CompletionOverrides, CompletionResponse, LlmClient, LlmError, OpenAIClient, Role};
pub use parse::{PlannerResponse, RawTask, parse_planner_response, parse_task_array, parse_worker_response};
pub use planner::{Planner, PlannerReport, Subplanner};
pub use project::ProjectState;
pub use prompts::PromptLoader;
pub use reconciler::Reconciler;
pub use worker::{WORKER_RESPONSE_FORMAT, WorkerPool};
