//! Subplanner - recursive decomposition of oversized tasks
//!
//! A task whose scope is wide enough gets its own mini planning loop: the
//! LLM splits it into subtasks (scopes narrowed to the parent's), subtasks
//! dispatch concurrently (recursing when still too wide), and the child
//! handoffs are aggregated into a single handoff for the parent.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::{Handoff, HandoffMetrics, HandoffStatus, Task, Team};
use crate::events::{EngineEvent, EventBus, EventType};
use crate::llm::{ChatMessage, LlmClient};
use crate::parse::{RawTask, parse_planner_response};
use crate::project;
use crate::worker::WorkerPool;

/// No decomposition below this recursion depth
pub const MAX_DEPTH: u32 = 3;

/// Minimum scope size that triggers decomposition
pub const SCOPE_THRESHOLD: usize = 4;

/// Cap on subtasks per parent
pub const MAX_SUBTASKS: usize = 10;

const LOOP_SLEEP: Duration = Duration::from_millis(500);
const MIN_HANDOFFS_FOR_REPLAN: usize = 1;
const BACKOFF_BASE_SECS: f64 = 2.0;
const BACKOFF_MAX_SECS: f64 = 30.0;
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const MAX_SUBPLANNER_ITERATIONS: u32 = 20;
const MAX_HANDOFF_SUMMARY_CHARS: usize = 300;
const MAX_FILES_PER_HANDOFF: usize = 30;

/// Recursive decomposition engine for complex tasks
pub struct Subplanner {
    client: Arc<dyn LlmClient>,
    worker_pool: Arc<WorkerPool>,
    output_dir: PathBuf,
    system_prompt: String,
    event_bus: Option<Arc<EventBus>>,
}

impl Subplanner {
    pub fn new(
        client: Arc<dyn LlmClient>,
        worker_pool: Arc<WorkerPool>,
        output_dir: PathBuf,
        system_prompt: String,
        event_bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            client,
            worker_pool,
            output_dir,
            system_prompt,
            event_bus,
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.emit(event);
        }
    }

    /// Check whether a task warrants decomposition
    pub fn should_decompose(&self, task: &Task, depth: u32) -> bool {
        depth < MAX_DEPTH && task.scope.len() >= SCOPE_THRESHOLD
    }

    /// Decompose a parent task, execute the subtasks, aggregate the handoffs
    ///
    /// Boxed so subtask execution can recurse through a fresh spawn.
    pub fn decompose_and_execute(self: Arc<Self>, parent: Task, depth: u32) -> BoxFuture<'static, Handoff> {
        Box::pin(async move { self.run_decomposition(parent, depth).await })
    }

    async fn run_decomposition(self: Arc<Self>, parent: Task, depth: u32) -> Handoff {
        info!(
            task_id = %parent.id,
            depth,
            scope = parent.scope.len(),
            "Subplanner starting"
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Handoff)>();

        let mut all_handoffs: Vec<Handoff> = Vec::new();
        let mut handoffs_since_plan: Vec<Handoff> = Vec::new();
        let mut active: HashSet<String> = HashSet::new();
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut all_subtasks: Vec<Task> = Vec::new();

        let mut conversation = vec![ChatMessage::system(&self.system_prompt)];
        let mut iteration: u32 = 0;
        let mut planning_done = false;
        let mut consecutive_errors: u32 = 0;
        let mut aborted = false;

        while iteration < MAX_SUBPLANNER_ITERATIONS {
            drain_handoffs(&mut rx, &mut all_handoffs, &mut handoffs_since_plan, &mut active);

            let has_capacity = self.worker_pool.has_capacity();
            let enough_handoffs = handoffs_since_plan.len() >= MIN_HANDOFFS_FOR_REPLAN;
            let no_active = active.is_empty() && iteration > 0;
            let needs_plan = has_capacity && (iteration == 0 || enough_handoffs || no_active) && !planning_done;

            if needs_plan {
                let state = project::snapshot(&self.output_dir);
                let msg = if iteration == 0 {
                    build_initial_message(&parent, &state.file_tree, depth)
                } else {
                    build_follow_up_message(&state.file_tree, &handoffs_since_plan, &active, &all_subtasks)
                };
                conversation.push(ChatMessage::user(msg));

                info!(
                    task_id = %parent.id,
                    iteration = iteration + 1,
                    handoffs = handoffs_since_plan.len(),
                    active = active.len(),
                    "Subplanner iteration"
                );

                match self.client.complete(&conversation).await {
                    Ok(response) => {
                        conversation.push(ChatMessage::assistant(&response.content));

                        let parsed = parse_planner_response(&response.content);
                        if !parsed.scratchpad.is_empty() {
                            debug!(task_id = %parent.id, scratchpad_len = parsed.scratchpad.len(), "Subplanner scratchpad updated");
                        }

                        let subtasks = build_subtasks(parsed.tasks, &parent, &dispatched);

                        handoffs_since_plan.clear();
                        iteration += 1;
                        consecutive_errors = 0;

                        if subtasks.is_empty() && active.is_empty() {
                            if iteration == 1 {
                                // Atomic task: no decomposition, run it directly.
                                info!(task_id = %parent.id, "Task is atomic, sending to worker directly");
                                return self.worker_pool.execute_task(&parent).await;
                            }
                            planning_done = true;
                        } else if !subtasks.is_empty() {
                            all_subtasks.extend(subtasks.iter().cloned());
                            Self::spawn_subtasks(&self, subtasks, &parent, depth, &tx, &mut active, &mut dispatched);
                        }
                    }
                    Err(e) => {
                        // The user message stays in the conversation; the
                        // retry continues from the same context.
                        consecutive_errors += 1;
                        let backoff = (BACKOFF_BASE_SECS * 2f64.powi(consecutive_errors as i32 - 1))
                            .min(BACKOFF_MAX_SECS);
                        error!(
                            task_id = %parent.id,
                            attempt = consecutive_errors,
                            error = %e,
                            "Subplanner plan failed"
                        );
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            aborted = true;
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                        continue;
                    }
                }
            }

            if planning_done && active.is_empty() {
                break;
            }
            if !planning_done && active.is_empty() && iteration > 0 && handoffs_since_plan.is_empty() {
                break;
            }

            tokio::time::sleep(LOOP_SLEEP).await;
        }

        drain_handoffs(&mut rx, &mut all_handoffs, &mut handoffs_since_plan, &mut active);

        while !active.is_empty() {
            drain_handoffs(&mut rx, &mut all_handoffs, &mut handoffs_since_plan, &mut active);
            tokio::time::sleep(LOOP_SLEEP).await;
        }

        if aborted && all_handoffs.is_empty() {
            return Handoff::failure(
                &parent.id,
                format!(
                    "Subplanner aborted after {} consecutive planning errors",
                    MAX_CONSECUTIVE_ERRORS
                ),
                0,
            );
        }

        let mut aggregate = aggregate_handoffs(&parent, &all_subtasks, &all_handoffs);
        if aborted {
            aggregate
                .concerns
                .push("Subplanner aborted early after repeated planning errors".to_string());
        }
        aggregate
    }

    fn spawn_subtasks(
        this: &Arc<Self>,
        subtasks: Vec<Task>,
        parent: &Task,
        depth: u32,
        tx: &mpsc::UnboundedSender<(String, Handoff)>,
        active: &mut HashSet<String>,
        dispatched: &mut HashSet<String>,
    ) {
        for subtask in subtasks {
            dispatched.insert(subtask.id.clone());
            active.insert(subtask.id.clone());

            info!(
                subtask_id = %subtask.id,
                team = %subtask.team,
                scope = subtask.scope.len(),
                "Dispatching subtask"
            );

            this.emit(
                EngineEvent::new(EventType::SubtaskDispatched)
                    .with_task(&subtask.id)
                    .with_parent(&parent.id)
                    .with_team(subtask.team.as_str())
                    .with_description(subtask.description.chars().take(200).collect::<String>()),
            );

            let this = Arc::clone(this);
            let tx = tx.clone();
            tokio::spawn(async move {
                let id = subtask.id.clone();
                let handoff = if this.should_decompose(&subtask, depth + 1) {
                    info!(subtask_id = %id, depth = depth + 1, "Subtask still complex, recursing");
                    this.decompose_and_execute(subtask, depth + 1).await
                } else {
                    this.worker_pool.execute_task(&subtask).await
                };
                let _ = tx.send((id, handoff));
            });
        }
    }
}

fn drain_handoffs(
    rx: &mut mpsc::UnboundedReceiver<(String, Handoff)>,
    all_handoffs: &mut Vec<Handoff>,
    since_plan: &mut Vec<Handoff>,
    active: &mut HashSet<String>,
) {
    while let Ok((task_id, handoff)) = rx.try_recv() {
        all_handoffs.push(handoff.clone());
        since_plan.push(handoff);
        active.remove(&task_id);
    }
}

fn build_initial_message(parent: &Task, file_tree: &[String], depth: u32) -> String {
    let tree = if file_tree.is_empty() {
        "(empty project)".to_string()
    } else {
        file_tree.join("\n")
    };
    format!(
        "## Parent Task\n\
         - **ID**: {}\n\
         - **Description**: {}\n\
         - **Scope**: {}\n\
         - **Acceptance**: {}\n\
         - **Priority**: {}\n\
         - **Team**: {}\n\
         - **Decomposition Depth**: {}\n\
         \n\
         ## Project File Tree\n\
         {}\n\
         \n\
         This is the initial planning call. Respond with a JSON object: \
         {{ \"scratchpad\": \"your analysis\", \"tasks\": [...] }}. \
         If the task is atomic, return empty tasks array.",
        parent.id, parent.description, parent.scope.join(", "), parent.acceptance, parent.priority, parent.team, depth, tree
    )
}

fn build_follow_up_message(
    file_tree: &[String],
    new_handoffs: &[Handoff],
    active: &HashSet<String>,
    all_subtasks: &[Task],
) -> String {
    let mut parts = vec![format!("## Updated Project File Tree\n{}\n", file_tree.join("\n"))];

    if !new_handoffs.is_empty() {
        parts.push(format!("## New Subtask Handoffs ({} since last plan)", new_handoffs.len()));
        for h in new_handoffs {
            parts.push(format!("### Task {} — {}", h.task_id, h.status));
            parts.push(format!(
                "Summary: {}",
                h.summary.chars().take(MAX_HANDOFF_SUMMARY_CHARS).collect::<String>()
            ));
            let files: Vec<&str> = h
                .files_changed
                .iter()
                .take(MAX_FILES_PER_HANDOFF)
                .map(String::as_str)
                .collect();
            parts.push(format!("Files changed: {}", files.join(", ")));
            if !h.concerns.is_empty() {
                parts.push(format!("Concerns: {}", h.concerns.join("; ")));
            }
            if !h.suggestions.is_empty() {
                parts.push(format!("Suggestions: {}", h.suggestions.join("; ")));
            }
            parts.push(String::new());
        }
    }

    if !active.is_empty() {
        parts.push(format!("## Currently Active Subtasks ({})", active.len()));
        let mut ids: Vec<&String> = active.iter().collect();
        ids.sort();
        for id in ids {
            if let Some(task) = all_subtasks.iter().find(|t| &t.id == id) {
                parts.push(format!(
                    "- {}: {}",
                    id,
                    task.description.chars().take(120).collect::<String>()
                ));
            }
        }
        parts.push(String::new());
    }

    parts.push(
        "Continue planning. Review handoffs and emit next batch. \
         Return empty tasks array if all work is done."
            .to_string(),
    );
    parts.join("\n")
}

/// Convert raw LLM subtasks into Tasks scoped inside the parent
///
/// Scopes are intersected with the parent's scope; a subtask whose scope
/// empties out is dropped. The batch is capped at [`MAX_SUBTASKS`].
fn build_subtasks(raw_tasks: Vec<RawTask>, parent: &Task, dispatched: &HashSet<String>) -> Vec<Task> {
    let mut subtasks: Vec<Task> = Vec::new();
    let mut sub_counter = dispatched.len();

    for raw in raw_tasks {
        if raw.description.trim().is_empty() {
            continue;
        }

        sub_counter += 1;
        let task_id = raw.id.clone().unwrap_or_else(|| format!("{}-sub-{}", parent.id, sub_counter));

        if dispatched.contains(&task_id) {
            debug!(%task_id, "Skipping duplicate subtask");
            continue;
        }

        let mut scope = raw.scope;
        if !parent.scope.is_empty() {
            let invalid: Vec<&String> = scope.iter().filter(|f| !parent.scope.contains(f)).collect();
            if !invalid.is_empty() {
                warn!(%task_id, ?invalid, "Subtask scope has files outside parent, removing");
                scope.retain(|f| parent.scope.contains(f));
                if scope.is_empty() {
                    warn!(%task_id, "Subtask has no valid scope, skipping");
                    continue;
                }
            }
        }

        let team = raw
            .team
            .as_deref()
            .and_then(Team::parse)
            .unwrap_or(parent.team);

        subtasks.push(
            Task::new(task_id, raw.description)
                .with_parent(&parent.id)
                .with_scope(scope)
                .with_acceptance(raw.acceptance.unwrap_or_default())
                .with_priority(raw.priority.unwrap_or(parent.priority))
                .with_team(team),
        );
    }

    if subtasks.len() > MAX_SUBTASKS {
        warn!(
            parent_id = %parent.id,
            count = subtasks.len(),
            "Too many subtasks, truncating to {}",
            MAX_SUBTASKS
        );
        subtasks.truncate(MAX_SUBTASKS);
    }

    subtasks
}

/// Combine child handoffs into one handoff for the parent
fn aggregate_handoffs(parent: &Task, subtasks: &[Task], handoffs: &[Handoff]) -> Handoff {
    let completed = handoffs.iter().filter(|h| h.status == HandoffStatus::Complete).count();
    let failed = handoffs.iter().filter(|h| h.status == HandoffStatus::Failed).count();
    let total = subtasks.len();

    let status = if completed == total {
        HandoffStatus::Complete
    } else if failed == total {
        HandoffStatus::Failed
    } else if completed > 0 {
        HandoffStatus::Partial
    } else {
        HandoffStatus::Blocked
    };

    let summary_parts: Vec<String> = handoffs
        .iter()
        .map(|h| format!("[{}] ({}): {}", h.task_id, h.status, h.summary))
        .collect();
    let summary = format!(
        "Decomposed \"{}\" into {} subtasks. {} complete, {} failed, {} other.\n\n{}",
        parent.description.chars().take(80).collect::<String>(),
        total,
        completed,
        failed,
        total.saturating_sub(completed + failed),
        summary_parts.join("\n")
    );

    let mut files: HashSet<String> = HashSet::new();
    let mut concerns: Vec<String> = Vec::new();
    let mut suggestions: Vec<String> = Vec::new();
    let mut total_tokens = 0;
    let mut max_duration = 0;
    let mut files_created = 0;
    let mut files_modified = 0;

    for h in handoffs {
        files.extend(h.files_changed.iter().cloned());
        concerns.extend(h.concerns.iter().map(|c| format!("[{}] {}", h.task_id, c)));
        suggestions.extend(h.suggestions.iter().map(|s| format!("[{}] {}", h.task_id, s)));
        total_tokens += h.metrics.tokens_used;
        max_duration = max_duration.max(h.metrics.duration_ms);
        files_created += h.metrics.files_created;
        files_modified += h.metrics.files_modified;
    }

    let mut files: Vec<String> = files.into_iter().collect();
    files.sort();

    Handoff {
        task_id: parent.id.clone(),
        status,
        summary,
        files_changed: files,
        concerns,
        suggestions,
        metrics: HandoffMetrics {
            tokens_used: total_tokens,
            duration_ms: max_duration,
            files_created,
            files_modified,
        },
    }
}
