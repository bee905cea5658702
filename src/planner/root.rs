//! Root planner - the iterative plan/dispatch/observe loop
//!
//! The planner keeps one long-lived LLM conversation. Each tick it drains
//! completed handoffs, injects reconciler fix tasks, decides whether to
//! replan, and dispatches new tasks fire-and-forget. Termination is decided
//! from the combination of an empty plan, no active work, and whether the
//! output directory contains real source files yet.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::{Handoff, Task, Team};
use crate::events::{EngineEvent, EventBus, EventType};
use crate::llm::{ChatMessage, LlmClient};
use crate::parse::{RawTask, parse_planner_response};
use crate::project;
use crate::worker::WorkerPool;

use super::sub::Subplanner;

const LOOP_SLEEP: Duration = Duration::from_millis(500);
const MIN_HANDOFFS_FOR_REPLAN: usize = 3;
const BACKOFF_BASE_SECS: f64 = 2.0;
const BACKOFF_MAX_SECS: f64 = 30.0;
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const MAX_HANDOFF_SUMMARY_CHARS: usize = 400;
const MAX_FILES_PER_HANDOFF: usize = 30;

/// Conversation compaction threshold in total characters.
pub const CONVERSATION_COMPACTION_CHARS: usize = 200_000;

/// How many times the planner nudges the LLM for engineering tasks before
/// accepting an empty plan as final.
pub const MAX_EMPTY_PLAN_NUDGES: u32 = 3;

/// Extensions that count as real project output rather than documentation.
const SOURCE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".jsx", ".tsx", ".html", ".css", ".scss", ".java", ".c", ".cpp", ".h", ".hpp", ".go", ".rs",
    ".rb", ".php", ".swift", ".kt", ".cs", ".r", ".lua", ".sh", ".bat",
];

const NUDGE_MESSAGE: &str = "\n\n## CRITICAL — PROJECT INCOMPLETE\n\n\
    You returned an empty tasks array on the previous iteration, but the project \
    has NO source code files yet — only documentation/spec files exist. \
    The project is NOT done.\n\n\
    You MUST now emit Engineering tasks. The minimum deliverables before you can \
    return an empty tasks array:\n\
    1. A constants/config file with all shared values\n\
    2. A main entry point file (main.py, index.html, etc.)\n\
    3. All core feature source files\n\
    4. A requirements.txt (if applicable)\n\n\
    Review the SPEC.md / handoff reports and create Engineering tasks for the \
    ACTUAL implementation NOW. Do NOT return an empty tasks array.";

/// Final accounting for one planning run
#[derive(Debug, Default)]
pub struct PlannerReport {
    pub iterations: u32,
    pub dispatched: usize,
    pub handoffs: Vec<Handoff>,
}

/// Mutable per-run planning state
///
/// Lives for one `run_loop` call; the planner itself only holds the shared
/// control surface (stop flag, injected-task buffer).
struct LoopState {
    conversation: Vec<ChatMessage>,
    scratchpad: String,
    all_handoffs: Vec<Handoff>,
    handoffs_since_plan: Vec<Handoff>,
    active: HashSet<String>,
    dispatched_ids: HashSet<String>,
    all_tasks: Vec<Task>,
    task_counter: u32,
    prev_file_tree: HashSet<String>,
    nudge_pending: bool,
}

/// The Manager: iterative planning loop over the whole project
pub struct Planner {
    client: Arc<dyn LlmClient>,
    worker_pool: Arc<WorkerPool>,
    subplanner: Option<Arc<Subplanner>>,
    output_dir: PathBuf,
    system_prompt: String,
    max_iterations: u32,
    event_bus: Option<Arc<EventBus>>,
    running: AtomicBool,
    injected: Mutex<Vec<Task>>,
}

impl Planner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn LlmClient>,
        worker_pool: Arc<WorkerPool>,
        subplanner: Option<Arc<Subplanner>>,
        output_dir: PathBuf,
        system_prompt: String,
        max_iterations: u32,
        event_bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            client,
            worker_pool,
            subplanner,
            output_dir,
            system_prompt,
            max_iterations,
            event_bus,
            running: AtomicBool::new(false),
            injected: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.emit(event);
        }
    }

    /// Queue fix tasks for the next planning tick
    ///
    /// Called by the reconciler from its own task; safe at any time.
    pub fn inject_tasks(&self, tasks: Vec<Task>) {
        let mut injected = match self.injected.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        injected.extend(tasks);
    }

    /// Request cooperative shutdown; in-flight tasks drain first
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run the planning loop until the project is done
    pub async fn run_loop(&self, request: &str) -> PlannerReport {
        self.running.store(true, Ordering::SeqCst);
        info!(request = %request.chars().take(200).collect::<String>(), "Starting planning loop");

        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Handoff)>();

        let mut state = LoopState {
            conversation: vec![ChatMessage::system(&self.system_prompt)],
            scratchpad: String::new(),
            all_handoffs: Vec::new(),
            handoffs_since_plan: Vec::new(),
            active: HashSet::new(),
            dispatched_ids: HashSet::new(),
            all_tasks: Vec::new(),
            task_counter: 0,
            prev_file_tree: HashSet::new(),
            nudge_pending: false,
        };

        let mut iteration: u32 = 0;
        let mut planning_done = false;
        let mut consecutive_errors: u32 = 0;
        let mut empty_plan_nudges: u32 = 0;

        while self.running.load(Ordering::SeqCst) && iteration < self.max_iterations {
            drain_handoffs(&mut rx, &mut state);

            let injected: Vec<Task> = {
                let mut guard = match self.injected.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.drain(..).collect()
            };
            if !injected.is_empty() {
                info!(count = injected.len(), "Injecting fix tasks from reconciler");
                self.dispatch_tasks(injected, &mut state, &tx);
            }

            let has_capacity = self.worker_pool.has_capacity();
            let enough_handoffs = state.handoffs_since_plan.len() >= MIN_HANDOFFS_FOR_REPLAN;
            let no_active_work = state.active.is_empty() && iteration > 0;
            let needs_plan = has_capacity && (iteration == 0 || enough_handoffs || no_active_work) && !planning_done;

            if needs_plan {
                match self.plan(request, iteration, &mut state).await {
                    Ok(tasks) => {
                        iteration += 1;
                        consecutive_errors = 0;
                        state.handoffs_since_plan.clear();

                        if tasks.is_empty() && state.active.is_empty() {
                            if iteration == 1 {
                                warn!("LLM returned no tasks on first iteration, done");
                                planning_done = true;
                            } else if self.project_has_source_files() {
                                planning_done = true;
                            } else if empty_plan_nudges >= MAX_EMPTY_PLAN_NUDGES {
                                error!(
                                    nudges = empty_plan_nudges,
                                    "LLM refused to emit engineering tasks, giving up"
                                );
                                planning_done = true;
                            } else {
                                empty_plan_nudges += 1;
                                state.nudge_pending = true;
                                warn!(
                                    nudge = empty_plan_nudges,
                                    max = MAX_EMPTY_PLAN_NUDGES,
                                    "LLM returned 0 tasks but no source files exist, nudging"
                                );
                            }
                        } else if !tasks.is_empty() {
                            empty_plan_nudges = 0;
                            self.dispatch_tasks(tasks, &mut state, &tx);
                        }
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        let backoff =
                            (BACKOFF_BASE_SECS * 2f64.powi(consecutive_errors as i32 - 1)).min(BACKOFF_MAX_SECS);
                        error!(
                            attempt = consecutive_errors,
                            backoff_secs = backoff,
                            error = %e,
                            "Planning failed"
                        );
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            error!("Aborting after {} consecutive failures", MAX_CONSECUTIVE_ERRORS);
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                        continue;
                    }
                }
            }

            if planning_done && state.active.is_empty() {
                break;
            }

            tokio::time::sleep(LOOP_SLEEP).await;
        }

        // Wait for stragglers before reporting.
        while !state.active.is_empty() && self.running.load(Ordering::SeqCst) {
            drain_handoffs(&mut rx, &mut state);
            tokio::time::sleep(LOOP_SLEEP).await;
        }
        drain_handoffs(&mut rx, &mut state);

        self.running.store(false, Ordering::SeqCst);
        info!(
            iterations = iteration,
            dispatched = state.dispatched_ids.len(),
            handoffs = state.all_handoffs.len(),
            "Planning loop complete"
        );

        PlannerReport {
            iterations: iteration,
            dispatched: state.dispatched_ids.len(),
            handoffs: state.all_handoffs,
        }
    }

    /// One planning call: build the message, ask the LLM, normalize tasks
    async fn plan(&self, request: &str, iteration: u32, state: &mut LoopState) -> Result<Vec<Task>, crate::llm::LlmError> {
        let snapshot = project::snapshot(&self.output_dir);

        let msg = if iteration == 0 {
            build_initial_message(request, &snapshot.file_tree)
        } else {
            build_follow_up_message(state, &snapshot.file_tree)
        };
        state.conversation.push(ChatMessage::user(msg));

        compact_conversation(
            &mut state.conversation,
            &state.scratchpad,
            state.dispatched_ids.len(),
            state.active.len(),
            state.all_handoffs.len(),
        );

        info!(
            iteration = iteration + 1,
            handoffs = state.handoffs_since_plan.len(),
            active = state.active.len(),
            dispatched = state.dispatched_ids.len(),
            "Planning iteration"
        );
        self.emit(
            EngineEvent::new(EventType::PlanningIteration).with_data(serde_json::json!({"iteration": iteration + 1})),
        );

        let response = self.client.complete(&state.conversation).await?;
        state.conversation.push(ChatMessage::assistant(&response.content));

        let parsed = parse_planner_response(&response.content);
        if !parsed.scratchpad.is_empty() {
            debug!(scratchpad = %parsed.scratchpad.chars().take(500).collect::<String>(), "Scratchpad updated");
            state.scratchpad = parsed.scratchpad;
        }

        let tasks = build_tasks_from_raw(parsed.tasks, &mut state.task_counter, &state.dispatched_ids);

        info!(
            new_tasks = tasks.len(),
            tokens = response.total_tokens,
            latency_ms = response.latency_ms,
            "Plan produced tasks"
        );

        state.prev_file_tree = snapshot.file_tree.iter().cloned().collect();

        Ok(tasks)
    }

    /// Fire-and-forget dispatch of a task batch
    fn dispatch_tasks(&self, tasks: Vec<Task>, state: &mut LoopState, tx: &mpsc::UnboundedSender<(String, Handoff)>) {
        for task in tasks {
            if state.dispatched_ids.contains(&task.id) {
                continue;
            }
            state.dispatched_ids.insert(task.id.clone());
            state.active.insert(task.id.clone());
            state.all_tasks.push(task.clone());

            info!(
                task_id = %task.id,
                team = %task.team,
                scope = task.scope.len(),
                priority = task.priority,
                description = %task.description.chars().take(100).collect::<String>(),
                "Dispatching task"
            );
            self.emit(
                EngineEvent::new(EventType::TaskDispatched)
                    .with_task(&task.id)
                    .with_team(task.team.as_str())
                    .with_description(task.description.chars().take(200).collect::<String>()),
            );

            let pool = Arc::clone(&self.worker_pool);
            let subplanner = self.subplanner.clone();
            let bus = self.event_bus.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let id = task.id.clone();
                let handoff = match subplanner {
                    Some(sp) if sp.should_decompose(&task, 0) => {
                        info!(task_id = %id, scope = task.scope.len(), "Task is complex, decomposing via subplanner");
                        if let Some(ref bus) = bus {
                            bus.emit(
                                EngineEvent::new(EventType::SubplannerStarted)
                                    .with_task(&id)
                                    .with_description(format!("Decomposing complex task (scope={})", task.scope.len())),
                            );
                        }
                        sp.decompose_and_execute(task, 0).await
                    }
                    _ => pool.execute_task(&task).await,
                };
                let _ = tx.send((id, handoff));
            });
        }
    }

    fn project_has_source_files(&self) -> bool {
        let state = project::snapshot(&self.output_dir);
        state
            .file_tree
            .iter()
            .any(|f| SOURCE_EXTENSIONS.contains(&crate::domain::extension_of(f).as_str()))
    }
}

fn drain_handoffs(rx: &mut mpsc::UnboundedReceiver<(String, Handoff)>, state: &mut LoopState) {
    while let Ok((task_id, handoff)) = rx.try_recv() {
        state.all_handoffs.push(handoff.clone());
        state.handoffs_since_plan.push(handoff);
        state.active.remove(&task_id);
    }
}

fn build_initial_message(request: &str, file_tree: &[String]) -> String {
    let tree = if file_tree.is_empty() {
        "(empty project — nothing built yet)".to_string()
    } else {
        file_tree.join("\n")
    };
    format!(
        "## User Request\n{}\n\n## Project File Tree\n\n{}\n\n\
         This is the initial planning call. Analyze the request and produce your first batch of tasks.",
        request, tree
    )
}

/// Sorted additions and removals between two file trees
fn tree_delta(prev: &HashSet<String>, current: &[String]) -> (Vec<String>, Vec<String>) {
    let current_set: HashSet<&String> = current.iter().collect();
    let mut new_files: Vec<String> = current.iter().filter(|f| !prev.contains(*f)).cloned().collect();
    let mut removed: Vec<String> = prev.iter().filter(|f| !current_set.contains(*f)).cloned().collect();
    new_files.sort();
    removed.sort();
    (new_files, removed)
}

fn build_follow_up_message(state: &mut LoopState, file_tree: &[String]) -> String {
    let mut parts: Vec<String> = Vec::new();

    let (new_files, removed_files) = tree_delta(&state.prev_file_tree, file_tree);

    parts.push("## Project State Update\n".to_string());
    if !new_files.is_empty() {
        parts.push(format!("### New files ({})\n{}", new_files.len(), new_files.join("\n")));
    }
    if !removed_files.is_empty() {
        parts.push(format!(
            "### Removed files ({})\n{}",
            removed_files.len(),
            removed_files.join("\n")
        ));
    }
    if new_files.is_empty() && removed_files.is_empty() {
        parts.push("No file tree changes since last plan.".to_string());
    }
    parts.push(format!("\nTotal files: {}", file_tree.len()));

    if !state.handoffs_since_plan.is_empty() {
        parts.push(format!(
            "\n## Task Handoffs ({} since last plan)\n",
            state.handoffs_since_plan.len()
        ));
        for h in &state.handoffs_since_plan {
            parts.push(format!("### Task {} — {}", h.task_id, h.status));
            let mut summary: String = h.summary.chars().take(MAX_HANDOFF_SUMMARY_CHARS).collect();
            if h.summary.chars().count() > MAX_HANDOFF_SUMMARY_CHARS {
                summary.push_str("...");
            }
            parts.push(format!("Summary: {}", summary));

            let mut files: Vec<String> = h.files_changed.iter().take(MAX_FILES_PER_HANDOFF).cloned().collect();
            if h.files_changed.len() > MAX_FILES_PER_HANDOFF {
                files.push(format!("... ({} more)", h.files_changed.len() - MAX_FILES_PER_HANDOFF));
            }
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

    if !state.active.is_empty() {
        parts.push(format!("\n## Currently Active Tasks ({})", state.active.len()));
        let mut ids: Vec<&String> = state.active.iter().collect();
        ids.sort();
        for id in ids {
            if let Some(task) = state.all_tasks.iter().find(|t| &t.id == id) {
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
        "Continue planning. Review handoffs and project state. \
         Rewrite your scratchpad and emit the next batch of tasks. \
         Return empty tasks array if all work is done."
            .to_string(),
    );

    if state.nudge_pending {
        state.nudge_pending = false;
        parts.push(NUDGE_MESSAGE.to_string());
    }

    parts.join("\n")
}

/// Normalize raw LLM tasks: fresh ids, dedup, team fallback
pub(crate) fn build_tasks_from_raw(raw_tasks: Vec<RawTask>, counter: &mut u32, dispatched: &HashSet<String>) -> Vec<Task> {
    let mut tasks: Vec<Task> = Vec::new();

    for raw in raw_tasks {
        if raw.description.trim().is_empty() {
            continue;
        }

        *counter += 1;
        let task_id = raw.id.clone().unwrap_or_else(|| format!("task-{:03}", counter));

        if dispatched.contains(&task_id) || tasks.iter().any(|t| t.id == task_id) {
            debug!(%task_id, "Skipping duplicate task ID");
            continue;
        }

        let team = raw.team.as_deref().and_then(Team::parse).unwrap_or(Team::Engineering);

        tasks.push(
            Task::new(task_id, raw.description)
                .with_scope(raw.scope)
                .with_acceptance(raw.acceptance.unwrap_or_default())
                .with_priority(raw.priority.unwrap_or(5))
                .with_team(team),
        );
    }

    tasks
}

/// Shrink an oversized conversation, preserving the system prompt, the
/// original request, and the recent tail
///
/// A synthetic user message bridges the gap with the scratchpad and
/// counters. No-op (hence idempotent) at or below the threshold.
pub(crate) fn compact_conversation(
    conversation: &mut Vec<ChatMessage>,
    scratchpad: &str,
    dispatched: usize,
    active: usize,
    handoffs: usize,
) {
    let total_chars: usize = conversation.iter().map(|m| m.content.len()).sum();
    if total_chars <= CONVERSATION_COMPACTION_CHARS {
        return;
    }

    warn!(
        total_chars,
        threshold = CONVERSATION_COMPACTION_CHARS,
        "Conversation compaction triggered"
    );

    let recent_start = conversation.len().saturating_sub(10);
    let recent: Vec<ChatMessage> = conversation[recent_start..].to_vec();

    let mut compacted = vec![conversation[0].clone()];
    if conversation.len() > 1 && recent_start > 1 {
        compacted.push(conversation[1].clone());
    }

    compacted.push(ChatMessage::user(format!(
        "[Context compacted — {} earlier messages removed. Current scratchpad: {}. \
         Total tasks dispatched: {}. Active tasks: {}. Total handoffs: {}.]",
        conversation.len() - recent.len(),
        scratchpad.chars().take(1000).collect::<String>(),
        dispatched,
        active,
        handoffs
    )));

    compacted.extend(recent);
    *conversation = compacted;

    info!(
        messages = conversation.len(),
        chars = conversation.iter().map(|m| m.content.len()).sum::<usize>(),
        "Conversation compacted"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HandoffStatus;
    use crate::llm::client::mock::MockLlmClient;
    use crate::prompts::PromptLoader;
    use tempfile::tempdir;

    fn make_planner(client: Arc<dyn LlmClient>, dir: &std::path::Path, max_workers: usize) -> Arc<Planner> {
        let pool = Arc::new(WorkerPool::new(
            client.clone(),
            dir.to_path_buf(),
            PromptLoader::embedded_only(),
            max_workers,
            None,
        ));
        let subplanner = Arc::new(Subplanner::new(
            client.clone(),
            Arc::clone(&pool),
            dir.to_path_buf(),
            "subplanner prompt".to_string(),
            None,
        ));
        Arc::new(Planner::new(
            client,
            pool,
            Some(subplanner),
            dir.to_path_buf(),
            "planner prompt".to_string(),
            100,
            None,
        ))
    }

    fn worker_json(path: &str, content: &str) -> String {
        serde_json::json!({
            "handoff": {"status": "complete", "summary": "done", "files_changed": [path]},
            "file_operations": [{"path": path, "content": content}]
        })
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_first_plan_terminates_immediately() {
        let temp = tempdir().unwrap();
        let client = Arc::new(MockLlmClient::from_contents(&[
            r#"{"scratchpad": "nothing", "tasks": []}"#,
        ]));
        let planner = make_planner(client.clone(), temp.path(), 10);

        let report = planner.run_loop("").await;

        assert_eq!(report.iterations, 1);
        assert_eq!(report.dispatched, 0);
        assert!(report.handoffs.is_empty());
        assert_eq!(client.call_count(), 1);
        assert!(crate::project::snapshot(temp.path()).file_tree.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_atomic_task_end_to_end() {
        let temp = tempdir().unwrap();
        let plan = serde_json::json!({
            "scratchpad": "one file",
            "tasks": [{"id": "t1", "description": "create main", "scope": ["main.py"]}]
        })
        .to_string();
        let client = Arc::new(MockLlmClient::from_contents(&[
            &plan,
            &worker_json("main.py", "print(\"hi\")\n"),
            r#"{"tasks": []}"#,
        ]));
        let planner = make_planner(client.clone(), temp.path(), 10);

        let report = planner.run_loop("make a hello world").await;

        assert_eq!(report.dispatched, 1);
        assert_eq!(report.handoffs.len(), 1);
        assert_eq!(report.handoffs[0].task_id, "t1");
        assert_eq!(report.handoffs[0].status, HandoffStatus::Complete);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("main.py")).unwrap(),
            "print(\"hi\")\n"
        );
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nudge_budget_exhausts_then_terminates() {
        let temp = tempdir().unwrap();
        let plan = serde_json::json!({
            "tasks": [{"id": "t1", "description": "write spec", "scope": ["SPEC.md"], "team": "product"}]
        })
        .to_string();
        let empty = r#"{"tasks": []}"#;
        // SPEC.md is not a source file, so each empty plan triggers a nudge
        // until the budget runs out.
        let client = Arc::new(MockLlmClient::from_contents(&[
            &plan,
            &worker_json("SPEC.md", "# Spec\n"),
            empty,
            empty,
            empty,
            empty,
        ]));
        let planner = make_planner(client.clone(), temp.path(), 10);

        let report = planner.run_loop("make something").await;

        // 1 task plan + 1 worker call + (MAX_EMPTY_PLAN_NUDGES + 1) empty plans.
        assert_eq!(client.call_count(), 2 + (MAX_EMPTY_PLAN_NUDGES as usize) + 1);
        assert_eq!(report.dispatched, 1);
        assert!(temp.path().join("SPEC.md").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_plan_with_source_files_terminates_without_nudge() {
        let temp = tempdir().unwrap();
        let plan = serde_json::json!({
            "tasks": [{"id": "t1", "description": "create main", "scope": ["main.py"]}]
        })
        .to_string();
        let client = Arc::new(MockLlmClient::from_contents(&[
            &plan,
            &worker_json("main.py", "x = 1\n"),
            r#"{"tasks": []}"#,
        ]));
        let planner = make_planner(client.clone(), temp.path(), 10);

        planner.run_loop("build it").await;

        // No nudge iterations: main.py counts as source output.
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_never_plans() {
        let temp = tempdir().unwrap();
        let client = Arc::new(MockLlmClient::from_contents(&[r#"{"tasks": []}"#]));
        let planner = make_planner(client.clone(), temp.path(), 0);

        let run = {
            let planner = Arc::clone(&planner);
            tokio::spawn(async move { planner.run_loop("anything").await })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        planner.stop();
        let report = run.await.unwrap();

        assert_eq!(client.call_count(), 0);
        assert_eq!(report.iterations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_tasks_dispatch_before_planning() {
        let temp = tempdir().unwrap();
        let client = Arc::new(MockLlmClient::from_contents(&[
            r#"{"tasks": []}"#,
            &worker_json("main.py", "fixed = True\n"),
            r#"{"tasks": []}"#,
        ]));
        let planner = make_planner(client.clone(), temp.path(), 10);

        planner.inject_tasks(vec![
            Task::new("fix-1", "repair the thing").with_scope(vec!["main.py".to_string()]),
        ]);

        let report = planner.run_loop("build it").await;

        assert_eq!(report.dispatched, 1);
        assert_eq!(report.handoffs.len(), 1);
        assert_eq!(report.handoffs[0].task_id, "fix-1");
        assert!(temp.path().join("main.py").exists());
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_planner_abort_after_consecutive_errors() {
        let temp = tempdir().unwrap();
        let replies: Vec<crate::llm::client::mock::MockReply> = (0..MAX_CONSECUTIVE_ERRORS)
            .map(|_| crate::llm::client::mock::MockReply::Fail("down".to_string()))
            .collect();
        let client = Arc::new(MockLlmClient::new(replies));
        let planner = make_planner(client.clone(), temp.path(), 10);

        let report = planner.run_loop("anything").await;

        assert_eq!(client.call_count(), MAX_CONSECUTIVE_ERRORS as usize);
        assert_eq!(report.iterations, 0);
        assert_eq!(report.dispatched, 0);
    }

    #[test]
    fn test_build_tasks_skips_blank_descriptions() {
        let mut counter = 0;
        let raw = vec![
            RawTask {
                description: "  ".to_string(),
                ..RawTask::default()
            },
            RawTask {
                description: "real".to_string(),
                ..RawTask::default()
            },
        ];

        let tasks = build_tasks_from_raw(raw, &mut counter, &HashSet::new());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "task-001");
    }

    #[test]
    fn test_build_tasks_dedups_and_defaults() {
        let mut counter = 0;
        let mut dispatched = HashSet::new();
        dispatched.insert("seen".to_string());

        let raw = vec![
            RawTask {
                id: Some("seen".to_string()),
                description: "already dispatched".to_string(),
                ..RawTask::default()
            },
            RawTask {
                id: Some("new".to_string()),
                description: "fresh".to_string(),
                team: Some("marketing".to_string()),
                ..RawTask::default()
            },
            RawTask {
                id: Some("new".to_string()),
                description: "same id again".to_string(),
                ..RawTask::default()
            },
        ];

        let tasks = build_tasks_from_raw(raw, &mut counter, &dispatched);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "new");
        // Unknown team tag falls back to engineering; missing priority is 5.
        assert_eq!(tasks[0].team, Team::Engineering);
        assert_eq!(tasks[0].priority, 5);
    }

    #[test]
    fn test_tree_delta_is_symmetric_difference() {
        let prev: HashSet<String> = ["a.py", "b.py", "c.py"].iter().map(|s| s.to_string()).collect();
        let current = vec!["b.py".to_string(), "c.py".to_string(), "d.py".to_string()];

        let (new_files, removed) = tree_delta(&prev, &current);
        assert_eq!(new_files, vec!["d.py"]);
        assert_eq!(removed, vec!["a.py"]);

        let mut sym: Vec<String> = new_files.into_iter().chain(removed).collect();
        sym.sort();
        assert_eq!(sym, vec!["a.py", "d.py"]);
    }

    #[test]
    fn test_tree_delta_no_changes() {
        let prev: HashSet<String> = ["a.py".to_string()].into_iter().collect();
        let (new_files, removed) = tree_delta(&prev, &["a.py".to_string()]);
        assert!(new_files.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_compact_conversation_noop_below_threshold() {
        let mut conversation = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
        ];
        let before = conversation.len();

        compact_conversation(&mut conversation, "sp", 1, 0, 1);
        assert_eq!(conversation.len(), before);

        // Idempotent below the threshold.
        compact_conversation(&mut conversation, "sp", 1, 0, 1);
        assert_eq!(conversation.len(), before);
    }

    #[test]
    fn test_compact_conversation_preserves_anchors_and_tail() {
        let mut conversation = vec![ChatMessage::system("sys"), ChatMessage::user("the original request")];
        for i in 0..30 {
            conversation.push(ChatMessage::user("x".repeat(10_000)));
            conversation.push(ChatMessage::assistant(format!("reply {}", i)));
        }

        compact_conversation(&mut conversation, "my scratchpad", 7, 2, 5);

        // system + first user + bridge + last 10.
        assert_eq!(conversation.len(), 13);
        assert_eq!(conversation[0].content, "sys");
        assert_eq!(conversation[1].content, "the original request");
        assert!(conversation[2].content.contains("Context compacted"));
        assert!(conversation[2].content.contains("my scratchpad"));
        assert!(conversation[2].content.contains("dispatched: 7"));
        assert_eq!(conversation.last().unwrap().content, "reply 29");
    }

    #[test]
    fn test_nudge_message_appended_once() {
        let mut state = LoopState {
            conversation: Vec::new(),
            scratchpad: String::new(),
            all_handoffs: Vec::new(),
            handoffs_since_plan: Vec::new(),
            active: HashSet::new(),
            dispatched_ids: HashSet::new(),
            all_tasks: Vec::new(),
            task_counter: 0,
            prev_file_tree: HashSet::new(),
            nudge_pending: true,
        };

        let msg = build_follow_up_message(&mut state, &[]);
        assert!(msg.contains("PROJECT INCOMPLETE"));
        assert!(!state.nudge_pending);

        let msg2 = build_follow_up_message(&mut state, &[]);
        assert!(!msg2.contains("PROJECT INCOMPLETE"));
    }

    #[test]
    fn test_follow_up_message_condenses_handoffs() {
        let mut h = Handoff::new("t9", HandoffStatus::Partial, "s".repeat(1000));
        h.files_changed = (0..40).map(|i| format!("f{}.py", i)).collect();
        h.concerns = vec!["one".to_string(), "two".to_string()];

        let mut state = LoopState {
            conversation: Vec::new(),
            scratchpad: String::new(),
            all_handoffs: Vec::new(),
            handoffs_since_plan: vec![h],
            active: HashSet::new(),
            dispatched_ids: HashSet::new(),
            all_tasks: Vec::new(),
            task_counter: 0,
            prev_file_tree: HashSet::new(),
            nudge_pending: false,
        };

        let msg = build_follow_up_message(&mut state, &["a.py".to_string()]);
        assert!(msg.contains("### Task t9 — partial"));
        // Summary truncated to 400 chars plus ellipsis.
        assert!(msg.contains(&format!("Summary: {}...", "s".repeat(400))));
        assert!(msg.contains("... (10 more)"));
        assert!(msg.contains("Concerns: one; two"));
        assert!(msg.contains("### New files (1)"));
    }
}
