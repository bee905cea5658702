//! Worker pool - bounded-concurrency executor of leaf tasks
//!
//! Each task becomes one LLM call whose parsed response is a list of
//! full-file writes plus a handoff. A shared semaphore bounds concurrent
//! calls; the subplanner dispatches through the same pool, so the global
//! in-flight worker call count never exceeds `max_workers`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use handlebars::Handlebars;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::domain::{Handoff, HandoffMetrics, HandoffStatus, Task, is_asset_path};
use crate::events::{EngineEvent, EventBus, EventType};
use crate::llm::{ChatMessage, CompletionResponse, LlmClient};
use crate::parse::parse_worker_response;
use crate::project::{self, MAX_FILE_CONTENT_CHARS};
use crate::prompts::PromptLoader;

/// Sleep before the single rate-limit retry
const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Appended to every team system prompt so workers know the response format.
pub const WORKER_RESPONSE_FORMAT: &str = r#"
---

## Output Format

You MUST respond with a single JSON object. No surrounding text, no markdown fences around the outer JSON.

```
{
  "handoff": {
    "status": "complete | partial | blocked | failed",
    "summary": "What you did. 2-4 sentences.",
    "files_changed": ["path/to/file1.py", "path/to/file2.py"],
    "concerns": ["Any risks or issues discovered"],
    "suggestions": ["Ideas for follow-up work"]
  },
  "file_operations": [
    {
      "path": "relative/path/from/project/root.py",
      "content": "FULL file content here. Not a diff. Not a patch. The COMPLETE file."
    }
  ]
}
```

CRITICAL RULES:
- file_operations contains the COMPLETE content of every file you create or modify.
- Path is relative to the project root (e.g., "src/main.py", NOT an absolute path).
- Include ALL files you want to create or modify. Files not listed are left unchanged.
- Content must be the ENTIRE file, not a diff or partial snippet.
- You CANNOT delete files. If a file should be removed, mention it in concerns.
- Output ONLY this JSON object. No explanations before or after it.
- NEVER create asset files (.png, .jpg, .ttf, .wav, etc.). All graphics must be code-drawn.

JSON ENCODING — VERY IMPORTANT:
- The "content" field contains source code with newlines. You MUST use proper JSON escaping.
- Newlines in code MUST be encoded as \n (backslash-n), NOT literal line breaks inside the JSON string.
- Quotes inside code MUST be escaped as \" (backslash-quote).
- Backslashes in code MUST be escaped as \\ (double backslash).
- Tab characters MUST be encoded as \t.
- The entire JSON must be valid — parseable by a strict JSON parser.
- Do NOT wrap the JSON in markdown code fences (no ```json ... ```). Output raw JSON only.
"#;

/// The fixed worker user message template (handlebars)
const WORKER_USER_TEMPLATE: &str = r#"## Task: {{task_id}}

**Team:** {{team}}
**Description:** {{description}}

**Scope (files to focus on):** {{scope}}

**Acceptance criteria:** {{acceptance}}

## Current Project File Tree
{{file_tree}}

## IMPORTANT CONTEXT: All Existing File Contents

Below are the contents of ALL existing project files. Use these to:
- Verify what constants, functions, and classes already exist
- Use the EXACT import paths and names defined here
- Do NOT redefine constants that already exist — import them instead
- Use relative imports for intra-package references (e.g., `from .constants import ...`)

{{#if files}}{{#each files}}
### {{path}}
```
{{content}}
```
{{/each}}{{else}}(no files in project yet){{/if}}

---

Complete this task. Respond with ONLY the JSON object containing your file_operations and handoff as specified in your system instructions.
Include the FULL content of every file you create or modify.
NEVER create any external asset files (.png, .jpg, .ttf, .wav, etc.). Use programmatic alternatives.
"#;

#[derive(Serialize)]
struct FileBlock {
    path: String,
    content: String,
}

#[derive(Serialize)]
struct WorkerMessageContext {
    task_id: String,
    team: String,
    description: String,
    scope: String,
    acceptance: String,
    file_tree: String,
    files: Vec<FileBlock>,
}

/// Dispatch tasks as parallel LLM calls and apply the resulting file writes
pub struct WorkerPool {
    client: Arc<dyn LlmClient>,
    output_dir: PathBuf,
    prompts: PromptLoader,
    semaphore: Semaphore,
    max_workers: usize,
    active: AtomicUsize,
    hbs: Handlebars<'static>,
    event_bus: Option<Arc<EventBus>>,
}

impl WorkerPool {
    pub fn new(
        client: Arc<dyn LlmClient>,
        output_dir: PathBuf,
        prompts: PromptLoader,
        max_workers: usize,
        event_bus: Option<Arc<EventBus>>,
    ) -> Self {
        debug!(?output_dir, max_workers, "WorkerPool::new: called");
        let mut hbs = Handlebars::new();
        hbs.register_escape_fn(handlebars::no_escape);
        Self {
            client,
            output_dir,
            prompts,
            semaphore: Semaphore::new(max_workers),
            max_workers,
            active: AtomicUsize::new(0),
            hbs,
            event_bus,
        }
    }

    /// Number of tasks currently holding a worker slot
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether a new plan batch could start running right now
    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_workers
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.emit(event);
        }
    }

    /// Acquire a slot, run one LLM call, apply file operations, return the
    /// handoff
    ///
    /// Never returns an error: every failure mode becomes a failed handoff.
    pub async fn execute_task(&self, task: &Task) -> Handoff {
        debug!(task_id = %task.id, "execute_task: waiting for slot");
        let Ok(_permit) = self.semaphore.acquire().await else {
            return Handoff::failure(&task.id, "Worker pool is shut down", 0);
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(task_id = %task.id, active = self.active_count(), "execute_task: slot acquired");
        let handoff = self.execute_single(task).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        handoff
    }

    async fn execute_single(&self, task: &Task) -> Handoff {
        let start = Instant::now();

        let mut system_prompt = self.prompts.team_prompt(task.team);
        system_prompt.push_str(WORKER_RESPONSE_FORMAT);

        // Full project context, not just scope files: workers constantly
        // need constants and helpers defined by other tasks.
        let state = project::snapshot(&self.output_dir);
        let contents = project::read_contents(&self.output_dir, &state.file_tree, MAX_FILE_CONTENT_CHARS);

        let user_prompt = match self.build_worker_prompt(task, &state.file_tree, contents) {
            Ok(p) => p,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Worker prompt rendering failed");
                return Handoff::failure(&task.id, format!("Worker failed: {}", e), elapsed_ms(start));
            }
        };

        let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)];

        info!(
            task_id = %task.id,
            team = %task.team,
            scope = task.scope.len(),
            context_files = state.file_tree.len(),
            "Worker starting task"
        );
        self.emit(
            EngineEvent::new(EventType::TaskStarted)
                .with_task(&task.id)
                .with_team(task.team.as_str()),
        );

        match self.client.complete(&messages).await {
            Ok(response) => self.finish(task, &response, start).await,
            Err(e) if e.is_rate_limit() => {
                warn!(task_id = %task.id, "Rate-limited, retrying after backoff");
                tokio::time::sleep(RATE_LIMIT_RETRY_DELAY).await;
                match self.client.complete(&messages).await {
                    Ok(response) => self.finish(task, &response, start).await,
                    Err(e2) => self.failure(task, start, &e2.to_string()),
                }
            }
            Err(e) => self.failure(task, start, &e.to_string()),
        }
    }

    /// Parse the response, write files, fill in metrics
    async fn finish(&self, task: &Task, response: &CompletionResponse, start: Instant) -> Handoff {
        let mut result = parse_worker_response(&response.content, &task.id);

        let (files_created, files_modified, write_failures) =
            self.apply_operations(&task.id, &result.file_operations).await;

        if write_failures > 0 && result.handoff.status == HandoffStatus::Complete {
            result.handoff.status = HandoffStatus::Partial;
            result
                .handoff
                .concerns
                .push(format!("{} file writes failed on disk", write_failures));
        }

        result.handoff.metrics = HandoffMetrics {
            tokens_used: response.total_tokens,
            duration_ms: elapsed_ms(start),
            files_created,
            files_modified,
        };

        info!(
            task_id = %task.id,
            status = %result.handoff.status,
            files = result.file_operations.len(),
            tokens = response.total_tokens,
            duration_ms = result.handoff.metrics.duration_ms,
            "Worker completed task"
        );

        self.emit(
            EngineEvent::new(EventType::TaskCompleted)
                .with_task(&task.id)
                .with_status(result.handoff.status.as_str())
                .with_data(serde_json::json!({
                    "summary": result.handoff.summary.chars().take(200).collect::<String>(),
                    "files": result.file_operations.len(),
                    "tokens": response.total_tokens,
                    "duration_ms": result.handoff.metrics.duration_ms,
                })),
        );

        result.handoff
    }

    /// Write each file operation, classifying created vs modified
    ///
    /// Asset extensions and escaping paths are rejected with a log entry.
    /// A failed write skips the operation rather than failing the task.
    async fn apply_operations(&self, task_id: &str, ops: &[crate::domain::FileOperation]) -> (u64, u64, u64) {
        let mut created = 0;
        let mut modified = 0;
        let mut failures = 0;

        for op in ops {
            if is_asset_path(&op.path) {
                warn!(%task_id, path = %op.path, "Blocked asset file creation");
                continue;
            }
            if op.path.starts_with('/') || op.path.split('/').any(|part| part == "..") {
                warn!(%task_id, path = %op.path, "Blocked path escaping the project root");
                continue;
            }

            let target = self.output_dir.join(&op.path);
            let existed = target.exists();

            if let Some(parent) = target.parent()
                && let Err(e) = tokio::fs::create_dir_all(parent).await
            {
                warn!(%task_id, path = %op.path, error = %e, "Could not create parent directory");
                failures += 1;
                continue;
            }

            match tokio::fs::write(&target, &op.content).await {
                Ok(()) => {
                    if existed {
                        modified += 1;
                    } else {
                        created += 1;
                    }
                    debug!(%task_id, path = %op.path, existed, "apply_operations: wrote file");
                }
                Err(e) => {
                    warn!(%task_id, path = %op.path, error = %e, "File write failed");
                    failures += 1;
                }
            }
        }

        (created, modified, failures)
    }

    fn build_worker_prompt(
        &self,
        task: &Task,
        file_tree: &[String],
        contents: std::collections::BTreeMap<String, String>,
    ) -> eyre::Result<String> {
        let context = WorkerMessageContext {
            task_id: task.id.clone(),
            team: task.team.as_str().to_string(),
            description: task.description.clone(),
            scope: if task.scope.is_empty() {
                "(no specific scope)".to_string()
            } else {
                task.scope.join(", ")
            },
            acceptance: task.acceptance.clone(),
            file_tree: if file_tree.is_empty() {
                "(empty project)".to_string()
            } else {
                file_tree.join("\n")
            },
            files: contents
                .into_iter()
                .map(|(path, content)| FileBlock { path, content })
                .collect(),
        };

        self.hbs
            .render_template(WORKER_USER_TEMPLATE, &context)
            .map_err(|e| eyre::eyre!("Template render failed: {}", e))
    }

    fn failure(&self, task: &Task, start: Instant, error: &str) -> Handoff {
        tracing::error!(task_id = %task.id, %error, "Worker failed");
        let handoff = Handoff::failure(&task.id, format!("Worker failed: {}", error), elapsed_ms(start));
        self.emit(
            EngineEvent::new(EventType::TaskCompleted)
                .with_task(&task.id)
                .with_status(handoff.status.as_str()),
        );
        handoff
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::{MockLlmClient, MockReply};
    use tempfile::tempdir;

    fn pool_with(client: Arc<dyn LlmClient>, dir: &std::path::Path, max_workers: usize) -> WorkerPool {
        WorkerPool::new(
            client,
            dir.to_path_buf(),
            PromptLoader::embedded_only(),
            max_workers,
            None,
        )
    }

    fn worker_json(path: &str, content: &str) -> String {
        serde_json::json!({
            "handoff": {
                "status": "complete",
                "summary": "wrote the file",
                "files_changed": [path],
                "concerns": [],
                "suggestions": []
            },
            "file_operations": [{"path": path, "content": content}]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_execute_task_writes_file() {
        let temp = tempdir().unwrap();
        let client = Arc::new(MockLlmClient::from_contents(&[&worker_json("main.py", "print('hi')\n")]));
        let pool = pool_with(client, temp.path(), 2);

        let task = Task::new("t1", "create main").with_scope(vec!["main.py".to_string()]);
        let handoff = pool.execute_task(&task).await;

        assert_eq!(handoff.status, HandoffStatus::Complete);
        assert_eq!(handoff.metrics.files_created, 1);
        assert_eq!(handoff.metrics.files_modified, 0);
        assert_eq!(handoff.metrics.tokens_used, 100);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("main.py")).unwrap(),
            "print('hi')\n"
        );
    }

    #[tokio::test]
    async fn test_execute_task_classifies_modified() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("main.py"), "old").unwrap();

        let client = Arc::new(MockLlmClient::from_contents(&[&worker_json("main.py", "new")]));
        let pool = pool_with(client, temp.path(), 2);

        let handoff = pool.execute_task(&Task::new("t1", "update main")).await;

        assert_eq!(handoff.metrics.files_created, 0);
        assert_eq!(handoff.metrics.files_modified, 1);
        assert_eq!(std::fs::read_to_string(temp.path().join("main.py")).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_execute_task_creates_parent_dirs() {
        let temp = tempdir().unwrap();
        let client = Arc::new(MockLlmClient::from_contents(&[&worker_json("src/deep/mod.py", "x = 1")]));
        let pool = pool_with(client, temp.path(), 2);

        pool.execute_task(&Task::new("t1", "nested file")).await;

        assert!(temp.path().join("src/deep/mod.py").exists());
    }

    #[tokio::test]
    async fn test_asset_writes_blocked() {
        let temp = tempdir().unwrap();
        let client = Arc::new(MockLlmClient::from_contents(&[&worker_json("sprite.png", "fake png")]));
        let pool = pool_with(client, temp.path(), 2);

        let handoff = pool.execute_task(&Task::new("t1", "draw sprite")).await;

        assert!(!temp.path().join("sprite.png").exists());
        assert_eq!(handoff.metrics.files_created, 0);
    }

    #[tokio::test]
    async fn test_escaping_paths_blocked() {
        let temp = tempdir().unwrap();
        let client = Arc::new(MockLlmClient::from_contents(&[&worker_json("../outside.py", "bad")]));
        let pool = pool_with(client, temp.path(), 2);

        pool.execute_task(&Task::new("t1", "escape")).await;

        assert!(!temp.path().parent().unwrap().join("outside.py").exists());
    }

    #[tokio::test]
    async fn test_llm_failure_returns_failed_handoff() {
        let temp = tempdir().unwrap();
        let client = Arc::new(MockLlmClient::new(vec![MockReply::Fail("boom".to_string())]));
        let pool = pool_with(client, temp.path(), 2);

        let handoff = pool.execute_task(&Task::new("t1", "doomed")).await;

        assert_eq!(handoff.status, HandoffStatus::Failed);
        assert!(!handoff.concerns.is_empty());
        assert!(handoff.summary.contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retries_once_then_succeeds() {
        let temp = tempdir().unwrap();
        let client = Arc::new(MockLlmClient::new(vec![
            MockReply::RateLimited,
            MockReply::Content(worker_json("main.py", "ok")),
        ]));
        let pool = pool_with(client.clone(), temp.path(), 2);

        let handoff = pool.execute_task(&Task::new("t1", "retry me")).await;

        assert_eq!(handoff.status, HandoffStatus::Complete);
        assert_eq!(client.call_count(), 2);
        assert!(temp.path().join("main.py").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_twice_fails() {
        let temp = tempdir().unwrap();
        let client = Arc::new(MockLlmClient::new(vec![MockReply::RateLimited, MockReply::RateLimited]));
        let pool = pool_with(client.clone(), temp.path(), 2);

        let handoff = pool.execute_task(&Task::new("t1", "still limited")).await;

        assert_eq!(handoff.status, HandoffStatus::Failed);
        assert_eq!(client.call_count(), 2);
        assert!(handoff.summary.contains("Rate limited"));
    }

    #[tokio::test]
    async fn test_malformed_response_salvaged_to_partial() {
        let temp = tempdir().unwrap();
        // Literal newline in the first op, second op truncated mid-string;
        // truncation repair cannot close this, so salvage takes over.
        let malformed = "{\"handoff\": {\"summary\": \"s\"}, \"file_operations\": [{\"path\": \"main.py\", \"content\": \"a = 1\nb = 2\"}, {\"path\": \"cut.py\", \"content\": \"oops";
        let client = Arc::new(MockLlmClient::from_contents(&[malformed]));
        let pool = pool_with(client, temp.path(), 2);

        let handoff = pool.execute_task(&Task::new("t1", "salvage me")).await;

        assert_eq!(handoff.status, HandoffStatus::Partial);
        assert!(handoff.concerns.iter().any(|c| c.contains("malformed")));
        assert_eq!(
            std::fs::read_to_string(temp.path().join("main.py")).unwrap(),
            "a = 1\nb = 2"
        );
    }

    #[tokio::test]
    async fn test_semaphore_bounds_concurrency() {
        use async_trait::async_trait;
        use std::sync::atomic::AtomicUsize;

        struct CountingClient {
            current: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl LlmClient for CountingClient {
            async fn complete_with(
                &self,
                _messages: &[ChatMessage],
                _overrides: crate::llm::CompletionOverrides,
            ) -> Result<CompletionResponse, crate::llm::LlmError> {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                Ok(CompletionResponse::from_content(
                    r#"{"handoff": {"status": "complete", "summary": "ok"}, "file_operations": []}"#,
                ))
            }
        }

        let temp = tempdir().unwrap();
        let client = Arc::new(CountingClient {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = Arc::new(pool_with(client.clone(), temp.path(), 3));

        let mut handles = Vec::new();
        for i in 0..10 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.execute_task(&Task::new(format!("t{}", i), "concurrent")).await
            }));
        }
        for handle in handles {
            let handoff = handle.await.unwrap();
            assert_eq!(handoff.status, HandoffStatus::Complete);
        }

        assert!(client.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn test_response_format_contract_pins_shape() {
        // The parser is written against exactly this contract.
        assert!(WORKER_RESPONSE_FORMAT.contains("\"handoff\""));
        assert!(WORKER_RESPONSE_FORMAT.contains("\"file_operations\""));
        assert!(WORKER_RESPONSE_FORMAT.contains("complete | partial | blocked | failed"));
    }
}
