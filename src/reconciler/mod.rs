//! Reconciler - periodic structural sweep of the generated project
//!
//! Every interval it scans the output directory for things workers are told
//! never to do (asset files, empty files, placeholder markers, asset-loading
//! code, bare intra-package imports) and asks the LLM for a handful of fix
//! tasks, which are injected into the planner's next tick. Sweep failures
//! are logged and swallowed; the loop always continues.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::domain::{Task, Team, extension_of, is_asset_path};
use crate::events::{EngineEvent, EventBus, EventType};
use crate::llm::{ChatMessage, LlmClient};
use crate::parse::parse_task_array;
use crate::planner::Planner;
use crate::project::{self, MAX_FILE_CONTENT_CHARS};

/// At most this many fix tasks are injected per sweep.
pub const MAX_FIX_TASKS: usize = 5;

/// At most this many issues are shown to the LLM per sweep.
const MAX_ISSUES_IN_PROMPT: usize = 20;

/// Extensions worth scanning line-by-line.
const SCANNED_SOURCE_EXTENSIONS: &[&str] = &[
    ".py", ".ts", ".js", ".tsx", ".jsx", ".java", ".rs", ".go", ".c", ".cpp", ".h",
];

/// Patterns that indicate asset file loading in code.
static ASSET_LOAD_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"pygame\.image\.load\s*\(").expect("image pattern"),
        Regex::new(r#"(?i)pygame\.font\.Font\s*\(\s*["'][^"']+\.(ttf|otf|woff)"#).expect("font pattern"),
        Regex::new(r"pygame\.mixer\.\w+\.load\s*\(").expect("mixer pattern"),
        Regex::new(r#"(?i)open\s*\([^)]*\.(png|jpg|jpeg|gif|bmp|svg|ttf|wav|mp3|ogg)"#).expect("open pattern"),
    ]
});

/// Common stdlib module names; bare imports of these are fine.
const STDLIB_MODULES: &[&str] = &[
    "os", "sys", "re", "json", "math", "random", "time", "datetime", "pathlib", "collections", "itertools",
    "functools", "typing", "abc", "io", "copy", "enum", "dataclasses", "logging", "unittest", "argparse",
    "subprocess", "threading", "multiprocessing", "asyncio", "socket", "http", "urllib", "hashlib", "hmac",
    "secrets", "string", "textwrap", "struct", "csv", "configparser", "tempfile", "shutil", "glob", "fnmatch",
    "stat", "traceback", "warnings", "contextlib", "decimal", "fractions", "statistics", "pprint", "dis",
    "inspect", "importlib", "pkgutil", "platform", "signal", "queue", "heapq", "bisect", "array", "weakref",
    "types", "operator",
];

/// Common third-party packages (top-level import names).
const KNOWN_THIRD_PARTY: &[&str] = &[
    "pygame", "flask", "django", "fastapi", "numpy", "pandas", "scipy", "matplotlib", "requests", "httpx",
    "aiohttp", "sqlalchemy", "pydantic", "click", "rich", "pytest", "dotenv", "PIL", "cv2", "torch", "tensorflow",
    "sklearn", "celery", "redis", "boto3", "paramiko", "yaml", "toml", "bs4", "lxml", "jinja2", "werkzeug",
    "uvicorn", "gunicorn", "starlette", "anyio", "trio", "attr", "attrs",
];

/// Periodic sweep task generating reconciler fix tasks
pub struct Reconciler {
    client: Arc<dyn LlmClient>,
    system_prompt: String,
    output_dir: PathBuf,
    interval: Duration,
    running: AtomicBool,
    task_counter: AtomicU64,
    event_bus: Option<Arc<EventBus>>,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn LlmClient>,
        system_prompt: String,
        output_dir: PathBuf,
        interval: Duration,
        event_bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            client,
            system_prompt,
            output_dir,
            interval,
            running: AtomicBool::new(true),
            task_counter: AtomicU64::new(0),
            event_bus,
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.emit(event);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run sweeps on the configured interval until stopped
    ///
    /// The running flag is armed at construction, so a `stop()` that lands
    /// before this task first runs still wins.
    pub async fn run_periodic(self: Arc<Self>, planner: Arc<Planner>) {
        debug!(interval_secs = self.interval.as_secs(), "Reconciler started");

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.interval).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match self.sweep().await {
                Ok(fix_tasks) => {
                    if !fix_tasks.is_empty() {
                        info!(count = fix_tasks.len(), "Reconciler found issues, injecting fix tasks");
                        planner.inject_tasks(fix_tasks);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Reconciler sweep failed");
                }
            }
        }
        debug!("Reconciler stopped");
    }

    /// One sweep: scan, consult the LLM, return fix tasks
    pub async fn sweep(&self) -> eyre::Result<Vec<Task>> {
        let state = project::snapshot(&self.output_dir);
        if state.file_tree.is_empty() {
            return Ok(Vec::new());
        }

        let issues = self.scan_for_issues(&state.file_tree);
        if issues.is_empty() {
            debug!("Reconciler sweep: no issues found");
            return Ok(Vec::new());
        }

        self.emit(
            EngineEvent::new(EventType::ReconcilerIssue)
                .with_data(serde_json::json!({"issues": issues.len()})),
        );

        // Give the LLM the contents of every file an issue mentions.
        let problem_files: Vec<String> = state
            .file_tree
            .iter()
            .filter(|f| issues.iter().any(|issue| issue.contains(f.as_str())))
            .cloned()
            .collect();
        let contents = project::read_contents(&self.output_dir, &problem_files, MAX_FILE_CONTENT_CHARS);

        let mut context = String::new();
        for (path, content) in &contents {
            context.push_str(&format!("\n### {}\n```\n{}\n```\n", path, content));
        }

        let report = format_issue_report(state.file_tree.len(), &issues);
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user(format!("{}\n\n## File Contents\n{}", report, context)),
        ];

        let response = self.client.complete(&messages).await?;

        let raw_tasks = match parse_task_array(&response.content) {
            Ok(tasks) => tasks,
            Err(_) => {
                warn!("Reconciler could not parse fix tasks from LLM response");
                return Ok(Vec::new());
            }
        };

        let mut tasks: Vec<Task> = Vec::new();
        for raw in raw_tasks {
            if raw.description.trim().is_empty() {
                continue;
            }
            let n = self.task_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let task_id = raw.id.clone().unwrap_or_else(|| format!("fix-{:03}", n));
            tasks.push(
                Task::new(task_id, raw.description)
                    .with_scope(raw.scope)
                    .with_acceptance(
                        raw.acceptance
                            .unwrap_or_else(|| "Fix the identified issue".to_string()),
                    )
                    .with_priority(raw.priority.unwrap_or(1))
                    .with_team(Team::Engineering),
            );
        }

        tasks.truncate(MAX_FIX_TASKS);
        Ok(tasks)
    }

    /// Rule-based scan over the file tree
    fn scan_for_issues(&self, file_tree: &[String]) -> Vec<String> {
        let mut issues: Vec<String> = Vec::new();

        for rel_path in file_tree {
            if rel_path.starts_with("...") {
                continue;
            }

            let full = self.output_dir.join(rel_path);
            let ext = extension_of(rel_path);

            if is_asset_path(rel_path) {
                issues.push(format!(
                    "ASSET FILE VIOLATION: {} — external asset files are forbidden. Must be replaced with programmatic code.",
                    rel_path
                ));
                continue;
            }

            match std::fs::metadata(&full) {
                Ok(meta) if meta.is_file() && meta.len() == 0 => {
                    issues.push(format!("Empty file: {}", rel_path));
                    continue;
                }
                Ok(_) => {}
                Err(_) => continue,
            }

            if !SCANNED_SOURCE_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            let Ok(bytes) = std::fs::read(&full) else {
                continue;
            };
            let text = String::from_utf8_lossy(&bytes);

            let upper = text.to_uppercase();
            if text.contains("TODO: implement") || upper.contains("# TODO") {
                let count = upper.matches("TODO").count();
                issues.push(format!("Contains {} TODO markers: {}", count, rel_path));
            }

            if text.contains("pass  # placeholder") {
                issues.push(format!("Contains placeholder pass statements: {}", rel_path));
            }

            for pattern in ASSET_LOAD_PATTERNS.iter() {
                if let Some(m) = pattern.find(&text) {
                    issues.push(format!(
                        "ASSET LOADING in code: {} — found '{}'. Must use programmatic shapes/system fonts instead.",
                        rel_path,
                        m.as_str()
                    ));
                }
            }

            if ext == ".py" {
                self.scan_bare_imports(rel_path, &full, &text, &mut issues);
            }
        }

        issues
    }

    /// Flag non-relative imports of sibling modules inside a package
    fn scan_bare_imports(&self, rel_path: &str, full: &std::path::Path, text: &str, issues: &mut Vec<String>) {
        let Some(parent) = full.parent() else {
            return;
        };
        if !parent.join("__init__.py").exists() {
            return;
        }

        for (line_no, line) in text.lines().enumerate() {
            let stripped = line.trim();
            let Some(rest) = stripped.strip_prefix("from ") else {
                continue;
            };
            let Some((module, _)) = rest.split_once(" import") else {
                continue;
            };
            let module = module.trim();

            if module.starts_with('.') || module.starts_with("__") {
                continue;
            }
            if STDLIB_MODULES.contains(&module) {
                continue;
            }
            let top_level = module.split('.').next().unwrap_or(module);
            if KNOWN_THIRD_PARTY.contains(&top_level) {
                continue;
            }

            let sibling_file = parent.join(format!("{}.py", module.replace('.', "/")));
            let sibling_pkg = parent.join(module).join("__init__.py");
            if sibling_file.exists() || sibling_pkg.exists() {
                issues.push(format!(
                    "BARE IMPORT in {}:{} — 'from {} import ...' should be 'from .{} import ...'. Use relative imports within packages.",
                    rel_path,
                    line_no + 1,
                    module,
                    module
                ));
            }
        }
    }
}

fn format_issue_report(file_count: usize, issues: &[String]) -> String {
    let listed: Vec<String> = issues
        .iter()
        .take(MAX_ISSUES_IN_PROMPT)
        .map(|i| format!("- {}", i))
        .collect();
    format!(
        "## Project Issues Detected\n\nFile tree has {} files.\n\n### Issues Found ({} total)\n{}\n\n\
         Generate targeted fix tasks as a JSON array. Include the NO ASSETS reminder in every fix task.",
        file_count,
        issues.len(),
        listed.join("\n")
    )
}
