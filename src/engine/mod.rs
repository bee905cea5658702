//! Engine driver
//!
//! Wires the LLM client, worker pool, subplanner, planner, and reconciler
//! together, runs the planning loop to completion, then runs the post-build
//! validation recipe. The public contract: `run` always terminates, never
//! propagates component errors, and leaves the output directory holding
//! whatever the workers wrote.

use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{HandoffStatus, Team};
use crate::events::{EngineEvent, EventBus, EventType};
use crate::llm::{ChatMessage, LlmClient, create_client};
use crate::planner::{Planner, Subplanner};
use crate::project;
use crate::prompts::PromptLoader;
use crate::reconciler::Reconciler;
use crate::validation;
use crate::worker::WorkerPool;

const IDEA_EXPANSION_PROMPT: &str = "You are a product designer. The user gives you a short project idea. \
    Expand it into a clear, detailed specification in 1-2 paragraphs. \
    Include: what the project is, key features, the main user interactions, and what the end result looks like. \
    Be specific about colors, layout, and behavior. \
    \n\n\
    CRITICAL — Technology choices:\n\
    - If the user specifies a technology (tkinter, pygame, flask, HTML, etc.), you MUST use that exact technology. Do NOT substitute.\n\
    - If the user says 'tkinter', use tkinter. Do NOT change it to pygame.\n\
    - If the user says 'pygame', use pygame.\n\
    - If the user says 'HTML' or 'web', use HTML/JS/CSS.\n\
    - Only if NO technology is mentioned, suggest one: Python+pygame for games, HTML/JS/CSS for visual demos, Python+tkinter for desktop apps.\n\
    \n\
    IMPORTANT: All graphics must be drawn programmatically (shapes, code-defined colors). \
    NEVER mention external asset files (no .png, .ttf, .wav). \
    Respond with ONLY the expanded specification. No preamble.";

const LAUNCH_SCRIPT_PROMPT: &str = "You are a devops helper. You write Windows batch files. \
    Respond with ONLY the raw batch file content. No markdown fences. No explanation.";

/// Final accounting for a full engine run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub elapsed_secs: f64,
    pub tasks_dispatched: usize,
    pub tasks_completed: usize,
    pub total_tokens: u64,
    pub api_calls: u64,
}

/// The orchestrator: owns the wiring for one or more runs
pub struct Engine {
    config: Config,
    client: Arc<dyn LlmClient>,
    event_bus: Arc<EventBus>,
}

impl Engine {
    /// Build an engine with an HTTP client from configuration
    pub fn new(config: Config) -> Result<Self> {
        let client = create_client(&config.llm).context("Failed to create LLM client")?;
        Ok(Self::with_client(config, client))
    }

    /// Build an engine around an existing client (tests, custom transports)
    pub fn with_client(config: Config, client: Arc<dyn LlmClient>) -> Self {
        Self {
            config,
            client,
            event_bus: Arc::new(EventBus::new()),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Run the full build: plan to completion, then validate
    pub async fn run(&self, request: &str) -> Result<RunReport> {
        let start = Instant::now();
        let output_dir = self.config.engine.output_dir.clone();

        self.event_bus.emit(EngineEvent::new(EventType::EngineStarted));
        info!(model = %self.config.llm.model, max_workers = self.config.engine.max_workers, output_dir = %output_dir.display(), "Engine starting");

        // Each run starts from a clean output directory.
        if output_dir.exists() {
            tokio::fs::remove_dir_all(&output_dir)
                .await
                .context("Failed to clear output directory")?;
            info!("Cleared previous output directory");
        }
        tokio::fs::create_dir_all(&output_dir)
            .await
            .context("Failed to create output directory")?;

        let request = self.flesh_out_idea(request).await;
        self.event_bus.emit(
            EngineEvent::new(EventType::SpecCreated).with_data(serde_json::json!({"spec": request.clone()})),
        );
        info!(spec = %request.chars().take(500).collect::<String>(), "Specification ready");

        let prompts = PromptLoader::new(self.config.engine.prompts_dir.as_deref());

        let worker_pool = Arc::new(WorkerPool::new(
            Arc::clone(&self.client),
            output_dir.clone(),
            prompts.clone(),
            self.config.engine.max_workers,
            Some(Arc::clone(&self.event_bus)),
        ));

        let subplanner_prompt = prompts.load("subplanner")?;
        let root_prompt = prompts.load("root-planner")?;

        let subplanner = Arc::new(Subplanner::new(
            Arc::clone(&self.client),
            Arc::clone(&worker_pool),
            output_dir.clone(),
            subplanner_prompt,
            Some(Arc::clone(&self.event_bus)),
        ));

        let planner = Arc::new(Planner::new(
            Arc::clone(&self.client),
            worker_pool,
            Some(subplanner),
            output_dir.clone(),
            root_prompt,
            self.config.engine.max_planner_iterations,
            Some(Arc::clone(&self.event_bus)),
        ));

        let mut reconciler = None;
        let mut reconciler_task = None;
        if self.config.reconciler.enabled {
            let rec = Arc::new(Reconciler::new(
                Arc::clone(&self.client),
                prompts.load("reconciler")?,
                output_dir.clone(),
                Duration::from_secs(self.config.reconciler.interval_secs),
                Some(Arc::clone(&self.event_bus)),
            ));
            reconciler_task = Some(tokio::spawn(Arc::clone(&rec).run_periodic(Arc::clone(&planner))));
            reconciler = Some(rec);
        }

        let report = planner.run_loop(&request).await;

        // Teardown: flag first, then cancel and await the task, tolerating
        // the cancellation error.
        if let Some(ref rec) = reconciler {
            rec.stop();
        }
        if let Some(handle) = reconciler_task {
            handle.abort();
            let _ = handle.await;
        }

        let elapsed = start.elapsed().as_secs_f64();
        let completed = report
            .handoffs
            .iter()
            .filter(|h| h.status == HandoffStatus::Complete)
            .count();

        info!(
            elapsed_secs = elapsed,
            dispatched = report.dispatched,
            completed,
            tokens = self.client.total_tokens_used(),
            api_calls = self.client.total_requests(),
            "Build complete"
        );
        self.event_bus.emit(EngineEvent::new(EventType::BuildComplete).with_data(serde_json::json!({
            "time": elapsed,
            "tasks_dispatched": report.dispatched,
            "tasks_completed": completed,
            "tokens": self.client.total_tokens_used(),
            "api_calls": self.client.total_requests(),
        })));

        self.generate_launch_script().await;

        let engineering_prompt = prompts.team_prompt(Team::Engineering);
        validation::run_post_build_validation(
            &self.client,
            &output_dir,
            &engineering_prompt,
            Some(&self.event_bus),
        )
        .await;

        let total_elapsed = start.elapsed().as_secs_f64();
        self.event_bus.emit(EngineEvent::new(EventType::EngineDone).with_data(serde_json::json!({
            "total_time": total_elapsed,
            "total_tokens": self.client.total_tokens_used(),
        })));

        Ok(RunReport {
            elapsed_secs: total_elapsed,
            tasks_dispatched: report.dispatched,
            tasks_completed: completed,
            total_tokens: self.client.total_tokens_used(),
            api_calls: self.client.total_requests(),
        })
    }

    /// Expand a terse idea into a detailed spec
    ///
    /// The expansion is only adopted when it is substantially longer than
    /// the input; any failure falls back to the raw request.
    async fn flesh_out_idea(&self, raw_idea: &str) -> String {
        let messages = vec![
            ChatMessage::system(IDEA_EXPANSION_PROMPT),
            ChatMessage::user(raw_idea),
        ];

        match self.client.complete(&messages).await {
            Ok(response) => {
                let expanded = response.content.trim().to_string();
                if expanded.len() as f64 > raw_idea.len() as f64 * 1.5 && expanded.len() > 100 {
                    expanded
                } else {
                    raw_idea.to_string()
                }
            }
            Err(e) => {
                warn!(error = %e, "Idea expansion failed, using raw input");
                raw_idea.to_string()
            }
        }
    }

    /// Ask the LLM for a launch.bat that starts the project hands-free
    async fn generate_launch_script(&self) {
        let output_dir = &self.config.engine.output_dir;
        let state = project::snapshot(output_dir);
        let contents = project::read_contents(output_dir, &state.file_tree, project::MAX_FILE_CONTENT_CHARS);

        let mut contents_str = String::new();
        for (path, content) in &contents {
            contents_str.push_str(&format!("\n### {}\n```\n{}\n```\n", path, content));
        }
        let tree = if state.file_tree.is_empty() {
            "(empty)".to_string()
        } else {
            state.file_tree.join("\n")
        };

        let user_msg = format!(
            "Write a Windows batch file called launch.bat that launches this project with ZERO human intervention.\n\n\
             Rules:\n\
             - The bat file lives in the project root directory (same folder as the files listed below)\n\
             - It should install any dependencies first (pip install -r requirements.txt if it exists, or pip install specific packages)\n\
             - Then launch the main entry point of the project\n\
             - For Python projects: use `python main.py` or `python -m package_name` as appropriate\n\
             - For HTML/JS projects: use `start index.html` to open in browser, OR if it needs a server use `python -m http.server 8000` then `start http://localhost:8000`\n\
             - Include `@echo off` at the top\n\
             - Include `pause` at the end so the window stays open if there are errors\n\
             - If the project uses pygame, try `pip install pygame-ce` as fallback if `pip install pygame` fails\n\
             - Keep it simple and robust\n\n\
             ## Project File Tree\n{}\n\n\
             ## Project Files\n{}\n",
            tree, contents_str
        );

        let messages = vec![ChatMessage::system(LAUNCH_SCRIPT_PROMPT), ChatMessage::user(user_msg)];

        match self.client.complete(&messages).await {
            Ok(response) => {
                let mut bat = response.content.trim().to_string();
                if bat.starts_with("```") {
                    let mut lines: Vec<&str> = bat.lines().collect();
                    if lines.last().map(|l| l.trim()) == Some("```") {
                        lines.pop();
                    }
                    if !lines.is_empty() {
                        lines.remove(0);
                    }
                    bat = lines.join("\n");
                }

                let path = output_dir.join("launch.bat");
                match tokio::fs::write(&path, bat).await {
                    Ok(()) => info!(path = %path.display(), "Created launch script"),
                    Err(e) => warn!(error = %e, "Could not write launch.bat"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to generate launch.bat");
            }
        }
    }
}
