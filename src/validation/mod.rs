//! Post-build validation recipe
//!
//! After the planner converges, the generated project gets a serial check:
//! install dependencies, import-check the entry point, run its tests, and
//! feed any errors back through the LLM for auto-fix. Every subprocess runs
//! under a wall-clock timeout. Nothing here is fatal; the project is left in
//! whatever state the fixes reached.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::domain::is_asset_path;
use crate::events::{EngineEvent, EventBus, EventType};
use crate::llm::{ChatMessage, LlmClient};
use crate::parse::parse_worker_response;
use crate::project::{self, MAX_FILE_CONTENT_CHARS};
use crate::worker::WORKER_RESPONSE_FORMAT;

/// Auto-fix attempts before giving up.
pub const MAX_VALIDATION_ROUNDS: u32 = 3;

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const TEST_TIMEOUT: Duration = Duration::from_secs(60);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);
const PYTHON: &str = "python3";

enum CommandOutcome {
    Finished { exit_code: i32, stdout: String, stderr: String },
    TimedOut,
}

async fn run_command(program: &str, args: &[&str], cwd: &Path, timeout: Duration) -> eyre::Result<CommandOutcome> {
    debug!(%program, ?args, ?cwd, timeout_secs = timeout.as_secs(), "run_command: called");
    let result = tokio::time::timeout(
        timeout,
        tokio::process::Command::new(program).args(args).current_dir(cwd).output(),
    )
    .await;

    match result {
        Ok(Ok(output)) => Ok(CommandOutcome::Finished {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Ok(CommandOutcome::TimedOut),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Run the full post-build recipe: install, check, test, auto-fix
pub async fn run_post_build_validation(
    client: &Arc<dyn LlmClient>,
    output_dir: &Path,
    engineering_prompt: &str,
    event_bus: Option<&Arc<EventBus>>,
) {
    if let Some(bus) = event_bus {
        bus.emit(EngineEvent::new(EventType::ValidationStarted));
    }

    install_dependencies(output_dir).await;

    for round in 1..=MAX_VALIDATION_ROUNDS {
        info!(round, max = MAX_VALIDATION_ROUNDS, "Validation round");

        let mut errors: Vec<String> = Vec::new();

        match find_entry_point(output_dir) {
            Some(entry) => {
                info!(%entry, "Running entry point check");
                if let Some(error) = run_project_check(output_dir, &entry).await {
                    info!("Entry point check failed");
                    errors.push(format!("RUNTIME ERROR running {}:\n{}", entry, error));
                } else {
                    info!("Entry point check passed");
                }
            }
            None => {
                warn!("No entry point found (no main.py or __main__.py)");
            }
        }

        let test_files = find_test_files(output_dir);
        if test_files.is_empty() {
            info!("No test files found, skipping test run");
        } else {
            info!(count = test_files.len(), "Running tests");
            if let Some(error) = run_tests(output_dir).await {
                info!("Tests failed");
                errors.push(format!("TEST FAILURES:\n{}", error));
            } else {
                info!("All tests pass");
            }
        }

        if let Some(bus) = event_bus {
            bus.emit(
                EngineEvent::new(EventType::ValidationResult)
                    .with_data(serde_json::json!({"round": round, "errors": errors.len()})),
            );
        }

        if errors.is_empty() {
            info!(round, "Validation passed");
            return;
        }

        info!(error_count = errors.len(), "Sending errors for auto-fix");
        let fixed = auto_fix_errors(client, output_dir, engineering_prompt, &errors).await;
        if !fixed {
            warn!("Auto-fix produced no changes");
            continue;
        }

        // Requirements may have changed with the fixes.
        install_dependencies(output_dir).await;
    }

    warn!(
        rounds = MAX_VALIDATION_ROUNDS,
        "Validation completed with issues remaining"
    );
}

/// Install dependencies from requirements.txt when present
///
/// A pygame failure is retried once with pygame-ce, which installs cleanly
/// on platforms where upstream pygame does not.
pub async fn install_dependencies(output_dir: &Path) {
    let req_file = output_dir.join("requirements.txt");
    if !req_file.exists() {
        info!("No requirements.txt found, skipping dependency install");
        return;
    }

    info!("Installing dependencies from requirements.txt");
    let outcome = run_command(
        PYTHON,
        &["-m", "pip", "install", "-r", "requirements.txt", "-q"],
        output_dir,
        INSTALL_TIMEOUT,
    )
    .await;

    match outcome {
        Ok(CommandOutcome::Finished { exit_code: 0, .. }) => {
            info!("Dependencies installed successfully");
        }
        Ok(CommandOutcome::Finished { exit_code, stderr, .. }) => {
            warn!(exit_code, "pip install failed");
            if stderr.to_lowercase().contains("pygame") {
                info!("pygame install failed, retrying with pygame-ce");
                if let Ok(req_text) = std::fs::read_to_string(&req_file) {
                    let _ = std::fs::write(&req_file, req_text.replace("pygame", "pygame-ce"));
                }
                match run_command(
                    PYTHON,
                    &["-m", "pip", "install", "-r", "requirements.txt", "-q"],
                    output_dir,
                    INSTALL_TIMEOUT,
                )
                .await
                {
                    Ok(CommandOutcome::Finished { exit_code: 0, .. }) => {
                        info!("Dependencies installed with pygame-ce");
                    }
                    Ok(CommandOutcome::Finished { stderr, .. }) => {
                        warn!(error = %truncate_chars(&stderr, 200), "pygame-ce install also failed");
                    }
                    Ok(CommandOutcome::TimedOut) => warn!("pip install timed out"),
                    Err(e) => warn!(error = %e, "pip install error"),
                }
            } else {
                warn!(error = %truncate_chars(&stderr, 300), "pip install error output");
            }
        }
        Ok(CommandOutcome::TimedOut) => warn!("pip install timed out after {:?}", INSTALL_TIMEOUT),
        Err(e) => warn!(error = %e, "pip install error"),
    }
}

/// Locate the generated project's entry point
///
/// Prefers conventional top-level scripts, then any package `__main__.py`
/// (returned in `-m package` form).
pub fn find_entry_point(output_dir: &Path) -> Option<String> {
    for candidate in ["main.py", "app.py", "run.py"] {
        if output_dir.join(candidate).exists() {
            return Some(candidate.to_string());
        }
    }

    for entry in WalkDir::new(output_dir).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_file() && entry.file_name() == "__main__.py" {
            let Ok(rel) = entry.path().strip_prefix(output_dir) else {
                continue;
            };
            let package = rel.parent().unwrap_or(Path::new(""));
            if package == Path::new("") {
                return Some("__main__.py".to_string());
            }
            let module = package.to_string_lossy().replace(['/', '\\'], ".");
            return Some(format!("-m {}", module));
        }
    }

    None
}

/// Import-check the entry point without actually running the program
///
/// A timeout is treated as success: GUI apps block on their event loop.
async fn run_project_check(output_dir: &Path, entry_point: &str) -> Option<String> {
    let check_code = if let Some(module) = entry_point.strip_prefix("-m ") {
        format!("import importlib; importlib.import_module('{}')", module)
    } else {
        let module_name = entry_point.replace(['/', '\\'], ".").trim_end_matches(".py").to_string();
        format!(
            "import importlib.util, sys; \
             spec = importlib.util.spec_from_file_location('{}', '{}'); \
             mod = importlib.util.module_from_spec(spec)",
            module_name, entry_point
        )
    };

    match run_command(PYTHON, &["-c", &check_code], output_dir, CHECK_TIMEOUT).await {
        Ok(CommandOutcome::Finished { exit_code: 0, .. }) => None,
        Ok(CommandOutcome::Finished { stdout, stderr, .. }) => {
            let error = if !stderr.is_empty() { stderr } else { stdout };
            Some(truncate_chars(
                if error.is_empty() { "Unknown error" } else { &error },
                2000,
            ))
        }
        Ok(CommandOutcome::TimedOut) => None,
        Err(e) => Some(truncate_chars(&e.to_string(), 500)),
    }
}

/// Find pytest-style test files anywhere in the project
pub fn find_test_files(output_dir: &Path) -> Vec<PathBuf> {
    let mut test_files: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(output_dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if (name.starts_with("test_") && name.ends_with(".py")) || name.ends_with("_test.py") {
            test_files.push(entry.path().to_path_buf());
        }
    }
    test_files
}

async fn run_tests(output_dir: &Path) -> Option<String> {
    match run_command(
        PYTHON,
        &["-m", "pytest", "-x", "--tb=short", "-q"],
        output_dir,
        TEST_TIMEOUT,
    )
    .await
    {
        Ok(CommandOutcome::Finished { exit_code: 0, .. }) => None,
        Ok(CommandOutcome::Finished { stdout, stderr, .. }) => {
            Some(truncate_chars(&format!("{}\n{}", stdout, stderr), 3000))
        }
        Ok(CommandOutcome::TimedOut) => Some(format!("Tests timed out after {}s", TEST_TIMEOUT.as_secs())),
        Err(e) => Some(truncate_chars(&e.to_string(), 500)),
    }
}

/// Feed the errors plus the full project back through the worker contract
///
/// Returns whether any file changes were applied.
pub async fn auto_fix_errors(
    client: &Arc<dyn LlmClient>,
    output_dir: &Path,
    engineering_prompt: &str,
    errors: &[String],
) -> bool {
    let state = project::snapshot(output_dir);
    let contents = project::read_contents(output_dir, &state.file_tree, MAX_FILE_CONTENT_CHARS);

    let mut contents_str = String::new();
    for (path, content) in &contents {
        contents_str.push_str(&format!("\n### {}\n```\n{}\n```\n", path, content));
    }

    let user_msg = format!(
        "## Auto-Fix Task\n\n\
         The project has been built but has errors that need fixing. Below are the errors and the full project code. Fix ALL errors.\n\n\
         ## Errors Found\n\n{}\n\n\
         ## Current Project File Tree\n{}\n\n\
         ## Full Project Code\n{}\n\n\
         ---\n\n\
         Fix all the errors above. Return ONLY a JSON object with file_operations for every file you need to modify.\n\
         Key rules:\n\
         - Fix the actual errors (NameError, ImportError, etc.)\n\
         - Use relative imports within packages (from .module import ...)\n\
         - Define all constants before use or import from constants file\n\
         - NEVER create external asset files (.png, .ttf, .wav, etc.)\n\
         - Include complete file contents for every file you modify",
        errors.join("\n\n"),
        state.file_tree.join("\n"),
        contents_str
    );

    let messages = vec![
        ChatMessage::system(format!("{}{}", engineering_prompt, WORKER_RESPONSE_FORMAT)),
        ChatMessage::user(user_msg),
    ];

    let response = match client.complete(&messages).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Auto-fix LLM call failed");
            return false;
        }
    };

    let result = parse_worker_response(&response.content, "auto-fix");
    if result.file_operations.is_empty() {
        warn!("Auto-fix returned no file operations");
        return false;
    }

    let mut files_fixed = 0;
    for op in &result.file_operations {
        if is_asset_path(&op.path) {
            warn!(path = %op.path, "Blocked asset file in auto-fix");
            continue;
        }

        let target = output_dir.join(&op.path);
        if let Some(parent) = target.parent()
            && std::fs::create_dir_all(parent).is_err()
        {
            continue;
        }
        match std::fs::write(&target, &op.content) {
            Ok(()) => {
                files_fixed += 1;
                info!(path = %op.path, "Fixed");
            }
            Err(e) => warn!(path = %op.path, error = %e, "Auto-fix write failed"),
        }
    }

    info!(files_fixed, "Auto-fix applied file changes");
    files_fixed > 0
}
