//! Project state observation
//!
//! Read-only snapshots of the output directory. The planners feed the file
//! tree to the LLM every iteration and the workers get full file contents as
//! context, so determinism (sorted paths) and bounded sizes matter here.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;

/// File tree entries beyond this count are dropped behind a sentinel entry.
pub const MAX_FILE_TREE_ENTRIES: usize = 500;

/// Per-file content cap when reading files as LLM context.
pub const MAX_FILE_CONTENT_CHARS: usize = 30_000;

/// Directories never included in snapshots.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    "dist",
    "build",
    ".turbo",
    ".next",
    ".nuxt",
    "target",
];

/// Extensions whose contents are replaced by a size placeholder.
const BINARY_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".ico", ".svg", ".woff", ".woff2", ".ttf", ".eot", ".otf", ".zip",
    ".tar", ".gz", ".bz2", ".xz", ".7z", ".exe", ".dll", ".so", ".dylib", ".o", ".a", ".pyc", ".pyo", ".class",
    ".jar", ".mp3", ".mp4", ".wav", ".avi", ".mov", ".pdf", ".doc", ".docx", ".xls", ".xlsx",
];

/// A deterministic snapshot of the output directory
#[derive(Debug, Clone, Default)]
pub struct ProjectState {
    /// Relative paths, lexicographically sorted, possibly capped with a
    /// trailing `... (N more files)` sentinel
    pub file_tree: Vec<String>,
}

/// Walk the output directory and return its file tree
///
/// A missing directory is created and reported as empty. Skip-directories
/// and dotfile components are omitted anywhere in the path.
pub fn snapshot(output_dir: &Path) -> ProjectState {
    debug!(?output_dir, "snapshot: called");
    if !output_dir.exists() {
        if let Err(e) = fs::create_dir_all(output_dir) {
            warn!(?output_dir, error = %e, "Could not create output directory");
        }
        return ProjectState::default();
    }

    let mut files: Vec<String> = Vec::new();

    for entry in WalkDir::new(output_dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(output_dir) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        let skipped = rel
            .split('/')
            .any(|part| SKIP_DIRS.contains(&part) || part.starts_with('.'));
        if skipped {
            continue;
        }
        files.push(rel);
    }

    files.sort();

    if files.len() > MAX_FILE_TREE_ENTRIES {
        let truncated = files.len() - MAX_FILE_TREE_ENTRIES;
        files.truncate(MAX_FILE_TREE_ENTRIES);
        files.push(format!("... ({} more files)", truncated));
    }

    debug!(file_count = files.len(), "snapshot: complete");
    ProjectState { file_tree: files }
}

/// Read the contents of the named files, bounded per file
///
/// Invalid UTF-8 is replaced, oversized contents get a truncation marker,
/// and binary extensions are represented by a `(binary file, N bytes)`
/// placeholder. Unreadable files are logged and skipped.
pub fn read_contents(output_dir: &Path, paths: &[String], max_chars: usize) -> BTreeMap<String, String> {
    debug!(path_count = paths.len(), max_chars, "read_contents: called");
    let mut contents = BTreeMap::new();

    for rel_path in paths {
        let full = output_dir.join(rel_path);
        if !full.is_file() {
            continue;
        }

        let ext = crate::domain::extension_of(rel_path);
        if BINARY_EXTENSIONS.contains(&ext.as_str()) {
            let size = fs::metadata(&full).map(|m| m.len()).unwrap_or(0);
            contents.insert(rel_path.clone(), format!("(binary file, {} bytes)", size));
            continue;
        }

        match fs::read(&full) {
            Ok(bytes) => {
                let mut text = String::from_utf8_lossy(&bytes).into_owned();
                if let Some((cut, _)) = text.char_indices().nth(max_chars) {
                    text.truncate(cut);
                    text.push_str("\n... (truncated)");
                }
                contents.insert(rel_path.clone(), text);
            }
            Err(e) => {
                warn!(path = %rel_path, error = %e, "Could not read file");
            }
        }
    }

    contents
}
