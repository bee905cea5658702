//! Core domain types for CodeSwarm
//!
//! Tasks flow from the planners to the workers; handoffs flow back. File
//! operations are the only way workers touch the output directory.

mod handoff;
mod task;

pub use handoff::{FileOperation, Handoff, HandoffMetrics, HandoffStatus, WorkerResult};
pub use task::{Task, TaskStatus, Team};

/// Asset file extensions that must never be written into the project.
///
/// Workers reject these at write time and the reconciler flags any that
/// slip through.
pub const ASSET_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".svg", ".ico", ".webp", ".ttf", ".otf", ".woff", ".woff2", ".eot",
    ".mp3", ".wav", ".ogg", ".flac", ".aac", ".mp4", ".avi", ".mov", ".webm",
];

/// Lowercased extension of a path, including the leading dot.
///
/// Returns an empty string for extensionless paths, mirroring how the
/// extension sets are matched everywhere in the engine.
pub fn extension_of(path: &str) -> String {
    match path.rsplit_once('.') {
        Some((_, ext)) => format!(".{}", ext.to_lowercase()),
        None => String::new(),
    }
}

/// Check whether a path has a forbidden asset extension.
pub fn is_asset_path(path: &str) -> bool {
    let ext = extension_of(path);
    ASSET_EXTENSIONS.contains(&ext.as_str())
}
