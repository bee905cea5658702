//! Embedded prompts
//!
//! Compiled into the binary from the repo's prompts/ directory so the engine
//! runs without any installed prompt files.

use tracing::debug;

/// Root planner (Manager) system prompt
pub const ROOT_PLANNER: &str = include_str!("../../prompts/root-planner.md");

/// Subplanner decomposition system prompt
pub const SUBPLANNER: &str = include_str!("../../prompts/subplanner.md");

/// Engineering worker system prompt
pub const ENGINEERING: &str = include_str!("../../prompts/engineering.md");

/// Product worker system prompt
pub const PRODUCT: &str = include_str!("../../prompts/product.md");

/// Quality worker system prompt
pub const QUALITY: &str = include_str!("../../prompts/quality.md");

/// Reconciler fix-task system prompt
pub const RECONCILER: &str = include_str!("../../prompts/reconciler.md");

/// Get an embedded prompt by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    debug!(%name, "get_embedded: called");
    match name {
        "root-planner" => Some(ROOT_PLANNER),
        "subplanner" => Some(SUBPLANNER),
        "engineering" => Some(ENGINEERING),
        "product" => Some(PRODUCT),
        "quality" => Some(QUALITY),
        "reconciler" => Some(RECONCILER),
        _ => None,
    }
}
