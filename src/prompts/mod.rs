//! Prompt loading
//!
//! Prompt text is opaque to the engine: it is loaded from an override
//! directory when one is configured and falls back to the embedded copies
//! compiled from prompts/.

mod embedded;

use std::path::{Path, PathBuf};

use eyre::{Result, eyre};
use tracing::debug;

use crate::domain::Team;

pub use embedded::get_embedded;

/// Loads prompt text by name, preferring on-disk overrides
#[derive(Debug, Clone, Default)]
pub struct PromptLoader {
    override_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// Create a loader with an optional override directory
    ///
    /// A configured directory that does not exist is treated as absent.
    pub fn new(override_dir: Option<&Path>) -> Self {
        let override_dir = override_dir.filter(|d| d.exists()).map(Path::to_path_buf);
        debug!(?override_dir, "PromptLoader::new: called");
        Self { override_dir }
    }

    /// Create a loader that only uses embedded prompts
    pub fn embedded_only() -> Self {
        Self { override_dir: None }
    }

    /// Load a prompt by name
    ///
    /// Checks `<override_dir>/<name>.md` first, then the embedded copy.
    pub fn load(&self, name: &str) -> Result<String> {
        debug!(%name, "PromptLoader::load: called");
        if let Some(ref dir) = self.override_dir {
            let path = dir.join(format!("{}.md", name));
            if path.exists() {
                debug!(?path, "PromptLoader::load: found override");
                return std::fs::read_to_string(&path)
                    .map_err(|e| eyre!("Failed to read prompt {}: {}", path.display(), e));
            }
        }

        if let Some(content) = get_embedded(name) {
            return Ok(content.to_string());
        }

        Err(eyre!("Prompt not found: {}", name))
    }

    /// Load a team's worker system prompt
    ///
    /// A missing prompt never stops a worker; the fallback is a one-line
    /// role statement.
    pub fn team_prompt(&self, team: Team) -> String {
        self.load(team.as_str()).unwrap_or_else(|_| {
            tracing::warn!(%team, "Missing team prompt, using fallback");
            format!("You are the {} team agent.", team)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_embedded_only_loads_all_names() {
        let loader = PromptLoader::embedded_only();
        for name in ["root-planner", "subplanner", "reconciler"] {
            assert!(loader.load(name).is_ok());
        }
    }

    #[test]
    fn test_unknown_prompt_errors() {
        let loader = PromptLoader::embedded_only();
        assert!(loader.load("no-such-prompt").is_err());
    }

    #[test]
    fn test_override_dir_wins() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("engineering.md"), "custom engineering prompt").unwrap();

        let loader = PromptLoader::new(Some(temp.path()));
        assert_eq!(loader.load("engineering").unwrap(), "custom engineering prompt");
        // Names without an override still come from the embedded set.
        assert!(loader.load("quality").unwrap().contains("quality"));
    }

    #[test]
    fn test_missing_override_dir_ignored() {
        let loader = PromptLoader::new(Some(Path::new("/definitely/not/here")));
        assert!(loader.load("engineering").is_ok());
    }

    #[test]
    fn test_team_prompt_for_each_team() {
        let loader = PromptLoader::embedded_only();
        assert!(!loader.team_prompt(Team::Engineering).is_empty());
        assert!(!loader.team_prompt(Team::Product).is_empty());
        assert!(!loader.team_prompt(Team::Quality).is_empty());
    }
}
