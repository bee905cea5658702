//! CodeSwarm configuration types and loading

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main CodeSwarm configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM endpoint configuration
    pub llm: LlmConfig,

    /// Engine limits and paths
    pub engine: EngineConfig,

    /// Reconciler background sweep
    pub reconciler: ReconcilerConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then project-local `.codeswarm.yml`, then the user
    /// config dir, then built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".codeswarm.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("codeswarm").join("codeswarm.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// LLM endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// Model identifier
    pub model: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Total request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Connect timeout in milliseconds
    #[serde(rename = "connect-timeout-ms")]
    pub connect_timeout_ms: u64,
}

impl LlmConfig {
    /// Resolve the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env).map_err(|_| eyre!("Missing required env var: {}", self.api_key_env))
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            model: "gemini-2.5-pro".to_string(),
            max_tokens: 65536,
            temperature: 0.7,
            timeout_ms: 300_000,
            connect_timeout_ms: 30_000,
        }
    }
}

/// Engine limits and paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory the generated project is written into
    #[serde(rename = "output-dir")]
    pub output_dir: PathBuf,

    /// Maximum concurrent worker LLM calls
    #[serde(rename = "max-workers")]
    pub max_workers: usize,

    /// Planning iteration cap
    #[serde(rename = "max-planner-iterations")]
    pub max_planner_iterations: u32,

    /// Optional directory of prompt overrides
    #[serde(rename = "prompts-dir")]
    pub prompts_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output_project"),
            max_workers: 10,
            max_planner_iterations: 100,
            prompts_dir: None,
        }
    }
}

/// Reconciler background sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Whether the periodic sweep runs at all
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.engine.max_workers, 10);
        assert_eq!(config.engine.max_planner_iterations, 100);
        assert!(config.reconciler.enabled);
        assert_eq!(config.reconciler.interval_secs, 120);
        assert_eq!(config.llm.timeout_ms, 300_000);
        assert_eq!(config.llm.connect_timeout_ms, 30_000);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
llm:
  base-url: https://api.example.com/v1
  api-key-env: MY_API_KEY
  model: some-model
  max-tokens: 8192
  temperature: 0.2
  timeout-ms: 60000

engine:
  output-dir: /tmp/out
  max-workers: 4
  max-planner-iterations: 50

reconciler:
  enabled: false
  interval-secs: 30
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.llm.base_url, "https://api.example.com/v1");
        assert_eq!(config.llm.api_key_env, "MY_API_KEY");
        assert_eq!(config.llm.max_tokens, 8192);
        assert_eq!(config.engine.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.engine.max_workers, 4);
        assert!(!config.reconciler.enabled);
        assert_eq!(config.reconciler.interval_secs, 30);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
engine:
  max-workers: 2
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.engine.max_workers, 2);
        assert_eq!(config.engine.max_planner_iterations, 100);
        assert_eq!(config.llm.api_key_env, "GEMINI_API_KEY");
        assert!(config.reconciler.enabled);
    }
}
