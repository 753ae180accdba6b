//! swarmd configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main swarmd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Orchestration limits and policies
    pub orchestrator: OrchestratorConfig,

    /// Agent loop budgets
    pub agent: AgentConfig,

    /// Storage locations
    pub storage: StorageConfig,

    /// Code indexing filters
    pub index: IndexFileConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Order: explicit path, `SWARMD_CONFIG`, `.swarmd.yml`,
    /// `~/.config/swarmd/swarmd.yml`, built-in defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        if let Ok(env_path) = std::env::var("SWARMD_CONFIG") {
            let path = PathBuf::from(env_path);
            return Self::load_from_file(&path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".swarmd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("swarmd").join("swarmd.yml");
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

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: anthropic
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Model used when a subtask asks for the thinking model
    #[serde(rename = "thinking-model")]
    pub thinking_model: String,

    /// Model used for summarization calls
    #[serde(rename = "summarizer-model")]
    pub summarizer_model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            thinking_model: "claude-opus-4-20250514".to_string(),
            summarizer_model: "claude-3-5-haiku-20241022".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
        }
    }
}

/// Orchestration limits and failure policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum concurrent agents
    #[serde(rename = "max-agents")]
    pub max_agents: usize,

    /// Per-subtask agent timeout in minutes
    #[serde(rename = "agent-timeout-minutes")]
    pub agent_timeout_minutes: u64,

    /// Run each agent as a child process
    #[serde(rename = "use-process-isolation")]
    pub use_process_isolation: bool,

    /// Merge agent branches when the plan completes
    #[serde(rename = "auto-merge-results")]
    pub auto_merge_results: bool,

    /// Retry failed subtasks up to max-retries
    #[serde(rename = "retry-failed")]
    pub retry_failed: bool,

    /// Treat failed dependencies as satisfied
    #[serde(rename = "skip-failed")]
    pub skip_failed: bool,

    /// Retry limit per subtask
    #[serde(rename = "max-retries")]
    pub max_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: 4,
            agent_timeout_minutes: 30,
            use_process_isolation: false,
            auto_merge_results: true,
            retry_failed: false,
            skip_failed: false,
            max_retries: 2,
        }
    }
}

/// Agent loop budgets and guard settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model context window in tokens
    #[serde(rename = "max-context-tokens")]
    pub max_context_tokens: u64,

    /// Identical tool calls in a row before the loop guard trips
    #[serde(rename = "tool-loop-window")]
    pub tool_loop_window: usize,

    /// Consecutive tool failures before the failure guard trips
    #[serde(rename = "consecutive-failure-limit")]
    pub consecutive_failure_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 200_000,
            tool_loop_window: 3,
            consecutive_failure_limit: 3,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Orchestration work directory root
    #[serde(rename = "work-dir")]
    pub work_dir: PathBuf,

    /// Store database filename within the work directory
    #[serde(rename = "db-name")]
    pub db_name: String,
}

impl StorageConfig {
    /// Full path of the store database
    pub fn db_path(&self) -> PathBuf {
        self.work_dir.join(&self.db_name)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            db_name: "swarmd.db".to_string(),
        }
    }
}

/// Code indexing filters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexFileConfig {
    /// Extensions eligible for indexing
    pub extensions: Vec<String>,

    /// Skip files larger than this
    #[serde(rename = "max-file-kb")]
    pub max_file_kb: u64,

    /// Directory names never descended into
    #[serde(rename = "excluded-dirs")]
    pub excluded_dirs: Vec<String>,
}

impl Default for IndexFileConfig {
    fn default() -> Self {
        Self {
            extensions: ["rs", "py", "js", "ts", "jsx", "tsx", "go", "java", "cs"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_file_kb: 1024,
            excluded_dirs: [".git", "target", "node_modules", "dist", "build", ".venv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}
