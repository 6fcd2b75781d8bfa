//! Configuration management for Famulus
//!
//! Configuration is loaded from `~/.famulus/config.json` with environment
//! variable overrides. The config selects the active inference backend, maps
//! model tiers to concrete models, and fixes the data directory layout. It is
//! constructed once in `main` and passed explicitly to every component that
//! needs it. There is no global config cell.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::InferenceModel;
use crate::error::{FamulusError, Result};

/// Token count above which a room's history gets compacted.
pub const COMPACT_THRESHOLD: u64 = 140_000;

/// Soft context budget reported in logs.
pub const CONTEXT_BUDGET: u64 = 180_000;

fn default_backend() -> String {
    "anthropic".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.deepinfra.com/v1/openai".to_string()
}

fn default_cli_agent_binary() -> String {
    "claude".to_string()
}

fn default_data_dir() -> PathBuf {
    Config::dir().join("data")
}

fn default_chat_tier() -> String {
    "smart".to_string()
}

fn default_cycle_tier() -> String {
    "balanced".to_string()
}

fn default_reverie_interval_secs() -> u64 {
    1_800
}

fn default_consolidation_interval_secs() -> u64 {
    86_400
}

fn default_tiers() -> HashMap<String, InferenceModel> {
    let mut tiers = HashMap::new();
    tiers.insert(
        "fast".to_string(),
        InferenceModel::new("claude-haiku-4-5", 16_000),
    );
    tiers.insert(
        "balanced".to_string(),
        InferenceModel {
            model_id: "claude-sonnet-4-5".to_string(),
            max_output_tokens: 64_000,
            thinking_budget: Some(10_000),
        },
    );
    tiers.insert(
        "smart".to_string(),
        InferenceModel::new("claude-opus-4-5", 32_000),
    );
    tiers
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active inference backend: "anthropic", "openai-compat", or "cli-agent"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Anthropic API key
    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    /// API key for the OpenAI-compatible backend
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// Base URL for the OpenAI-compatible backend
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    /// Binary the CLI-agent backend shells out to
    #[serde(default = "default_cli_agent_binary")]
    pub cli_agent_binary: String,

    /// Root data directory (workspace, audit and usage logs live below it)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Named model tiers
    #[serde(default = "default_tiers")]
    pub tiers: HashMap<String, InferenceModel>,

    /// Tier used for chat turns
    #[serde(default = "default_chat_tier")]
    pub chat_tier: String,

    /// Tier used for background cycles
    #[serde(default = "default_cycle_tier")]
    pub cycle_tier: String,

    /// Seconds between reverie cycles
    #[serde(default = "default_reverie_interval_secs")]
    pub reverie_interval_secs: u64,

    /// Seconds between consolidation cycles
    #[serde(default = "default_consolidation_interval_secs")]
    pub consolidation_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            anthropic_api_key: None,
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            cli_agent_binary: default_cli_agent_binary(),
            data_dir: default_data_dir(),
            tiers: default_tiers(),
            chat_tier: default_chat_tier(),
            cycle_tier: default_cycle_tier(),
            reverie_interval_secs: default_reverie_interval_secs(),
            consolidation_interval_secs: default_consolidation_interval_secs(),
        }
    }
}

impl Config {
    /// Returns the Famulus configuration directory path (~/.famulus)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".famulus")
    }

    /// Returns the path to the config file (~/.famulus/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("FAMULUS_BACKEND") {
            self.backend = val;
        }
        if let Ok(val) =
            std::env::var("FAMULUS_ANTHROPIC_API_KEY").or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
        {
            self.anthropic_api_key = Some(val);
        }
        if let Ok(val) =
            std::env::var("FAMULUS_OPENAI_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY"))
        {
            self.openai_api_key = Some(val);
        }
        if let Ok(val) = std::env::var("FAMULUS_OPENAI_BASE_URL") {
            self.openai_base_url = val;
        }
        if let Ok(val) = std::env::var("FAMULUS_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("FAMULUS_CHAT_TIER") {
            self.chat_tier = val;
        }
    }

    /// The agent's workspace directory.
    pub fn workspace_path(&self) -> PathBuf {
        self.data_dir.join("workspace")
    }

    /// Directory for per-day tool audit logs.
    pub fn audit_path(&self) -> PathBuf {
        self.data_dir.join("audit")
    }

    /// Directory for per-day token usage logs.
    pub fn usage_path(&self) -> PathBuf {
        self.data_dir.join("token-usage")
    }

    /// Resolve a tier name like "fast" to its model.
    pub fn resolve_tier(&self, tier: &str) -> Result<InferenceModel> {
        self.tiers
            .get(tier)
            .cloned()
            .ok_or_else(|| FamulusError::Config(format!("Unknown model tier: {:?}", tier)))
    }

    /// The model backing the fast tier (summaries, classification).
    pub fn fast_model(&self) -> InferenceModel {
        self.tiers
            .get("fast")
            .cloned()
            .unwrap_or_else(|| InferenceModel::new("claude-haiku-4-5", 16_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend, "anthropic");
        assert_eq!(config.chat_tier, "smart");
        assert!(config.tiers.contains_key("fast"));
        assert!(config.tiers.contains_key("balanced"));
        assert!(config.tiers.contains_key("smart"));
    }

    #[test]
    fn test_resolve_tier() {
        let config = Config::default();
        let model = config.resolve_tier("balanced").unwrap();
        assert!(model.thinking_budget.is_some());
        assert!(config.resolve_tier("imaginary").is_err());
    }

    #[test]
    fn test_data_layout() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/srv/famulus");
        assert_eq!(config.workspace_path(), PathBuf::from("/srv/famulus/workspace"));
        assert_eq!(config.audit_path(), PathBuf::from("/srv/famulus/audit"));
        assert_eq!(config.usage_path(), PathBuf::from("/srv/famulus/token-usage"));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let path = PathBuf::from("/nonexistent/famulus-config.json");
        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.backend, "anthropic");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"backend": "openai-compat", "openai_api_key": "sk-test", "chat_tier": "fast"}"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.backend, "openai-compat");
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.chat_tier, "fast");
        // Unspecified fields fall back to defaults
        assert!(config.tiers.contains_key("smart"));
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from_path(&path).is_err());
    }
}
