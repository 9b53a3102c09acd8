use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneConfig {
    #[serde(default = "default_api_url")]
    pub llm_api_url: String,
    #[serde(default = "default_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    /// How many trailing conversation turns feed the initial generation.
    #[serde(default = "default_recent_turn_window")]
    pub recent_turn_window: usize,
    /// Minimum seconds between full regenerations.
    #[serde(default = "default_regen_debounce_secs")]
    pub regen_debounce_secs: u64,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,

    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub character_description: String,
    #[serde(default)]
    pub character_personality: String,
    #[serde(default)]
    pub character_scenario: String,
}

fn default_api_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    "llama3.2".to_string()
}

fn default_recent_turn_window() -> usize {
    20
}

fn default_regen_debounce_secs() -> u64 {
    5
}

fn default_cache_dir() -> String {
    ".".to_string()
}

fn default_cache_prefix() -> String {
    "character_phone".to_string()
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_api_url(),
            llm_model: default_model(),
            llm_api_key: None,
            recent_turn_window: default_recent_turn_window(),
            regen_debounce_secs: default_regen_debounce_secs(),
            cache_dir: default_cache_dir(),
            cache_prefix: default_cache_prefix(),
            character_name: String::new(),
            character_description: String::new(),
            character_personality: String::new(),
            character_scenario: String::new(),
        }
    }
}

impl PhoneConfig {
    /// Config file lives next to the executable as `charphone_config.toml`.
    pub fn config_path() -> Result<PathBuf> {
        let exe = env::current_exe().context("failed to locate executable")?;
        let dir = exe
            .parent()
            .context("executable has no parent directory")?;
        Ok(dir.join("charphone_config.toml"))
    }

    /// Load from the config file if present, otherwise from environment
    /// variables, otherwise defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {:?}", path))?;
            let config: PhoneConfig =
                toml::from_str(&contents).context("failed to parse config file")?;
            tracing::info!("loaded config from {:?}", path);
            return Ok(config);
        }
        tracing::info!("no config file at {:?}, using environment", path);
        Ok(Self::from_env())
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(&path, contents)
            .with_context(|| format!("failed to write config file {:?}", path))?;
        Ok(())
    }

    /// Fill from `CHARPHONE_*` environment variables where set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("CHARPHONE_API_URL") {
            config.llm_api_url = url;
        }
        if let Ok(model) = env::var("CHARPHONE_MODEL") {
            config.llm_model = model;
        }
        if let Ok(key) = env::var("CHARPHONE_API_KEY") {
            if !key.is_empty() {
                config.llm_api_key = Some(key);
            }
        }
        if let Ok(dir) = env::var("CHARPHONE_CACHE_DIR") {
            config.cache_dir = dir;
        }
        if let Ok(name) = env::var("CHARPHONE_CHARACTER_NAME") {
            config.character_name = name;
        }
        config
    }
}
