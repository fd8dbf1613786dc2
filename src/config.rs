use crate::anthropic::DEFAULT_ANTHROPIC_URL;
use crate::error::{PleaseError, Result};
use crate::ollama::DEFAULT_OLLAMA_URL;
use crate::openai::DEFAULT_OPENAI_URL;
use crate::planner::GenerationSettings;
use crate::types::ScriptType;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const APP_NAME: &str = "please";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub ollama_url: String,
    pub openai_url: String,
    pub anthropic_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let generation = GenerationSettings::default();
        Self {
            provider: "ollama".to_string(),
            model: None,
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            openai_url: DEFAULT_OPENAI_URL.to_string(),
            anthropic_url: DEFAULT_ANTHROPIC_URL.to_string(),
            openai_api_key: None,
            anthropic_api_key: None,
            timeout_secs: generation.timeout.as_secs(),
            temperature: generation.temperature,
            top_p: generation.top_p,
            max_tokens: generation.max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    pub script_type: String,
    pub history_window: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            script_type: "auto".to_string(),
            history_window: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Literal substrings flagged as High risk on top of the built-in rules.
    pub extra_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub behavior: BehaviorConfig,
    pub safety: SafetyConfig,
}

impl Config {
    /// Applies environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(provider) = get("PLEASE_PROVIDER") {
            self.llm.provider = provider.trim().to_lowercase();
        }
        if let Some(model) = get("PLEASE_MODEL") {
            self.llm.model = Some(model);
        } else if self.llm.provider == "ollama" {
            if let Some(model) = get("OLLAMA_MODEL") {
                self.llm.model = Some(model);
            }
        }
        if let Some(url) = get("OLLAMA_URL") {
            self.llm.ollama_url = url;
        }
        if let Some(key) = get("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(key);
        }
        if let Some(key) = get("ANTHROPIC_API_KEY") {
            self.llm.anthropic_api_key = Some(key);
        }
        if let Some(script_type) = get("PLEASE_SCRIPT_TYPE") {
            self.behavior.script_type = script_type;
        }
    }

    pub fn script_type(&self) -> Result<ScriptType> {
        self.behavior.script_type.parse()
    }

    pub fn generation_settings(&self) -> Result<GenerationSettings> {
        if self.llm.timeout_secs == 0 {
            return Err(PleaseError::Configuration(
                "llm.timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(GenerationSettings {
            temperature: self.llm.temperature,
            top_p: self.llm.top_p,
            max_tokens: self.llm.max_tokens,
            timeout: Duration::from_secs(self.llm.timeout_secs),
        })
    }
}

pub fn get_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("config.toml")
}

/// Reads the config file and environment. A missing file means defaults; a
/// broken one is reported and ignored.
pub fn load_config() -> Config {
    let mut config = load_config_from(&get_config_path());
    config.apply_env(|key| std::env::var(key).ok());
    config
}

pub fn load_config_from(path: &Path) -> Config {
    if !path.exists() {
        return Config::default();
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read config, using defaults");
            return Config::default();
        }
    };
    match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            Config::default()
        }
    }
}

pub fn save_config(config: &Config, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}
