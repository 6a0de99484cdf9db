use crate::constants::{
    API_URL_ENV, DEFAULT_API_URL, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE,
    LOG_LEVEL_ENV,
};
use crate::errors::{PalaverError, PalaverResult};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf};

/// User-adjustable chat behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub streaming_enabled: bool,
    pub show_timestamps: bool,
    pub system_prompt: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            streaming_enabled: true,
            show_timestamps: true,
            system_prompt: None,
        }
    }
}

/// Persisted configuration. Environment overrides live beside the file-backed
/// values and are never written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub selected_model: String,
    pub log_level: String,
    pub settings: Settings,
    #[serde(skip)]
    api_url_override: Option<String>,
    #[serde(skip)]
    log_level_override: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            selected_model: DEFAULT_MODEL.to_string(),
            log_level: "info".to_string(),
            settings: Settings::default(),
            api_url_override: None,
            log_level_override: None,
        }
    }
}

impl Config {
    /// Loads the config at `path`, writing defaults there when it does not exist yet.
    /// Environment overrides are applied after loading and are never persisted.
    pub fn load_or_create(path: &Path) -> PalaverResult<Self> {
        let mut config = if path.exists() {
            let config_str = fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&config_str)?;
            validate_config(&config)?;
            config
        } else {
            let config = Config::default();
            config.save(path)?;
            config
        };

        config.apply_overrides(env_value(API_URL_ENV), env_value(LOG_LEVEL_ENV));
        validate_config(&config)?;
        Ok(config)
    }

    /// Base URL in effect, including any environment override.
    pub fn effective_api_url(&self) -> &str {
        self.api_url_override.as_deref().unwrap_or(&self.api_url)
    }

    pub fn effective_log_level(&self) -> &str {
        self.log_level_override.as_deref().unwrap_or(&self.log_level)
    }

    pub fn save(&self, path: &Path) -> PalaverResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let config_str = serde_json::to_string_pretty(self)?;
        fs::write(path, config_str)?;
        Ok(())
    }

    /// Validates `updated` and persists it, replacing `self` only on success.
    pub fn update(&mut self, updated: Config, path: &Path) -> PalaverResult<()> {
        validate_config(&updated)?;
        updated.save(path)?;
        *self = updated;
        Ok(())
    }

    pub(crate) fn apply_overrides(&mut self, api_url: Option<String>, log_level: Option<String>) {
        self.api_url_override = api_url;
        self.log_level_override = log_level;
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

pub fn config_dir() -> PalaverResult<PathBuf> {
    let home_dir = dirs::home_dir()
        .ok_or_else(|| PalaverError::config_error("Could not determine home directory"))?;

    Ok(home_dir.join(".config").join("palaver"))
}

pub fn config_path() -> PalaverResult<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

pub fn validate_config(config: &Config) -> PalaverResult<()> {
    for url in [config.api_url.as_str(), config.effective_api_url()] {
        if url.trim().is_empty() {
            return Err(PalaverError::config_error("API URL is required"));
        }
        reqwest::Url::parse(url)
            .map_err(|e| PalaverError::config_error(format!("Invalid API URL '{}': {}", url, e)))?;
    }

    if config.selected_model.trim().is_empty() {
        return Err(PalaverError::config_error("Model name is required"));
    }

    validate_settings(&config.settings)
}

pub fn validate_settings(settings: &Settings) -> PalaverResult<()> {
    if !(0.0..=2.0).contains(&settings.temperature) {
        return Err(PalaverError::config_error("Temperature must be between 0.0 and 2.0"));
    }

    if settings.max_tokens == 0 {
        return Err(PalaverError::config_error("max_tokens must be greater than 0"));
    }

    Ok(())
}
