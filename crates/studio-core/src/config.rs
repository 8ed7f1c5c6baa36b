//! Configuration management for studio.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::DEFAULT_TEMPERATURE;

const CONFIG_FILE: &str = "studio.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Connection settings for the model server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL including the API prefix, e.g. `http://localhost:1234/v1`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token; local servers accept any value
    #[serde(default = "default_api_key")]
    pub api_key: String,

    /// Model used when none is given explicitly
    #[serde(default)]
    pub default_model: Option<String>,

    /// Overall deadline for a chat completion
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Deadline for the model listing
    #[serde(default = "default_model_fetch_timeout")]
    pub model_fetch_timeout_secs: u64,

    /// Fall back to the first listed model when no model is configured
    #[serde(default = "default_true")]
    pub auto_select_first_model: bool,
}

/// Default sampling options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_base_url() -> String {
    "http://localhost:1234/v1".to_string()
}

fn default_api_key() -> String {
    "lm-studio".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_model_fetch_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: default_api_key(),
            default_model: None,
            request_timeout_secs: default_request_timeout(),
            model_fetch_timeout_secs: default_model_fetch_timeout(),
            auto_select_first_model: true,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: None,
            system_prompt: None,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn model_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.model_fetch_timeout_secs)
    }
}

impl Config {
    /// Load configuration from studio.toml, falling back to defaults when missing
    pub fn load() -> Result<Self> {
        match Self::find_config_path() {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    /// Find studio.toml in the current directory, its parents, then the user config dir
    pub fn find_config_path() -> Option<PathBuf> {
        if let Ok(mut current) = std::env::current_dir() {
            for _ in 0..10 {
                let candidate = current.join(CONFIG_FILE);
                if candidate.exists() {
                    return Some(candidate);
                }
                if !current.pop() {
                    break;
                }
            }
        }

        dirs::config_dir()
            .map(|dir| dir.join("studio").join(CONFIG_FILE))
            .filter(|path| path.exists())
    }
}
