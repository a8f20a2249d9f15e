//! Service configuration for tavern-narrator.
//!
//! Loads config from YAML files in standard locations. Every section and
//! field has a default, so a partial file (or none at all) is valid.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 8768,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Host chat log watched when the event feed is unavailable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatLogConfig {
    pub path: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

impl Default for ChatLogConfig {
    fn default() -> Self {
        Self {
            path: None,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Character replies may still be expanding when the render event fires.
    pub character_delay_ms: u64,
    pub user_delay_ms: u64,
    pub observer_settle_ms: u64,
    pub observer_debounce_ms: u64,
    pub retry_interval_ms: u64,
    pub max_retries: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            character_delay_ms: 1000,
            user_delay_ms: 500,
            observer_settle_ms: 1000,
            observer_debounce_ms: 500,
            retry_interval_ms: 1000,
            max_retries: 5,
        }
    }
}

impl ListenerConfig {
    pub fn character_delay(&self) -> Duration {
        Duration::from_millis(self.character_delay_ms)
    }

    pub fn user_delay(&self) -> Duration {
        Duration::from_millis(self.user_delay_ms)
    }

    pub fn observer_settle(&self) -> Duration {
        Duration::from_millis(self.observer_settle_ms)
    }

    pub fn observer_debounce(&self) -> Duration {
        Duration::from_millis(self.observer_debounce_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub notifications: bool,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            notifications: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Overrides `~/.config/tavern-narrator/settings.json`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub chat_log: ChatLogConfig,
    pub listener: ListenerConfig,
    pub feedback: FeedbackConfig,
    pub settings: SettingsConfig,
    pub history: HistoryConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/tavern-narrator/config.yaml
    /// 3. /etc/tavern-narrator/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/tavern-narrator/config.yaml")),
                Some(PathBuf::from("/etc/tavern-narrator/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}
