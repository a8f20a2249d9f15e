//! Persistent narration settings.
//!
//! Stored as a single JSON object on disk. Reads always merge the stored
//! object over the built-in defaults, so keys added in later versions (or
//! removed by hand) resolve to their default instead of going missing.

use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::extract::Markers;

pub const DEFAULT_API_URL: &str = "https://api.siliconflow.cn/v1";
pub const DEFAULT_MODEL: &str = "FunAudioLLM/CosyVoice2-0.5B";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings patch must be a JSON object")]
    NotAnObject,

    #[error("invalid settings: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A user-cloned voice as returned by the voice list endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CustomVoice {
    pub model: String,
    pub custom_name: String,
    pub text: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub api_key: String,
    pub api_url: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub tts_speed: f32,
    pub tts_gain: f32,
    pub response_format: String,
    pub sample_rate: u32,
    pub text_start: String,
    pub text_end: String,
    pub auto_play: bool,
    pub auto_play_user: bool,
    pub custom_voices: Vec<CustomVoice>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: DEFAULT_API_URL.into(),
            tts_model: DEFAULT_MODEL.into(),
            tts_voice: "alex".into(),
            tts_speed: 1.0,
            tts_gain: 0.0,
            response_format: "mp3".into(),
            sample_rate: 32000,
            text_start: String::new(),
            text_end: String::new(),
            auto_play: true,
            auto_play_user: false,
            custom_voices: Vec::new(),
        }
    }
}

impl Settings {
    pub fn markers(&self) -> Markers {
        Markers::new(self.text_start.clone(), self.text_end.clone())
    }

    /// Copy with the API key masked, for logs and the status endpoint.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.api_key.is_empty() {
            copy.api_key = "********".into();
        }
        copy
    }
}

type Listener = Arc<dyn Fn(&Settings) + Send + Sync>;

/// Settings with file persistence and change notification.
///
/// Cloning is cheap; clones share the same state and listeners.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: Option<PathBuf>,
    current: Mutex<Settings>,
    listeners: Mutex<Vec<Listener>>,
}

impl SettingsStore {
    /// Open the store backed by `path`. A missing or unreadable file starts
    /// from defaults; it is only written on the first update.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = load_file(&path);
        Self::with_state(Some(path), current)
    }

    /// Store that never touches the filesystem.
    pub fn in_memory(initial: Settings) -> Self {
        Self::with_state(None, initial)
    }

    fn with_state(path: Option<PathBuf>, current: Settings) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path,
                current: Mutex::new(current),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Default location: `~/.config/tavern-narrator/settings.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tavern-narrator")
            .join("settings.json")
    }

    pub fn get(&self) -> Settings {
        self.current().clone()
    }

    /// Merge `patch` (a JSON object using the camelCase keys) over the
    /// current settings, persist, and notify listeners.
    pub fn update(&self, patch: Value) -> Result<Settings, SettingsError> {
        let Value::Object(patch) = patch else {
            return Err(SettingsError::NotAnObject);
        };

        let updated = {
            let mut current = self.current();
            let mut merged = match serde_json::to_value(&*current)? {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            for (key, value) in patch {
                merged.insert(key, value);
            }
            let updated: Settings = serde_json::from_value(Value::Object(merged))?;
            self.persist(&updated)?;
            *current = updated.clone();
            updated
        };

        debug!("Settings saved");
        self.notify(&updated);
        Ok(updated)
    }

    /// Restore the defaults, persist, and notify listeners.
    pub fn reset(&self) -> Result<Settings, SettingsError> {
        let defaults = Settings::default();
        self.persist(&defaults)?;
        *self.current() = defaults.clone();
        info!("Settings reset to defaults");
        self.notify(&defaults);
        Ok(defaults)
    }

    pub fn set_custom_voices(&self, voices: Vec<CustomVoice>) -> Result<Settings, SettingsError> {
        self.update(serde_json::json!({ "customVoices": voices }))
    }

    /// Register a listener called with the full settings after every change.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&Settings) + Send + Sync + 'static,
    {
        self.listeners().push(Arc::new(listener));
    }

    /// Listeners run outside the lock, so they may update the store or
    /// register further listeners.
    fn notify(&self, settings: &Settings) {
        let listeners: Vec<Listener> = self.listeners().clone();
        for (i, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(settings))).is_err() {
                error!("Settings listener #{i} panicked");
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };

        let write = |path: &Path| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(settings)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            fs::write(path, json)
        };

        write(path).map_err(|source| SettingsError::Write {
            path: path.clone(),
            source,
        })
    }

    fn current(&self) -> MutexGuard<'_, Settings> {
        self.inner.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn load_file(path: &Path) -> Settings {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No settings at {}, using defaults", path.display());
            return Settings::default();
        }
        Err(e) => {
            warn!("Failed to read {}: {e}, using defaults", path.display());
            return Settings::default();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(settings) => {
            info!("Loaded settings from {}", path.display());
            settings
        }
        Err(e) => {
            warn!("Failed to parse {}: {e}, using defaults", path.display());
            Settings::default()
        }
    }
}
