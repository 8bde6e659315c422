use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::{KvStore, StoreError};
use crate::transcode::OutputFormat;

pub const SETTINGS_STORAGE_KEY: &str = "settings";
pub const DEFAULT_FILENAME_PATTERN: &str = "{timestamp}_{index}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub filename: String,
    pub sub_dir: String,
    pub format: OutputFormat,
    pub quality: f32,
    pub auto_count: u32,
    /// Milliseconds between readiness polls.
    pub load_delay: u64,
    /// Milliseconds between generation cycles.
    pub repeat_delay: u64,
    pub show_buttons: bool,
    pub show_progress: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            filename: String::from(DEFAULT_FILENAME_PATTERN),
            sub_dir: String::new(),
            format: OutputFormat::Jpeg,
            quality: 1.0,
            auto_count: 0,
            load_delay: 500,
            repeat_delay: 1000,
            show_buttons: true,
            show_progress: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("failed to read settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse settings JSON '{path}': {message}")]
    ParseJson { path: String, message: String },
    #[error("failed to parse settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("settings root must be an object")]
    RootMustBeObject,
    #[error("invalid settings: {0}")]
    Invalid(String),
    #[error("settings store failed: {0}")]
    Store(String),
}

impl From<StoreError> for SettingsError {
    fn from(error: StoreError) -> Self {
        Self::Store(error.to_string())
    }
}

impl Settings {
    /// Loads from `.toml` or JSON. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|error| SettingsError::ReadFile {
            path: path.display().to_string(),
            message: error.to_string(),
        })?;
        let is_toml = path
            .extension()
            .and_then(|v| v.to_str())
            .is_some_and(|v| v.eq_ignore_ascii_case("toml"));
        let value = if is_toml {
            let parsed = toml::from_str::<toml::Value>(raw.as_str()).map_err(|error| {
                SettingsError::ParseToml {
                    path: path.display().to_string(),
                    message: error.to_string(),
                }
            })?;
            serde_json::to_value(parsed).map_err(|error| SettingsError::ParseToml {
                path: path.display().to_string(),
                message: error.to_string(),
            })?
        } else {
            serde_json::from_str::<Value>(raw.as_str()).map_err(|error| {
                SettingsError::ParseJson {
                    path: path.display().to_string(),
                    message: error.to_string(),
                }
            })?
        };
        Self::default().with_overlay(&value)
    }

    /// Reads the settings persisted under [`SETTINGS_STORAGE_KEY`].
    pub fn load_from_store(store: &dyn KvStore) -> Result<Self, SettingsError> {
        match store.get(SETTINGS_STORAGE_KEY)? {
            Some(value) => Self::default().with_overlay(&value),
            None => Ok(Self::default()),
        }
    }

    pub fn save_to_store(&self, store: &dyn KvStore) -> Result<(), SettingsError> {
        let value =
            serde_json::to_value(self).map_err(|error| SettingsError::Invalid(error.to_string()))?;
        store.set(SETTINGS_STORAGE_KEY, &value)?;
        Ok(())
    }

    /// Merges a partial object over these settings key by key. The object may
    /// be the settings themselves or wrap them under `settings`.
    pub fn with_overlay(&self, overlay: &Value) -> Result<Self, SettingsError> {
        let root = overlay.as_object().ok_or(SettingsError::RootMustBeObject)?;
        let changes = root
            .get(SETTINGS_STORAGE_KEY)
            .unwrap_or(overlay)
            .as_object()
            .ok_or(SettingsError::RootMustBeObject)?;

        let mut merged =
            serde_json::to_value(self).map_err(|error| SettingsError::Invalid(error.to_string()))?;
        if let Some(fields) = merged.as_object_mut() {
            for (key, value) in changes {
                fields.insert(key.clone(), value.clone());
            }
        }
        let settings = serde_json::from_value::<Self>(merged)
            .map_err(|error| SettingsError::Invalid(error.to_string()))?;
        Ok(settings.normalized())
    }

    /// Clamps quality and pins it to 1.0 for PNG.
    pub fn normalized(mut self) -> Self {
        self.quality = self.format.effective_quality(self.quality);
        if self.filename.trim().is_empty() {
            self.filename = String::from(DEFAULT_FILENAME_PATTERN);
        }
        self
    }

    pub fn load_delay(&self) -> Duration {
        Duration::from_millis(self.load_delay)
    }

    pub fn repeat_delay(&self) -> Duration {
        Duration::from_millis(self.repeat_delay)
    }
}
