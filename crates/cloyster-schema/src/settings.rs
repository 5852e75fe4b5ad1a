use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/cloyster/settings.toml";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/cloyster";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Orchestrator settings, loaded from `/etc/cloyster/settings.toml` when present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Host backend: `host` drives the live system, `mock` stays in memory.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub bus: BusSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            state_dir: None,
            retry: RetrySettings::default(),
            bus: BusSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BusSettings {
    /// Per-call timeout on the system bus.
    #[serde(default = "default_bus_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_bus_timeout_ms(),
        }
    }
}

fn default_backend() -> String {
    "host".to_owned()
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

// systemctl uses the same default.
fn default_bus_timeout_ms() -> u64 {
    25_000
}

impl Settings {
    pub fn parse(input: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load settings from `path`, falling back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, SettingsError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the state directory: explicit override, then `CLOYSTER_STATE_DIR`,
    /// then the settings file, then [`DEFAULT_STATE_DIR`].
    pub fn resolve_state_dir(&self, explicit: Option<&Path>) -> PathBuf {
        if let Some(dir) = explicit {
            return dir.to_path_buf();
        }
        if let Ok(dir) = std::env::var("CLOYSTER_STATE_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        self.state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
    }
}
