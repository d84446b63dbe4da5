//! Configuration loading and root folder resolution
//!
//! Missing or unreadable config files never stop startup: a warning is
//! logged and compiled defaults are used.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::{Error, Result};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "PARLEY_ROOT_FOLDER";

/// Session tuning knobs (`[session]` table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Anonymous submissions before an auth prompt is advised
    pub anonymous_quota: u32,
    /// Seconds a submission may stay pending before it errors
    pub pending_timeout_secs: u64,
    pub merge_max_attempts: u32,
    pub merge_initial_backoff_ms: u64,
    /// Consecutive resubscribe failures before the user is told
    pub resubscribe_failure_threshold: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            anonymous_quota: 5,
            pending_timeout_secs: 60,
            merge_max_attempts: 5,
            merge_initial_backoff_ms: 250,
            resubscribe_failure_threshold: 3,
        }
    }
}

/// Contents of `config.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub bind_addr: String,
    pub log_level: String,
    /// Where the auth callback redirects after sign-in
    pub allowed_origin: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    /// Endpoint that turns an OAuth code into a user id
    pub auth_exchange_url: Option<String>,
    pub session: SessionSettings,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            bind_addr: "127.0.0.1:8000".to_string(),
            log_level: "info".to_string(),
            allowed_origin: "http://localhost:3000".to_string(),
            gemini_api_key: None,
            gemini_model: "gemini-1.5-flash".to_string(),
            auth_exchange_url: None,
            session: SessionSettings::default(),
        }
    }
}

impl TomlConfig {
    /// Parse a config file, failing on unreadable or malformed content
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    /// Load from the platform config location, falling back to defaults
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        let path = match explicit.map(Path::to_path_buf).or_else(default_config_path) {
            Some(path) => path,
            None => {
                warn!("Could not determine config directory, using defaults");
                return Self::default();
            }
        };

        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::from_file(&path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Ignoring config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }
}

/// `~/.config/parley/config.toml` (or the platform equivalent)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("parley").join("config.toml"))
}

/// Root folder resolution in priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default data folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("parley"))
        .unwrap_or_else(|| PathBuf::from("./parley_data"))
}
