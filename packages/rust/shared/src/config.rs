//! Application configuration for loadctl.
//!
//! User config lives at `~/.loadctl/loadctl.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LoadCtlError, Result};
use crate::types::{NewSource, WatermarkPolicy};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "loadctl.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".loadctl";

// ---------------------------------------------------------------------------
// Config structs (matching loadctl.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Control database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Watermark advancement policy.
    #[serde(default)]
    pub watermarks: WatermarkConfig,

    /// Sources registered by `source sync`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<NewSource>,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the control database file. `~` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// How long a writer waits on a locked database before failing.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_db_path() -> String {
    "~/.loadctl/control.db".into()
}
fn default_busy_timeout() -> u64 {
    5000
}

/// `[watermarks]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatermarkConfig {
    #[serde(default)]
    pub policy: WatermarkPolicy,
}

impl DatabaseConfig {
    /// Resolve the configured path, expanding a leading `~`.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        expand_home(&self.path)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.loadctl/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LoadCtlError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.loadctl/loadctl.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LoadCtlError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        LoadCtlError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LoadCtlError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    if path.exists() {
        return Err(LoadCtlError::config(format!(
            "{} already exists",
            path.display()
        )));
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LoadCtlError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LoadCtlError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| LoadCtlError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
