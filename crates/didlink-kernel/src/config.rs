//! Configuration loading from `~/.didlink/config.toml` with defaults.

use didlink_types::config::AgentConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Load agent configuration from a TOML file, with defaults.
///
/// A missing, unreadable, unparsable or invalid file yields the default
/// configuration; the problem is logged, not returned.
pub fn load_config(path: Option<&Path>) -> AgentConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return AgentConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return AgentConfig::default();
        }
    };

    match toml::from_str::<AgentConfig>(&contents) {
        Ok(config) => match config.validate() {
            Ok(()) => {
                info!(path = %config_path.display(), label = %config.label, "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Invalid config, using defaults"
                );
                AgentConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            AgentConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    didlink_home().join("config.toml")
}

/// Get the default didlink home directory.
pub fn didlink_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".didlink")
}
